use sea_orm::entity::prelude::*;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ScoreError;
use crate::types::ItemId;
use crate::types::RatingEvent;
use crate::types::Score;
use crate::types::UserId;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "reviews")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id:         i32,
    pub book_id:    i32,
    pub user_id:    i32,
    /// 1 to 5
    pub rating:     i32,
    pub comment:    Option<String>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for RatingEvent {
    type Error = ScoreError;

    fn try_from(review: Model) -> Result<Self, Self::Error> {
        Ok(RatingEvent {
            item_id:   ItemId(review.book_id),
            rater_id:  UserId(review.user_id),
            score:     Score::new(review.rating)?,
            timestamp: review.created_at,
        })
    }
}
