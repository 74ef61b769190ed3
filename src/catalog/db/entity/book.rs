use sea_orm::entity::prelude::*;
use serde::Deserialize;
use serde::Serialize;

use crate::types::Item;
use crate::types::ItemId;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "books")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id:             i32,
    pub title:          String,
    pub author:         String,
    #[sea_orm(unique)]
    pub isbn:           Option<String>,
    pub price:          f64,
    pub description:    Option<String>,
    pub stock:          i32,
    pub category:       Option<String>,
    pub published_year: Option<i32>,
    pub created_at:     DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for Item {
    fn from(book: Model) -> Self {
        Item {
            id:             ItemId(book.id),
            title:          book.title,
            author:         book.author,
            isbn:           book.isbn,
            price:          book.price,
            category:       book.category,
            published_year: book.published_year,
            stock:          book.stock,
        }
    }
}
