//! SeaORM-backed catalog: `books`, `users` and `reviews` tables.
//!
//! Rating summaries are produced by one grouped query:
//!
//! ```sql
//! SELECT book_id, COUNT(id), SUM(rating) FROM reviews [WHERE ...] GROUP BY book_id ORDER BY book_id
//! ```
pub mod driver;
pub mod entity;
pub mod migrations;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::ActiveValue::NotSet;
use sea_orm::ActiveValue::Set;
use sea_orm::ColumnTrait;
use sea_orm::DatabaseConnection;
use sea_orm::DbErr;
use sea_orm::EntityTrait;
use sea_orm::QueryFilter;
use sea_orm::QueryOrder;
use sea_orm::QuerySelect;
use sea_orm::Select;
use sea_orm::TransactionTrait;
use tracing::debug;
use tracing::instrument;

use crate::traits::CatalogReader;
use crate::types::Item;
use crate::types::ItemId;
use crate::types::RatingEvent;
use crate::types::RatingScope;
use crate::types::RatingTally;
use crate::types::Score;

use entity::book;
use entity::review;
use entity::user;

// Rows per INSERT statement; keeps the number of bound parameters well under SQLite's limit.
const INSERT_CHUNK: usize = 100;

#[derive(Debug, Clone)]
pub struct DbCatalog {
    connection: DatabaseConnection,
}

impl DbCatalog {
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    #[instrument(level = "debug", skip_all)]
    pub async fn store_items<I>(&self, items: I) -> Result<(), DbErr>
    where
        I: IntoIterator<Item = Item>,
    {
        let now = Utc::now();
        let rows: Vec<_> = items
            .into_iter()
            .map(|item| book::ActiveModel {
                id:             Set(item.id.0),
                title:          Set(item.title),
                author:         Set(item.author),
                isbn:           Set(item.isbn),
                price:          Set(item.price),
                description:    Set(None),
                stock:          Set(item.stock),
                category:       Set(item.category),
                published_year: Set(item.published_year),
                created_at:     Set(now),
            })
            .collect();

        let count = rows.len();
        let txn = self.connection.begin().await?;
        for chunk in rows.chunks(INSERT_CHUNK) {
            book::Entity::insert_many(chunk.to_vec()).exec(&txn).await?;
        }
        txn.commit().await?;

        debug!("stored {count} book(s)");
        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    pub async fn store_users<I>(&self, users: I) -> Result<(), DbErr>
    where
        I: IntoIterator<Item = user::Model>,
    {
        let rows: Vec<_> = users
            .into_iter()
            .map(|u| user::ActiveModel {
                id:         Set(u.id),
                username:   Set(u.username),
                email:      Set(u.email),
                created_at: Set(u.created_at),
            })
            .collect();

        let count = rows.len();
        let txn = self.connection.begin().await?;
        for chunk in rows.chunks(INSERT_CHUNK) {
            user::Entity::insert_many(chunk.to_vec()).exec(&txn).await?;
        }
        txn.commit().await?;

        debug!("stored {count} user(s)");
        Ok(())
    }

    /// Rating events are append-only: every event becomes a new review row.
    #[instrument(level = "debug", skip_all)]
    pub async fn store_ratings<I>(&self, events: I) -> Result<(), DbErr>
    where
        I: IntoIterator<Item = RatingEvent>,
    {
        let rows: Vec<_> = events
            .into_iter()
            .map(|e| review::ActiveModel {
                id:         NotSet,
                book_id:    Set(e.item_id.0),
                user_id:    Set(e.rater_id.0),
                rating:     Set(e.score.get()),
                comment:    Set(None),
                created_at: Set(e.timestamp),
            })
            .collect();

        let count = rows.len();
        let txn = self.connection.begin().await?;
        for chunk in rows.chunks(INSERT_CHUNK) {
            review::Entity::insert_many(chunk.to_vec()).exec(&txn).await?;
        }
        txn.commit().await?;

        debug!("stored {count} review(s)");
        Ok(())
    }

    fn reviews_in(scope: &RatingScope) -> Select<review::Entity> {
        let select = review::Entity::find();
        match scope {
            RatingScope::All => select,
            RatingScope::Items(ids) => select.filter(review::Column::BookId.is_in(ids.iter().map(|id| id.0))),
            RatingScope::Rater(rater) => select.filter(review::Column::UserId.eq(rater.0)),
        }
    }
}

#[async_trait]
impl CatalogReader for DbCatalog {
    type Error = DbErr;

    async fn fetch_catalog_page(&self, offset: u64, limit: u64) -> Result<Vec<Item>, Self::Error> {
        let books = book::Entity::find()
            .order_by_asc(book::Column::Id)
            .offset(offset)
            .limit(limit)
            .all(&self.connection)
            .await?;

        Ok(books.into_iter().map(Item::from).collect())
    }

    async fn fetch_rating_events(&self, scope: &RatingScope) -> Result<Vec<RatingEvent>, Self::Error> {
        let reviews = Self::reviews_in(scope)
            .order_by_asc(review::Column::Id)
            .all(&self.connection)
            .await?;

        reviews
            .into_iter()
            .map(|r| RatingEvent::try_from(r).map_err(|e| DbErr::Custom(e.to_string())))
            .collect()
    }

    #[instrument(level = "trace", skip(self))]
    async fn aggregate_ratings(&self, scope: &RatingScope) -> Result<Vec<RatingTally>, Self::Error> {
        // Ratings outside of the score range are refused by fetch_rating_events; keep them out of the tallies too.
        let rows: Vec<(i32, i64, i64)> = Self::reviews_in(scope)
            .filter(review::Column::Rating.between(Score::MIN, Score::MAX))
            .select_only()
            .column(review::Column::BookId)
            .column_as(Expr::col(review::Column::Id).count(), "count")
            .column_as(Expr::col(review::Column::Rating).sum(), "sum")
            .group_by(review::Column::BookId)
            .order_by_asc(review::Column::BookId)
            .into_tuple()
            .all(&self.connection)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(book_id, count, sum)| RatingTally {
                item_id: ItemId(book_id),
                count: count.max(0) as u64,
                sum,
            })
            .collect())
    }
}
