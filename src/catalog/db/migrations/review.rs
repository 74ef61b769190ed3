use sea_orm_migration::prelude::*;

use super::book::Books;
use super::user::Users;
use crate::types::Score;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "review_migration"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Reviews::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Reviews::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Reviews::BookId).integer().not_null())
                    .col(ColumnDef::new(Reviews::UserId).integer().not_null())
                    .col(
                        ColumnDef::new(Reviews::Rating)
                            .integer()
                            .not_null()
                            .check(Expr::col(Reviews::Rating).between(Score::MIN, Score::MAX)),
                    )
                    .col(ColumnDef::new(Reviews::Comment).text())
                    .col(ColumnDef::new(Reviews::CreatedAt).timestamp_with_time_zone().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-reviews-book_id")
                            .from(Reviews::Table, Reviews::BookId)
                            .to(Books::Table, Books::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-reviews-user_id")
                            .from(Reviews::Table, Reviews::UserId)
                            .to(Users::Table, Users::Id),
                    )
                    .to_owned(),
            )
            .await?;

        // Both the grouped aggregation and the per-rater lookup go through these.
        for (name, col) in [("idx-reviews-book_id", Reviews::BookId), ("idx-reviews-user_id", Reviews::UserId)] {
            manager
                .create_index(Index::create().name(name).table(Reviews::Table).col(col).to_owned())
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.drop_table(Table::drop().table(Reviews::Table).to_owned()).await
    }
}

#[derive(Iden)]
enum Reviews {
    Table,
    Id,
    BookId,
    UserId,
    Rating,
    Comment,
    CreatedAt,
}
