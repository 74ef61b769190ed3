use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "book_migration"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Books::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Books::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Books::Title).string_len(255).not_null())
                    .col(ColumnDef::new(Books::Author).string_len(255).not_null())
                    .col(ColumnDef::new(Books::Isbn).string_len(13).unique_key())
                    .col(ColumnDef::new(Books::Price).double().not_null())
                    .col(ColumnDef::new(Books::Description).text())
                    .col(ColumnDef::new(Books::Stock).integer().not_null().default(0))
                    .col(ColumnDef::new(Books::Category).string_len(100))
                    .col(ColumnDef::new(Books::PublishedYear).integer())
                    .col(ColumnDef::new(Books::CreatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        for (name, col) in [("idx-books-title", Books::Title), ("idx-books-author", Books::Author)] {
            manager
                .create_index(Index::create().name(name).table(Books::Table).col(col).to_owned())
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.drop_table(Table::drop().table(Books::Table).to_owned()).await
    }
}

#[derive(Iden)]
pub(super) enum Books {
    Table,
    Id,
    Title,
    Author,
    Isbn,
    Price,
    Description,
    Stock,
    Category,
    PublishedYear,
    CreatedAt,
}
