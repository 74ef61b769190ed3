#[cfg(feature = "pg")]
pub mod pg;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::fmt::Debug;

use async_trait::async_trait;
use sea_orm::DatabaseConnection;
use sea_orm::DbErr;
use sea_orm_migration::MigratorTrait;

use super::migrations::Migrator;
use super::DbCatalog;

#[async_trait]
pub trait DatabaseDriver: Debug + Sync + Send + 'static {
    fn connection(&self) -> DatabaseConnection;

    /// Backend-specific session tuning.
    async fn configure(&self) -> Result<(), DbErr>;

    async fn checkpoint(&self) -> Result<(), DbErr>;

    /// Applies all pending migrations.
    async fn migrate(&self) -> Result<(), DbErr> {
        Migrator::up(&self.connection(), None).await
    }

    /// Drops and re-creates the schema.
    async fn reset(&self) -> Result<(), DbErr> {
        let db = self.connection();
        Migrator::down(&db, None).await?;
        Migrator::up(&db, None).await
    }

    fn catalog(&self) -> DbCatalog {
        DbCatalog::new(self.connection())
    }
}
