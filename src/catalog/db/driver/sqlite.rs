use std::ops::Deref;
use std::path::Path;

use async_trait::async_trait;
use fieldx::fxstruct;
use sea_orm::ConnectOptions;
use sea_orm::ConnectionTrait;
use sea_orm::DatabaseConnection;
use sea_orm::DbErr;
use sea_orm_migration::IntoSchemaManagerConnection;
use sea_orm_migration::SchemaManagerConnection;
use tracing::error;

use super::DatabaseDriver;

#[derive(Debug, Clone)]
#[fxstruct(sync, no_new)]
pub struct Sqlite {
    connection: DatabaseConnection,
}

impl Sqlite {
    pub async fn connect(db_dir: &Path, db_name: &str) -> Result<Self, DbErr> {
        let db_path = db_dir.join(db_name);
        let schema = format!("sqlite://{}?mode=rwc", db_path.display());
        Self::open(ConnectOptions::new(schema)).await
    }

    /// A private in-memory database. Lives as long as the only pooled connection does.
    pub async fn in_memory() -> Result<Self, DbErr> {
        let mut opts = ConnectOptions::new("sqlite::memory:");
        opts.max_connections(1).min_connections(1).sqlx_logging(false);
        Self::open(opts).await
    }

    async fn open(opts: ConnectOptions) -> Result<Self, DbErr> {
        let url = opts.get_url().to_string();
        let connection = sea_orm::Database::connect(opts)
            .await
            .inspect_err(|e| error!("Error connecting to database {url}: {e}"))?;

        Ok(Self { connection })
    }
}

#[async_trait]
impl DatabaseDriver for Sqlite {
    fn connection(&self) -> DatabaseConnection {
        self.connection.clone()
    }

    async fn configure(&self) -> Result<(), DbErr> {
        let db = &self.connection;

        db.execute_unprepared("PRAGMA journal_mode=WAL;").await?;
        db.execute_unprepared("PRAGMA cache_size=64000;").await?;
        db.execute_unprepared("PRAGMA synchronous=NORMAL;").await?;
        db.execute_unprepared("PRAGMA foreign_keys=ON;").await?;

        Ok(())
    }

    async fn checkpoint(&self) -> Result<(), DbErr> {
        self.connection.execute_unprepared("PRAGMA wal_checkpoint;").await?;

        Ok(())
    }
}

impl Deref for Sqlite {
    type Target = DatabaseConnection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl<'c> IntoSchemaManagerConnection<'c> for &'c Sqlite {
    fn into_schema_manager_connection(self) -> SchemaManagerConnection<'c> {
        SchemaManagerConnection::Connection(&self.connection)
    }
}
