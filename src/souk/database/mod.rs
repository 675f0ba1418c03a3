use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

pub mod messages;
pub mod notifications;
pub mod profiles;
pub mod push_registrations;
pub(crate) mod utils;

pub static MIGRATOR: LazyLock<Migrator> = LazyLock::new(|| sqlx::migrate!("./db_migrations"));

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database operation failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid column value for {column}: {reason}")]
    InvalidColumn { column: String, reason: String },
}

#[derive(Clone, Debug)]
pub struct Database {
    pub pool: SqlitePool,
    pub path: PathBuf,
}

impl Database {
    /// Opens (creating if needed) the sqlite database at `db_path` and
    /// runs any pending migrations.
    pub async fn new(db_path: &Path) -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(5000))
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self {
            pool,
            path: db_path.to_path_buf(),
        })
    }

    /// Drops every table and re-runs migrations, leaving an empty schema.
    pub async fn delete_all_data(&self) -> Result<(), DatabaseError> {
        tracing::debug!(
            target: "souk::database::delete_all_data",
            "Deleting all data from database"
        );

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&self.pool)
        .await?;

        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&self.pool)
            .await?;

        for (table,) in &tables {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                .execute(&self.pool)
                .await?;
        }

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        MIGRATOR.run(&self.pool).await?;

        Ok(())
    }
}
