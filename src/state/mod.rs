/// Persistence layer.
///
/// `Database` wraps the SQLite pool and migrations; `Repository` provides
/// the typed query set plus the process-wide user/group cache. Queries are
/// runtime-checked so builds never need a live database.
pub mod models;
pub mod repository;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::{Error, Result};

pub use repository::Repository;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) and migrate the database at `path`.
    /// `":memory:"` opens a private in-memory database.
    pub async fn connect(path: &str) -> Result<Self> {
        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{path}")
        };

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| Error::CantOpenDatabase(path.to_string(), e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database exists per connection; keep exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await
            .map_err(|e| Error::CantOpenDatabase(path.to_string(), e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::CantOpenDatabase(path.to_string(), e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin the per-request transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }
}
