mod error;
pub mod repos;
pub mod sqlite;

#[cfg(test)]
pub mod tests;

use std::{sync::Arc, time::Duration};

pub use error::{DbError, DbResult};
pub use repos::*;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::DatabaseConfig;

/// Owner of the database connection pool and the repositories built on it.
///
/// Nothing else in the crate opens or closes the database.
pub struct DbPool {
    pool: SqlitePool,
    spend: Arc<dyn SpendRepo>,
}

impl DbPool {
    /// Create a DbPool from an existing SQLite pool.
    pub fn from_sqlite(pool: SqlitePool) -> Self {
        Self {
            spend: Arc::new(sqlite::SqliteSpendRepo::new(pool.clone())),
            pool,
        }
    }

    /// Create a database pool from configuration
    pub async fn from_config(config: &DatabaseConfig) -> DbResult<Self> {
        match config {
            DatabaseConfig::None => Err(DbError::NotConfigured),
            DatabaseConfig::Sqlite(cfg) => {
                let pool = SqlitePoolOptions::new()
                    .max_connections(cfg.max_connections)
                    .connect_with(
                        SqliteConnectOptions::new()
                            .filename(&cfg.path)
                            .create_if_missing(cfg.create_if_missing)
                            .journal_mode(if cfg.wal_mode {
                                SqliteJournalMode::Wal
                            } else {
                                SqliteJournalMode::Delete
                            })
                            .busy_timeout(Duration::from_millis(cfg.busy_timeout_ms)),
                    )
                    .await?;

                let db = Self::from_sqlite(pool);
                if cfg.run_migrations {
                    db.run_migrations().await?;
                }
                tracing::info!(path = %cfg.path, "Opened SQLite database");
                Ok(db)
            }
        }
    }

    pub async fn run_migrations(&self) -> DbResult<()> {
        sqlx::migrate!("./migrations_sqlx/sqlite")
            .run(&self.pool)
            .await?;
        Ok(())
    }

    pub fn spend(&self) -> Arc<dyn SpendRepo> {
        Arc::clone(&self.spend)
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close all connections. Safe to call more than once.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
