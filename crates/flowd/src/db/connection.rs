//! SQLite connection pool for the durable store.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::sync::Arc;

/// The pool handed to the snapshot and event-log repositories.
pub type DatabasePool = SqlitePool;

/// Owns the pool for one workflow's database. Only the scheduler loop
/// writes through it; everything else reads the in-memory data store.
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Arc<DatabasePool>,
}

impl DatabaseConnection {
    /// Open (or create) the database at `database_url`, e.g.
    /// `sqlite://run/flowd.db?mode=rwc` or `sqlite::memory:` in tests.
    /// A handful of connections is plenty: the store has exactly one
    /// writer.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool: Arc::new(pool) })
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Apply any pending schema migrations bundled with the crate.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await
    }

    /// Cheap liveness probe run once at startup, before the scheduler
    /// commits to this database.
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").fetch_one(self.pool.as_ref()).await?;
        Ok(())
    }

    /// Close every connection. The store is unusable afterwards.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
