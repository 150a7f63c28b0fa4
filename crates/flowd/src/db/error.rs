//! Typed errors for the durable store.

use thiserror::Error;

/// What went wrong talking to the snapshot database or event log.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database connection failed: {0}")]
    Connection(String),

    #[error("no matching row: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("row decode failed: {0}")]
    TypeError(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("query failed: {0}")]
    Query(String),
}

impl DatabaseError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DatabaseError::NotFound(_))
    }
}

/// Result type for store operations.
pub type DbResult<T> = std::result::Result<T, DatabaseError>;

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("row not found".to_string()),
            sqlx::Error::ColumnNotFound(col) => {
                DatabaseError::TypeError(format!("column not found: {col}"))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DatabaseError::TypeError(format!("decoding column {index}: {source}"))
            }
            sqlx::Error::Decode(source) => DatabaseError::TypeError(source.to_string()),
            sqlx::Error::Configuration(msg) => DatabaseError::Connection(msg.to_string()),
            sqlx::Error::Io(err) => DatabaseError::Connection(err.to_string()),
            sqlx::Error::PoolTimedOut => {
                DatabaseError::Connection("connection pool timed out".to_string())
            }
            sqlx::Error::PoolClosed => {
                DatabaseError::Connection("connection pool is closed".to_string())
            }
            sqlx::Error::Migrate(err) => DatabaseError::Migration(err.to_string()),
            err => DatabaseError::Query(err.to_string()),
        }
    }
}
