//! Store error types

use thiserror::Error;

/// Errors surfaced by a knowledge store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No transaction is open")]
    NoTransaction,

    #[error("A transaction is already open")]
    TransactionOpen,

    #[error("Store rejected operation: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Check if this error means another writer holds the database lock
    pub fn is_lock_conflict(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
