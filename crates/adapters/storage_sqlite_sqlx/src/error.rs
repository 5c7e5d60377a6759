//! Storage-specific error type wrapping sqlx errors.

use rascal_domain::error::RascalError;

/// Errors originating from the `SQLite` storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A query or connection failed.
    #[error("database error")]
    Database(#[from] sqlx::Error),

    /// A stored history column is not a JSON array of numbers.
    #[error("JSON serialization error")]
    Json(#[from] serde_json::Error),

    /// Failed to run migrations.
    #[error("migration error")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<StorageError> for RascalError {
    fn from(err: StorageError) -> Self {
        Self::storage(err)
    }
}
