//! Byte-store error types.

use thiserror::Error;

/// Result type for byte-store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by a [`KvStore`](crate::KvStore) backend.
///
/// Every variant represents a failure at the storage boundary; callers
/// treat them as transient.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("storage I/O failure: {0}")]
    Io(String),
}
