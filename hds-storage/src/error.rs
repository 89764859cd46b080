//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in the storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("key-value store error: {0}")]
    KeyValue(#[from] sled::Error),

    #[error("storage quota exceeded: {used} of {quota} bytes")]
    QuotaExceeded { used: u64, quota: u64 },

    #[error("no usable storage tier: {}", .details.join("; "))]
    Unsupported { details: Vec<String> },

    #[error("storage backend error: {0}")]
    Backend(String),
}
