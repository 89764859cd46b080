//! Secure manager error taxonomy.
//!
//! Expected user-facing failures (`WrongCredential`, `Locked`,
//! `QuotaExceeded`) are ordinary typed results for the UI to render.
//! `DemoIsolationViolation` is a defect class: it indicates a caller bug,
//! is logged loudly at the point of rejection, and must never be shown to
//! the end user as a normal error.

use hds_crypto::CryptoError;
use hds_storage::StorageError;
use thiserror::Error;

/// Result type for secure manager operations.
pub type SecureResult<T> = Result<T, SecureError>;

/// Errors surfaced by the secure manager.
#[derive(Debug, Error)]
pub enum SecureError {
    #[error("secure storage is not configured")]
    NotConfigured,

    #[error("secure storage is already configured")]
    AlreadyConfigured,

    #[error("secure storage is locked")]
    Locked,

    /// Opaque by design: a wrong secret and corrupted ciphertext are
    /// indistinguishable to callers.
    #[error("wrong credential")]
    WrongCredential,

    #[error("credential rejected: {reason}")]
    CredentialPolicy { reason: String },

    #[error("no usable storage tier: {}", .details.join("; "))]
    UnsupportedEnvironment { details: Vec<String> },

    #[error("demo isolation violation in `{operation}`: secure storage must never be used in a demo session")]
    DemoIsolationViolation { operation: String },

    #[error("unsupported backup format version {found} (supported: {supported})")]
    ImportFormat { found: u32, supported: u32 },

    #[error("backup manifest invalid: {0}")]
    ImportManifest(String),

    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("storage quota exceeded: {used} of {quota} bytes")]
    QuotaExceeded { used: u64, quota: u64 },

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for SecureError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::QuotaExceeded { used, quota } => SecureError::QuotaExceeded { used, quota },
            StorageError::Unsupported { details } => SecureError::UnsupportedEnvironment { details },
            other => SecureError::Storage(other),
        }
    }
}

impl From<CryptoError> for SecureError {
    fn from(e: CryptoError) -> Self {
        match e {
            // Keep the no-oracle property end to end: decryption failure
            // stays opaque at the manager boundary too.
            CryptoError::DecryptionFailed => SecureError::WrongCredential,
            other => SecureError::Crypto(other.to_string()),
        }
    }
}
