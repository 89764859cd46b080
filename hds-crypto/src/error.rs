//! Crypto error types.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur during key derivation and encryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Deliberately opaque: a wrong key and tampered ciphertext are
    /// indistinguishable to callers. The failing branch is logged
    /// internally at debug level only.
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid encoding: {0}")]
    Encoding(String),
}
