//! Encryption layer for HDS secure storage.
//!
//! Provides the two cryptographic primitives the secure store is built on:
//!
//! - PBKDF2-HMAC-SHA256 key derivation from a user credential (PIN or
//!   password), with a persisted salt and iteration count
//! - ChaCha20-Poly1305 authenticated encryption of record payloads
//!
//! The derived key is never persisted anywhere. It exists in memory only
//! while the store is unlocked and is zeroized on drop. Everything that does
//! reach a storage tier is an [`EncryptedPayload`] envelope: ciphertext plus
//! the non-secret parameters (salt, nonce, tag length, format version)
//! needed to decrypt it again with a re-derived key.
//!
//! Decryption fails closed. A wrong key and tampered ciphertext both surface
//! as the same opaque [`CryptoError::DecryptionFailed`], so callers cannot be
//! used as a padding/key oracle; the distinguishing branch is logged at
//! `debug!` level only.

mod cipher;
mod error;
mod key;

pub use cipher::{decrypt, encrypt, EncryptedPayload, NONCE_SIZE, PAYLOAD_VERSION, TAG_SIZE};
pub use error::{CryptoError, CryptoResult};
pub use key::{
    derive_key, DerivedKey, KdfAlgorithm, KdfParams, Salt, DEFAULT_ITERATIONS, KEY_SIZE, SALT_SIZE,
};
