//! Authenticated encryption of payload envelopes.
//!
//! Every record the secure store persists is one [`EncryptedPayload`]:
//! ChaCha20-Poly1305 ciphertext plus the non-secret parameters needed to
//! decrypt it again. The envelope is self-contained — the KDF salt is
//! embedded per payload, so a backup artifact needs no external key
//! material beyond the credential itself.

use crate::error::{CryptoError, CryptoResult};
use crate::key::{DerivedKey, Salt};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// ChaCha20-Poly1305 nonce length in bytes.
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag length in bytes.
pub const TAG_SIZE: usize = 16;

/// Current envelope format version.
pub const PAYLOAD_VERSION: u32 = 1;

/// Persisted envelope — the only thing ever written to a storage tier.
///
/// Immutable once written: any change to the plaintext produces a whole new
/// envelope with a fresh random `iv`. A nonce is never reused under the
/// same key.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    /// KDF salt, base64. Embedded so the payload is self-contained.
    pub salt: String,
    /// ChaCha20-Poly1305 nonce, base64.
    pub iv: String,
    /// Ciphertext including the trailing Poly1305 tag, base64.
    pub ciphertext: String,
    pub tag_length: u32,
}

impl EncryptedPayload {
    /// Parses the salt embedded in this envelope.
    pub fn embedded_salt(&self) -> CryptoResult<Salt> {
        Salt::from_base64(&self.salt)
    }
}

/// Encrypts a plaintext under the derived key.
///
/// A fresh random nonce is drawn from the OS RNG for every call. The salt
/// is the one the key was derived from; it is embedded verbatim.
pub fn encrypt(
    key: &DerivedKey,
    salt: &Salt,
    plaintext: &[u8],
    timestamp: DateTime<Utc>,
) -> CryptoResult<EncryptedPayload> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(EncryptedPayload {
        version: PAYLOAD_VERSION,
        timestamp,
        salt: salt.to_base64(),
        iv: BASE64.encode(nonce_bytes),
        ciphertext: BASE64.encode(&ciphertext),
        tag_length: TAG_SIZE as u32,
    })
}

/// Decrypts an envelope with the derived key.
///
/// Fails closed: a wrong key, a flipped ciphertext or nonce bit, a malformed
/// field and an unknown format version all surface as the same opaque
/// [`CryptoError::DecryptionFailed`]. Which branch fired is logged at debug
/// level only.
pub fn decrypt(key: &DerivedKey, payload: &EncryptedPayload) -> CryptoResult<Vec<u8>> {
    if payload.version != PAYLOAD_VERSION {
        debug!(version = payload.version, "rejected payload: unknown format version");
        return Err(CryptoError::DecryptionFailed);
    }
    if payload.tag_length as usize != TAG_SIZE {
        debug!(tag_length = payload.tag_length, "rejected payload: unexpected tag length");
        return Err(CryptoError::DecryptionFailed);
    }

    let iv = match BASE64.decode(&payload.iv) {
        Ok(iv) if iv.len() == NONCE_SIZE => iv,
        Ok(iv) => {
            debug!(len = iv.len(), "rejected payload: bad nonce length");
            return Err(CryptoError::DecryptionFailed);
        }
        Err(_) => {
            debug!("rejected payload: nonce is not valid base64");
            return Err(CryptoError::DecryptionFailed);
        }
    };

    let ciphertext = match BASE64.decode(&payload.ciphertext) {
        Ok(ct) => ct,
        Err(_) => {
            debug!("rejected payload: ciphertext is not valid base64");
            return Err(CryptoError::DecryptionFailed);
        }
    };

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
        .map_err(|_| {
            debug!("rejected payload: authentication tag mismatch (wrong key or tampered data)");
            CryptoError::DecryptionFailed
        })
}
