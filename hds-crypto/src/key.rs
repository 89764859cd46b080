//! Credential key derivation.
//!
//! A user credential (PIN or password) is stretched into a 256-bit key with
//! PBKDF2-HMAC-SHA256. The salt and iteration count are non-secret and are
//! persisted next to the ciphertext; the derived key itself only ever lives
//! in memory and is zeroized on drop.

use crate::error::{CryptoError, CryptoResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::Hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Derived key length in bytes (256-bit).
pub const KEY_SIZE: usize = 32;

/// Salt length in bytes.
pub const SALT_SIZE: usize = 16;

/// Default PBKDF2 iteration count.
///
/// Tuned for roughly 100-300ms of derivation on typical client hardware:
/// slow enough to resist offline brute force against short PINs, fast
/// enough that unlock stays interactive.
pub const DEFAULT_ITERATIONS: u32 = 310_000;

/// Random per-store salt. Non-secret, safe to persist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    /// Generates a fresh random salt from the OS RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| CryptoError::Encoding(format!("salt base64: {e}")))?;
        if bytes.len() != SALT_SIZE {
            return Err(CryptoError::Encoding(format!(
                "salt length: expected {SALT_SIZE}, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; SALT_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Hash algorithm identifier persisted with the KDF parameters.
///
/// Single variant today; the identifier is stored so a future scheme change
/// can tell old stores apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KdfAlgorithm {
    #[serde(rename = "pbkdf2-hmac-sha256")]
    Pbkdf2HmacSha256,
}

/// Key derivation parameters. Non-secret, safe to persist.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub iterations: u32,
    pub algorithm: KdfAlgorithm,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            algorithm: KdfAlgorithm::Pbkdf2HmacSha256,
        }
    }
}

/// A derived 256-bit key. Zeroized on drop, never persisted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_SIZE]);

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(..)")
    }
}

/// Derives a 256-bit key from a credential and salt.
///
/// Does not fail for any non-empty credential. Credential length and format
/// rules (PIN digits, password minimum) are enforced at the manager
/// boundary, not here.
pub fn derive_key(credential: &str, salt: &Salt, params: &KdfParams) -> CryptoResult<DerivedKey> {
    if credential.is_empty() {
        return Err(CryptoError::KeyDerivation("empty credential".into()));
    }

    let mut key = [0u8; KEY_SIZE];
    // PBKDF2 only fails if the output length exceeds 2^32 - 1 blocks,
    // which cannot happen with a 32-byte output.
    pbkdf2::pbkdf2::<Hmac<Sha256>>(
        credential.as_bytes(),
        salt.as_bytes(),
        params.iterations,
        &mut key,
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    Ok(DerivedKey(key))
}
