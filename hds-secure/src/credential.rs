//! User credentials.
//!
//! A credential is the only input to key derivation and is never persisted
//! in any form. Format rules are enforced here, at the manager boundary;
//! the crypto layer accepts any non-empty secret.

use crate::error::{SecureError, SecureResult};
use zeroize::Zeroizing;

/// Minimum password length in characters.
pub const MIN_PASSWORD_CHARS: usize = 8;

/// PIN length bounds in digits.
pub const PIN_DIGITS: std::ops::RangeInclusive<usize> = 4..=8;

/// An unlock secret: a short numeric PIN or a full password.
///
/// The secret is zeroized when the credential is dropped and is redacted
/// from `Debug` output.
pub enum Credential {
    Pin(Zeroizing<String>),
    Password(Zeroizing<String>),
}

impl Credential {
    pub fn pin(digits: impl Into<String>) -> Self {
        Self::Pin(Zeroizing::new(digits.into()))
    }

    pub fn password(secret: impl Into<String>) -> Self {
        Self::Password(Zeroizing::new(secret.into()))
    }

    /// The raw secret, for key derivation only.
    pub(crate) fn expose(&self) -> &str {
        match self {
            Self::Pin(s) | Self::Password(s) => s,
        }
    }

    /// Enforces the credential format policy.
    pub fn validate(&self) -> SecureResult<()> {
        match self {
            Self::Pin(digits) => {
                if !PIN_DIGITS.contains(&digits.len())
                    || !digits.chars().all(|c| c.is_ascii_digit())
                {
                    return Err(SecureError::CredentialPolicy {
                        reason: format!(
                            "PIN must be {}-{} digits",
                            PIN_DIGITS.start(),
                            PIN_DIGITS.end()
                        ),
                    });
                }
            }
            Self::Password(secret) => {
                if secret.chars().count() < MIN_PASSWORD_CHARS {
                    return Err(SecureError::CredentialPolicy {
                        reason: format!("password must be at least {MIN_PASSWORD_CHARS} characters"),
                    });
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pin(_) => f.write_str("Credential::Pin(<redacted>)"),
            Self::Password(_) => f.write_str("Credential::Password(<redacted>)"),
        }
    }
}
