//! Store-wide integrity verification.
//!
//! Re-decrypts every stored payload and checks the deserialized shape.
//! The scan never mutates anything and never stops at the first problem:
//! the report lists every failing entity, not just the first.

use crate::error::SecureResult;
use hds_crypto::{DerivedKey, EncryptedPayload};
use hds_storage::PayloadStore;
use serde::Serialize;
use tracing::warn;

/// Result of checking one stored payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CheckOutcome {
    Valid,
    /// The stored bytes are not a parseable envelope.
    MalformedEnvelope,
    /// Authenticated decryption failed (tampering or corruption).
    DecryptFailed,
    /// Decryption succeeded but the plaintext is not a JSON document.
    InvalidJson,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCheck {
    pub entity_type: String,
    pub id: u64,
    pub outcome: CheckOutcome,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub overall_valid: bool,
    pub results: Vec<EntityCheck>,
}

pub(crate) fn scan(
    store: &dyn PayloadStore,
    key: &DerivedKey,
    entity_types: &[String],
) -> SecureResult<IntegrityReport> {
    let mut results = Vec::new();
    for entity_type in entity_types {
        for id in store.list(entity_type)? {
            let Some(bytes) = store.get(entity_type, id)? else {
                continue;
            };
            let outcome = check_one(&bytes, key);
            if outcome != CheckOutcome::Valid {
                warn!(entity_type = %entity_type, id, ?outcome, "integrity check failed");
            }
            results.push(EntityCheck {
                entity_type: entity_type.clone(),
                id,
                outcome,
            });
        }
    }
    Ok(IntegrityReport {
        overall_valid: results.iter().all(|r| r.outcome == CheckOutcome::Valid),
        results,
    })
}

fn check_one(bytes: &[u8], key: &DerivedKey) -> CheckOutcome {
    let Ok(payload) = serde_json::from_slice::<EncryptedPayload>(bytes) else {
        return CheckOutcome::MalformedEnvelope;
    };
    let Ok(plaintext) = hds_crypto::decrypt(key, &payload) else {
        return CheckOutcome::DecryptFailed;
    };
    if serde_json::from_slice::<serde_json::Value>(&plaintext).is_ok() {
        CheckOutcome::Valid
    } else {
        CheckOutcome::InvalidJson
    }
}
