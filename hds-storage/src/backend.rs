//! The tier-independent storage contract.

use crate::error::{StorageError, StorageResult};
use serde::Serialize;

/// Which physical tier is backing the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Tier {
    Database,
    KeyValue,
    Memory,
}

impl Tier {
    /// Whether data in this tier survives a process restart.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, Tier::Memory)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Database => f.write_str("database"),
            Tier::KeyValue => f.write_str("key-value"),
            Tier::Memory => f.write_str("memory"),
        }
    }
}

/// Persistence contract shared by every tier.
///
/// Values are opaque ciphertext envelopes; the metadata namespace holds the
/// small non-secret records (KDF parameters, verification token) the manager
/// needs before any key exists.
pub trait PayloadStore: Send + Sync + std::fmt::Debug {
    /// Stores (upserts) an envelope for an entity.
    fn put(&self, entity_type: &str, id: u64, envelope: &[u8]) -> StorageResult<()>;

    /// Retrieves an envelope, or `None` if absent.
    fn get(&self, entity_type: &str, id: u64) -> StorageResult<Option<Vec<u8>>>;

    /// Lists all ids of an entity type in ascending order.
    fn list(&self, entity_type: &str) -> StorageResult<Vec<u64>>;

    /// Deletes an envelope. Returns whether it existed.
    fn delete(&self, entity_type: &str, id: u64) -> StorageResult<bool>;

    /// Number of stored envelopes of an entity type.
    fn count(&self, entity_type: &str) -> StorageResult<usize>;

    /// Total stored payload bytes across all entity types.
    fn size(&self) -> StorageResult<u64>;

    /// Stores (upserts) a non-secret metadata record.
    fn put_meta(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Retrieves a metadata record, or `None` if absent.
    fn get_meta(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Irreversibly removes every envelope and metadata record.
    fn clear(&self) -> StorageResult<()>;

    fn tier(&self) -> Tier;
}

/// Quota check shared by every tier: projects the size after a put and
/// rejects writes that would exceed the configured cap.
pub(crate) fn ensure_quota(
    quota: Option<u64>,
    current: u64,
    replaced: u64,
    incoming: u64,
) -> StorageResult<()> {
    if let Some(quota) = quota {
        let projected = current.saturating_sub(replaced) + incoming;
        if projected > quota {
            return Err(StorageError::QuotaExceeded {
                used: projected,
                quota,
            });
        }
    }
    Ok(())
}
