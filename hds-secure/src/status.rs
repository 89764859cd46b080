//! Read-only status snapshot.

use hds_storage::Tier;
use serde::Serialize;
use std::collections::BTreeMap;

/// Snapshot of the secure store, recomputed on every request so it is never
/// stale across lock/unlock transitions.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub is_configured: bool,
    pub is_unlocked: bool,
    /// Which storage tier was selected at initialization.
    pub tier: Tier,
    /// False when only the volatile in-memory tier is available; data will
    /// not survive a restart and the UI must say so.
    pub local_available: bool,
    /// Reachability of the hosted backend, reported through by the sync
    /// layer. Never derived here; encrypted data never leaves the device.
    pub cloud_available: bool,
    #[serde(rename = "entitiesCount")]
    pub entity_counts: BTreeMap<String, usize>,
    /// Total ciphertext bytes across all entity types.
    pub total_size: u64,
}
