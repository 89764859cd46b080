//! Tiered ciphertext persistence for HDS secure storage.
//!
//! Persists encrypted payload envelopes keyed by entity type and id,
//! independent of which physical tier holds them. Tiers are probed in
//! priority order at initialization time:
//!
//! 1. [`DatabaseStore`] — DuckDB file, the preferred high-capacity tier
//! 2. [`KvStore`] — sled, a transactional key-value fallback
//! 3. [`MemoryStore`] — in-memory map, a degraded mode that does not
//!    survive restart and is only used when explicitly permitted
//!
//! The first tier that passes its capability check wins; the selection and
//! the reasons for rejecting higher tiers are surfaced through
//! [`SupportReport`] rather than hidden in logs. Selection happens once:
//! tiers are never switched mid-session.
//!
//! Only ciphertext envelopes and non-secret metadata (KDF parameters, the
//! credential verification token) ever pass through this crate. Plaintext
//! never does.

mod backend;
mod database;
mod error;
mod kv;
mod memory;

pub use backend::{PayloadStore, Tier};
pub use database::DatabaseStore;
pub use error::{StorageError, StorageResult};
pub use kv::KvStore;
pub use memory::MemoryStore;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// File name of the database tier inside the data directory.
const DB_FILE: &str = "hds.db";

/// Subdirectory of the key-value tier inside the data directory.
const KV_DIR: &str = "kv";

/// Where and how the backend is allowed to persist.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub data_dir: PathBuf,
    /// Optional hard cap on stored payload bytes.
    pub quota: Option<u64>,
    /// Whether the volatile in-memory tier may be selected when no
    /// persistent tier passes its probe. Off by default: losing health
    /// records on restart must be an explicit opt-in, never a silent
    /// fallback.
    pub allow_volatile: bool,
}

impl BackendConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            quota: None,
            allow_volatile: false,
        }
    }

    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.quota = Some(bytes);
        self
    }

    pub fn with_volatile_fallback(mut self, allow: bool) -> Self {
        self.allow_volatile = allow;
        self
    }
}

/// Outcome of the capability probe, consumed by the configuration UI to
/// explain why a tier was or wasn't selected.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportReport {
    pub supported: bool,
    pub selected: Option<Tier>,
    /// One human-readable line per probed tier.
    pub details: Vec<String>,
}

/// Probes the tiers in priority order and reports what would be selected,
/// without keeping a handle open.
pub fn check_support(config: &BackendConfig) -> SupportReport {
    let (store, details) = probe(config);
    SupportReport {
        supported: store.is_some(),
        selected: store.map(|s| s.tier()),
        details,
    }
}

/// Selects the first tier that passes its capability check.
///
/// Fails with [`StorageError::Unsupported`] when no tier is usable, carrying
/// the per-tier rejection reasons. Never falls back silently.
pub fn select_backend(config: &BackendConfig) -> StorageResult<Arc<dyn PayloadStore>> {
    let (store, details) = probe(config);
    store.ok_or(StorageError::Unsupported { details })
}

fn probe(config: &BackendConfig) -> (Option<Arc<dyn PayloadStore>>, Vec<String>) {
    let mut details = Vec::new();

    let db_path = config.data_dir.join(DB_FILE);
    match DatabaseStore::open(&db_path, config.quota) {
        Ok(store) => {
            details.push(format!("selected database tier at {}", db_path.display()));
            info!(path = %db_path.display(), "selected database storage tier");
            return (Some(Arc::new(store)), details);
        }
        Err(e) => details.push(format!("database tier unavailable: {e}")),
    }

    let kv_path = config.data_dir.join(KV_DIR);
    match KvStore::open(&kv_path, config.quota) {
        Ok(store) => {
            details.push(format!("selected key-value tier at {}", kv_path.display()));
            info!(path = %kv_path.display(), "selected key-value storage tier");
            return (Some(Arc::new(store)), details);
        }
        Err(e) => details.push(format!("key-value tier unavailable: {e}")),
    }

    if config.allow_volatile {
        details.push("selected volatile in-memory tier; data will not survive restart".into());
        warn!("no persistent storage tier available, using volatile in-memory storage");
        return (Some(Arc::new(MemoryStore::new(config.quota))), details);
    }

    details.push("in-memory tier not permitted (volatile fallback disabled)".into());
    (None, details)
}
