//! The secure manager: configuration, lock lifecycle and per-entity access.
//!
//! State machine: `Unconfigured → Locked ⇄ Unlocked`. Configuration is
//! transient and never externally observable; on failure the store reverts
//! to `Unconfigured`, on success it proceeds directly to `Unlocked` (the
//! credential was just supplied).
//!
//! All operations are serialized through a single async mutex: the
//! underlying storage tiers are not assumed to support fine-grained
//! locking, so concurrent calls queue rather than interleave. Key
//! derivation is CPU-bound and runs on a blocking worker thread. `lock()`
//! drops the derived key from memory; because operations are serialized,
//! no read or write can ever observe a half-discarded key.

use crate::backup::{self, BackupArtifact, BackupSink};
use crate::credential::Credential;
use crate::error::{SecureError, SecureResult};
use crate::guard::DemoProbe;
use crate::integrity::{self, IntegrityReport};
use crate::status::StorageStatus;
use chrono::{DateTime, Utc};
use hds_crypto::{DerivedKey, EncryptedPayload, KdfAlgorithm, KdfParams, Salt};
use hds_storage::{BackendConfig, PayloadStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Metadata key of the persisted KDF parameters record.
const META_KDF: &str = "kdf";

/// Metadata key of the encrypted credential verification token.
const META_VERIFICATION: &str = "verification";

/// Known plaintext encrypted at configure time. Unlock decrypts it to
/// validate the supplied credential without touching any real record.
const VERIFICATION_PLAINTEXT: &[u8] = b"hds-secure-verification-token-v1";

const KEY_PARAMS_VERSION: u32 = 1;

/// Time source, injectable so tests can pin timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Persisted key parameters. Non-secret: the key itself is derived from
/// these plus the credential, and only ever lives in memory.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyParamsRecord {
    version: u32,
    salt: String,
    iterations: u32,
    algorithm: KdfAlgorithm,
    entity_types: Vec<String>,
}

enum LockState {
    Unconfigured,
    Locked,
    Unlocked { key: DerivedKey, salt: Salt },
}

enum BackendSource {
    /// Probe the tiers lazily, at first use (configure/unlock time).
    Probe(BackendConfig),
    /// Injected backend, for tests and embedders that probe themselves.
    Ready(Arc<dyn PayloadStore>),
}

struct Inner {
    store: Option<Arc<dyn PayloadStore>>,
    /// `None` until the backend has been attached and the persisted
    /// metadata consulted.
    state: Option<LockState>,
    entity_types: Vec<String>,
    auto_backup: Option<JoinHandle<()>>,
}

/// Orchestrates key derivation, encryption and tiered persistence behind a
/// credential-gated lock lifecycle.
///
/// Constructed explicitly with injected dependencies (backend, demo probe,
/// clock); multiple independent instances can coexist.
pub struct SecureManager {
    inner: Mutex<Inner>,
    backend: BackendSource,
    demo: Arc<dyn DemoProbe>,
    clock: Arc<dyn Clock>,
    kdf_params: KdfParams,
    cloud_available: AtomicBool,
}

impl SecureManager {
    /// Creates a manager that probes the storage tiers on first use.
    pub fn new(config: BackendConfig, demo: Arc<dyn DemoProbe>) -> Self {
        Self::build(BackendSource::Probe(config), demo)
    }

    /// Creates a manager over an already-selected backend.
    pub fn with_backend(store: Arc<dyn PayloadStore>, demo: Arc<dyn DemoProbe>) -> Self {
        Self::build(BackendSource::Ready(store), demo)
    }

    fn build(backend: BackendSource, demo: Arc<dyn DemoProbe>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                store: None,
                state: None,
                entity_types: Vec::new(),
                auto_backup: None,
            }),
            backend,
            demo,
            clock: Arc::new(SystemClock),
            kdf_params: KdfParams::default(),
            cloud_available: AtomicBool::new(false),
        }
    }

    /// Substitutes the time source. Call before first use.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Overrides the KDF parameters used at configure time. Existing stores
    /// keep the parameters they were configured with.
    pub fn with_kdf_params(mut self, params: KdfParams) -> Self {
        self.kdf_params = params;
        self
    }

    /// Reports hosted-backend reachability for the status snapshot. Fed by
    /// the sync layer; this subsystem never talks to the network itself.
    pub fn set_cloud_available(&self, available: bool) {
        self.cloud_available.store(available, Ordering::Relaxed);
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// First-time setup: derives the key, persists the (non-secret) KDF
    /// parameters and verification token, and leaves the store `Unlocked`.
    ///
    /// Fails with [`SecureError::AlreadyConfigured`] if key parameters
    /// already exist; use [`reset`](Self::reset) first.
    pub async fn configure(
        &self,
        credential: &Credential,
        entity_types: &[&str],
    ) -> SecureResult<()> {
        self.guard("configure")?;
        let mut inner = self.inner.lock().await;
        let store = self.ensure_initialized(&mut inner)?;
        if !matches!(inner.state, Some(LockState::Unconfigured)) {
            return Err(SecureError::AlreadyConfigured);
        }
        credential.validate()?;

        let salt = Salt::random();
        let params = self.kdf_params.clone();
        let key = derive_blocking(credential, salt.clone(), params.clone()).await?;

        let types: Vec<String> = entity_types.iter().map(|t| t.to_string()).collect();
        let record = KeyParamsRecord {
            version: KEY_PARAMS_VERSION,
            salt: salt.to_base64(),
            iterations: params.iterations,
            algorithm: params.algorithm,
            entity_types: types.clone(),
        };

        let persisted = (|| -> SecureResult<()> {
            store.put_meta(META_KDF, &serde_json::to_vec(&record)?)?;
            let token = hds_crypto::encrypt(&key, &salt, VERIFICATION_PLAINTEXT, self.clock.now())?;
            store.put_meta(META_VERIFICATION, &serde_json::to_vec(&token)?)?;
            Ok(())
        })();
        if let Err(e) = persisted {
            // Configuring is transient: wipe any partial metadata and
            // revert to Unconfigured.
            let _ = store.clear();
            return Err(e);
        }

        inner.entity_types = types;
        inner.state = Some(LockState::Unlocked { key, salt });
        info!("secure storage configured and unlocked");
        Ok(())
    }

    /// Re-derives the key from the persisted salt and validates it against
    /// the verification token. Never partially unlocks: on
    /// [`SecureError::WrongCredential`] the store stays exactly as it was.
    pub async fn unlock(&self, credential: &Credential) -> SecureResult<()> {
        self.guard("unlock")?;
        let mut inner = self.inner.lock().await;
        let store = self.ensure_initialized(&mut inner)?;
        if matches!(inner.state, Some(LockState::Unconfigured)) {
            return Err(SecureError::NotConfigured);
        }

        let record = self.read_key_params(&store)?.ok_or(SecureError::NotConfigured)?;
        let salt = Salt::from_base64(&record.salt)
            .map_err(|e| SecureError::Internal(format!("persisted salt corrupt: {e}")))?;
        let params = KdfParams {
            iterations: record.iterations,
            algorithm: record.algorithm,
        };
        let key = derive_blocking(credential, salt.clone(), params).await?;

        let token_bytes = store
            .get_meta(META_VERIFICATION)?
            .ok_or_else(|| SecureError::Internal("verification token missing".into()))?;
        let token: EncryptedPayload = serde_json::from_slice(&token_bytes)?;
        let plaintext = hds_crypto::decrypt(&key, &token)?;
        if plaintext != VERIFICATION_PLAINTEXT {
            return Err(SecureError::WrongCredential);
        }

        inner.state = Some(LockState::Unlocked { key, salt });
        debug!("secure storage unlocked");
        Ok(())
    }

    /// Discards the in-memory key and cancels the auto-backup timer.
    /// Always succeeds; idempotent.
    pub async fn lock(&self) -> SecureResult<()> {
        self.guard("lock")?;
        let mut inner = self.inner.lock().await;
        cancel_auto_backup(&mut inner);
        if matches!(inner.state, Some(LockState::Unlocked { .. })) {
            // Replacing the state drops the DerivedKey, which zeroizes it:
            // lock is a hard memory clear, not a flag.
            inner.state = Some(LockState::Locked);
            debug!("secure storage locked");
        }
        Ok(())
    }

    /// Irreversibly discards every payload and all key parameters.
    /// Destructive; the caller layer is responsible for confirmation.
    pub async fn reset(&self) -> SecureResult<()> {
        self.guard("reset")?;
        let mut inner = self.inner.lock().await;
        let store = self.ensure_initialized(&mut inner)?;
        cancel_auto_backup(&mut inner);
        store.clear()?;
        inner.entity_types.clear();
        inner.state = Some(LockState::Unconfigured);
        warn!("secure storage reset: all payloads and key parameters discarded");
        Ok(())
    }

    // ── Per-entity access ────────────────────────────────────────

    /// Decrypts and returns a record, or `None` if absent.
    pub async fn read(&self, entity_type: &str, id: u64) -> SecureResult<Option<Value>> {
        self.guard("read")?;
        let mut inner = self.inner.lock().await;
        let store = self.ensure_initialized(&mut inner)?;
        let (key, _) = require_unlocked(&inner)?;
        require_known_type(&inner, entity_type)?;

        let Some(bytes) = store.get(entity_type, id)? else {
            return Ok(None);
        };
        let payload: EncryptedPayload = serde_json::from_slice(&bytes).map_err(|_| {
            debug!(entity_type, id, "stored envelope is malformed");
            SecureError::WrongCredential
        })?;
        let plaintext = hds_crypto::decrypt(&key, &payload)?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    /// Encrypts and persists a record. Every write produces a new envelope
    /// with a fresh random nonce.
    pub async fn write(&self, entity_type: &str, id: u64, data: &Value) -> SecureResult<()> {
        self.guard("write")?;
        let mut inner = self.inner.lock().await;
        let store = self.ensure_initialized(&mut inner)?;
        let (key, salt) = require_unlocked(&inner)?;
        require_known_type(&inner, entity_type)?;

        let plaintext = serde_json::to_vec(data)?;
        let payload = hds_crypto::encrypt(&key, &salt, &plaintext, self.clock.now())?;
        store.put(entity_type, id, &serde_json::to_vec(&payload)?)?;
        Ok(())
    }

    /// Deletes a record. Returns whether it existed.
    pub async fn delete(&self, entity_type: &str, id: u64) -> SecureResult<bool> {
        self.guard("delete")?;
        let mut inner = self.inner.lock().await;
        let store = self.ensure_initialized(&mut inner)?;
        require_unlocked(&inner)?;
        require_known_type(&inner, entity_type)?;
        Ok(store.delete(entity_type, id)?)
    }

    // ── Introspection ────────────────────────────────────────────

    /// Recomputes the status snapshot. Never cached.
    pub async fn status(&self) -> SecureResult<StorageStatus> {
        self.guard("status")?;
        let mut inner = self.inner.lock().await;
        let store = self.ensure_initialized(&mut inner)?;

        let (is_configured, is_unlocked) = match inner.state {
            Some(LockState::Unconfigured) | None => (false, false),
            Some(LockState::Locked) => (true, false),
            Some(LockState::Unlocked { .. }) => (true, true),
        };

        let mut entity_counts = BTreeMap::new();
        for entity_type in &inner.entity_types {
            entity_counts.insert(entity_type.clone(), store.count(entity_type)?);
        }

        Ok(StorageStatus {
            is_configured,
            is_unlocked,
            tier: store.tier(),
            local_available: store.tier().is_persistent(),
            cloud_available: self.cloud_available.load(Ordering::Relaxed),
            entity_counts,
            total_size: store.size()?,
        })
    }

    /// Re-decrypts every stored payload and reports per-entity validity.
    /// Scans everything; a failure is recorded, not fatal to the scan.
    pub async fn verify_integrity(&self) -> SecureResult<IntegrityReport> {
        self.guard("verify_integrity")?;
        let mut inner = self.inner.lock().await;
        let store = self.ensure_initialized(&mut inner)?;
        let (key, _) = require_unlocked(&inner)?;
        integrity::scan(store.as_ref(), &key, &inner.entity_types)
    }

    // ── Backup ───────────────────────────────────────────────────

    /// Serializes the full encrypted store into a portable artifact.
    ///
    /// Export policy: ships the existing ciphertext as-is. No keys are
    /// re-derived, and the artifact can only be opened with the credential
    /// the store was configured with.
    pub async fn export_backup(&self) -> SecureResult<BackupArtifact> {
        self.guard("export_backup")?;
        let mut inner = self.inner.lock().await;
        let store = self.ensure_initialized(&mut inner)?;
        require_unlocked(&inner)?;

        let record = self.read_key_params(&store)?.ok_or(SecureError::NotConfigured)?;
        let kdf = KdfParams {
            iterations: record.iterations,
            algorithm: record.algorithm,
        };
        backup::export(store.as_ref(), &inner.entity_types, kdf, self.clock.now())
    }

    /// Restores records from a backup artifact. All-or-nothing: every
    /// payload is decrypted (with the supplied credential) before a single
    /// write is committed; any failure leaves the store untouched. Restored
    /// records are re-encrypted under the current session key.
    ///
    /// Returns the number of records imported.
    pub async fn import_backup(
        &self,
        artifact: &BackupArtifact,
        credential: &Credential,
    ) -> SecureResult<usize> {
        self.guard("import_backup")?;
        let mut inner = self.inner.lock().await;
        let store = self.ensure_initialized(&mut inner)?;
        let (key, salt) = require_unlocked(&inner)?;

        backup::validate_manifest(artifact)?;
        for record in &artifact.records {
            if !inner.entity_types.iter().any(|t| t == &record.entity_type) {
                return Err(SecureError::ImportManifest(format!(
                    "unknown entity type: {}",
                    record.entity_type
                )));
            }
        }

        let decrypted = backup::decrypt_all(artifact, credential).await?;

        for (entity_type, id, plaintext) in &decrypted {
            let payload = hds_crypto::encrypt(&key, &salt, plaintext, self.clock.now())?;
            store.put(entity_type, *id, &serde_json::to_vec(&payload)?)?;
        }
        info!(records = decrypted.len(), "backup imported");
        Ok(decrypted.len())
    }

    /// Changes the unlock credential, re-encrypting every stored payload
    /// under a key derived from the new credential and a fresh salt.
    pub async fn change_credential(
        &self,
        old: &Credential,
        new: &Credential,
    ) -> SecureResult<()> {
        self.guard("change_credential")?;
        let mut inner = self.inner.lock().await;
        let store = self.ensure_initialized(&mut inner)?;
        if matches!(inner.state, Some(LockState::Unconfigured)) {
            return Err(SecureError::NotConfigured);
        }
        new.validate()?;

        let record = self.read_key_params(&store)?.ok_or(SecureError::NotConfigured)?;
        let old_salt = Salt::from_base64(&record.salt)
            .map_err(|e| SecureError::Internal(format!("persisted salt corrupt: {e}")))?;
        let params = KdfParams {
            iterations: record.iterations,
            algorithm: record.algorithm,
        };

        let old_key = derive_blocking(old, old_salt.clone(), params.clone()).await?;
        let token_bytes = store
            .get_meta(META_VERIFICATION)?
            .ok_or_else(|| SecureError::Internal("verification token missing".into()))?;
        let token: EncryptedPayload = serde_json::from_slice(&token_bytes)?;
        if hds_crypto::decrypt(&old_key, &token)? != VERIFICATION_PLAINTEXT {
            return Err(SecureError::WrongCredential);
        }

        let new_salt = Salt::random();
        let new_key = derive_blocking(new, new_salt.clone(), params.clone()).await?;

        let types = inner.entity_types.clone();
        for entity_type in &types {
            for id in store.list(entity_type)? {
                let Some(bytes) = store.get(entity_type, id)? else {
                    continue;
                };
                let payload: EncryptedPayload =
                    serde_json::from_slice(&bytes).map_err(|_| SecureError::WrongCredential)?;
                let plaintext = hds_crypto::decrypt(&old_key, &payload)?;
                let reencrypted =
                    hds_crypto::encrypt(&new_key, &new_salt, &plaintext, self.clock.now())?;
                store.put(entity_type, id, &serde_json::to_vec(&reencrypted)?)?;
            }
        }

        let new_record = KeyParamsRecord {
            version: KEY_PARAMS_VERSION,
            salt: new_salt.to_base64(),
            iterations: params.iterations,
            algorithm: params.algorithm,
            entity_types: types,
        };
        store.put_meta(META_KDF, &serde_json::to_vec(&new_record)?)?;
        let new_token =
            hds_crypto::encrypt(&new_key, &new_salt, VERIFICATION_PLAINTEXT, self.clock.now())?;
        store.put_meta(META_VERIFICATION, &serde_json::to_vec(&new_token)?)?;

        inner.state = Some(LockState::Unlocked {
            key: new_key,
            salt: new_salt,
        });
        info!("credential changed, all payloads re-encrypted");
        Ok(())
    }

    // ── Auto-backup ──────────────────────────────────────────────

    /// Starts the recurring auto-backup timer. Requires `Unlocked`; the
    /// timer acquires the same serialization as foreground calls (no backup
    /// mid-write) and is cancelled by [`lock`](Self::lock),
    /// [`disable_auto_backup`](Self::disable_auto_backup) or drop.
    pub async fn enable_auto_backup(
        self: &Arc<Self>,
        interval: Duration,
        sink: Arc<dyn BackupSink>,
    ) -> SecureResult<()> {
        self.guard("enable_auto_backup")?;
        let mut inner = self.inner.lock().await;
        self.ensure_initialized(&mut inner)?;
        require_unlocked(&inner)?;
        cancel_auto_backup(&mut inner);

        let manager = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so the first
            // backup happens one full interval after enabling.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.auto_backup_tick(sink.as_ref()).await;
            }
        });
        inner.auto_backup = Some(handle);
        debug!(interval_secs = interval.as_secs(), "auto-backup enabled");
        Ok(())
    }

    /// Stops the auto-backup timer if one is running.
    pub async fn disable_auto_backup(&self) -> SecureResult<()> {
        self.guard("disable_auto_backup")?;
        let mut inner = self.inner.lock().await;
        cancel_auto_backup(&mut inner);
        Ok(())
    }

    /// One auto-backup cycle. Failures are reported and never block the
    /// unlocked session from continuing to function.
    async fn auto_backup_tick(&self, sink: &dyn BackupSink) {
        let mut inner = self.inner.lock().await;
        let store = match self.ensure_initialized(&mut inner) {
            Ok(store) => store,
            Err(e) => {
                warn!(error = %e, "auto-backup skipped: backend unavailable");
                return;
            }
        };
        if !matches!(inner.state, Some(LockState::Unlocked { .. })) {
            debug!("auto-backup skipped: store is locked");
            return;
        }

        let artifact = self
            .read_key_params(&store)
            .and_then(|record| record.ok_or(SecureError::NotConfigured))
            .and_then(|record| {
                let kdf = KdfParams {
                    iterations: record.iterations,
                    algorithm: record.algorithm,
                };
                backup::export(store.as_ref(), &inner.entity_types, kdf, self.clock.now())
            });
        match artifact {
            Ok(artifact) => {
                if let Err(e) = sink.deliver(&artifact) {
                    warn!(error = %e, "auto-backup delivery failed");
                } else {
                    debug!(records = artifact.records.len(), "auto-backup delivered");
                }
            }
            Err(e) => warn!(error = %e, "auto-backup export failed"),
        }
    }

    // ── Internals ────────────────────────────────────────────────

    /// The demo-isolation chokepoint. Runs before any state is read or
    /// written, so a violation can have no side effects even under
    /// initialization races.
    fn guard(&self, operation: &str) -> SecureResult<()> {
        if self.demo.is_demo_session() {
            error!(
                operation,
                "demo isolation violation: secure storage invoked from a demo session"
            );
            return Err(SecureError::DemoIsolationViolation {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// Attaches the backend (probing tiers if needed) and derives the
    /// initial lock state from the persisted metadata.
    fn ensure_initialized(&self, inner: &mut Inner) -> SecureResult<Arc<dyn PayloadStore>> {
        if inner.store.is_none() {
            let store = match &self.backend {
                BackendSource::Ready(store) => store.clone(),
                BackendSource::Probe(config) => hds_storage::select_backend(config)?,
            };
            inner.store = Some(store);
        }
        let store = inner
            .store
            .clone()
            .ok_or_else(|| SecureError::Internal("backend missing after init".into()))?;

        if inner.state.is_none() {
            match self.read_key_params(&store)? {
                Some(record) => {
                    inner.entity_types = record.entity_types;
                    inner.state = Some(LockState::Locked);
                }
                None => inner.state = Some(LockState::Unconfigured),
            }
        }
        Ok(store)
    }

    fn read_key_params(
        &self,
        store: &Arc<dyn PayloadStore>,
    ) -> SecureResult<Option<KeyParamsRecord>> {
        let Some(bytes) = store.get_meta(META_KDF)? else {
            return Ok(None);
        };
        let record: KeyParamsRecord = serde_json::from_slice(&bytes)?;
        if record.version != KEY_PARAMS_VERSION {
            return Err(SecureError::Internal(format!(
                "unsupported key parameters version {}",
                record.version
            )));
        }
        Ok(Some(record))
    }
}

impl Drop for SecureManager {
    fn drop(&mut self) {
        cancel_auto_backup(self.inner.get_mut());
    }
}

fn require_unlocked(inner: &Inner) -> SecureResult<(DerivedKey, Salt)> {
    match &inner.state {
        Some(LockState::Unlocked { key, salt }) => Ok((key.clone(), salt.clone())),
        Some(LockState::Locked) => Err(SecureError::Locked),
        Some(LockState::Unconfigured) => Err(SecureError::NotConfigured),
        None => Err(SecureError::Internal("state not initialized".into())),
    }
}

fn require_known_type(inner: &Inner, entity_type: &str) -> SecureResult<()> {
    if inner.entity_types.iter().any(|t| t == entity_type) {
        Ok(())
    } else {
        Err(SecureError::UnknownEntityType(entity_type.to_string()))
    }
}

fn cancel_auto_backup(inner: &mut Inner) {
    if let Some(handle) = inner.auto_backup.take() {
        handle.abort();
        debug!("auto-backup cancelled");
    }
}

/// Runs the deliberately slow KDF on a blocking worker so the caller's
/// event loop stays responsive. The credential copy is zeroized when the
/// worker finishes.
pub(crate) async fn derive_blocking(
    credential: &Credential,
    salt: Salt,
    params: KdfParams,
) -> SecureResult<DerivedKey> {
    let secret = Zeroizing::new(credential.expose().to_string());
    let key = tokio::task::spawn_blocking(move || hds_crypto::derive_key(&secret, &salt, &params))
        .await
        .map_err(|e| SecureError::Internal(format!("key derivation task failed: {e}")))??;
    Ok(key)
}
