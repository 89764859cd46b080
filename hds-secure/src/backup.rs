//! Backup export and restore.
//!
//! A backup artifact is a single self-describing file: a manifest (format
//! version, export timestamp, KDF parameters, entity counts) plus the full
//! array of encrypted envelopes, shipped exactly as they sit in storage.
//! Every envelope embeds its own salt, so the credential is the only other
//! thing needed to restore.
//!
//! Import is all-or-nothing: every payload is decrypted and checked before
//! a single write is committed.

use crate::credential::Credential;
use crate::error::{SecureError, SecureResult};
use crate::manager::derive_blocking;
use chrono::{DateTime, Utc};
use hds_crypto::{DerivedKey, EncryptedPayload, KdfParams};
use hds_storage::PayloadStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Current backup artifact format version.
pub const BACKUP_FORMAT_VERSION: u32 = 1;

/// Suggested file extension for backup artifacts.
pub const BACKUP_FILE_EXTENSION: &str = "hdsbackup";

/// Default auto-backup interval.
pub const DEFAULT_AUTO_BACKUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// One exported record: the envelope exactly as persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub entity_type: String,
    pub id: u64,
    pub envelope: EncryptedPayload,
}

/// A portable, self-describing backup of the full encrypted store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupArtifact {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    /// KDF parameters the envelopes were encrypted under. Non-secret.
    pub kdf: KdfParams,
    pub entity_counts: BTreeMap<String, usize>,
    pub records: Vec<BackupRecord>,
}

impl BackupArtifact {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Receives finished backup artifacts (a download prompt, a watched
/// directory, a test collector).
pub trait BackupSink: Send + Sync {
    fn deliver(&self, artifact: &BackupArtifact) -> std::io::Result<()>;
}

/// Sink that writes each artifact as a timestamped `.hdsbackup` file.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl BackupSink for FileSink {
    fn deliver(&self, artifact: &BackupArtifact) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let name = format!(
            "hds-backup-{}.{BACKUP_FILE_EXTENSION}",
            artifact.exported_at.format("%Y%m%dT%H%M%S")
        );
        let bytes = artifact
            .to_bytes()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(self.dir.join(name), bytes)
    }
}

/// Reads every stored envelope verbatim into an artifact.
pub(crate) fn export(
    store: &dyn PayloadStore,
    entity_types: &[String],
    kdf: KdfParams,
    exported_at: DateTime<Utc>,
) -> SecureResult<BackupArtifact> {
    let mut records = Vec::new();
    let mut entity_counts = BTreeMap::new();

    for entity_type in entity_types {
        let ids = store.list(entity_type)?;
        entity_counts.insert(entity_type.clone(), ids.len());
        for id in ids {
            let Some(bytes) = store.get(entity_type, id)? else {
                continue;
            };
            let envelope: EncryptedPayload = serde_json::from_slice(&bytes)?;
            records.push(BackupRecord {
                entity_type: entity_type.clone(),
                id,
                envelope,
            });
        }
    }

    Ok(BackupArtifact {
        format_version: BACKUP_FORMAT_VERSION,
        exported_at,
        kdf,
        entity_counts,
        records,
    })
}

/// Checks the manifest before anything is decrypted or written.
pub(crate) fn validate_manifest(artifact: &BackupArtifact) -> SecureResult<()> {
    if artifact.format_version != BACKUP_FORMAT_VERSION {
        return Err(SecureError::ImportFormat {
            found: artifact.format_version,
            supported: BACKUP_FORMAT_VERSION,
        });
    }

    let mut actual: BTreeMap<String, usize> = BTreeMap::new();
    for record in &artifact.records {
        *actual.entry(record.entity_type.clone()).or_default() += 1;
    }
    if actual != artifact.entity_counts {
        return Err(SecureError::ImportManifest(
            "entity counts do not match records".into(),
        ));
    }

    let mut seen = BTreeSet::new();
    for record in &artifact.records {
        if !seen.insert((record.entity_type.as_str(), record.id)) {
            return Err(SecureError::ImportManifest(format!(
                "duplicate record: {} #{}",
                record.entity_type, record.id
            )));
        }
    }
    Ok(())
}

/// Decrypts every record in the artifact, deriving once per distinct
/// embedded salt (the KDF is deliberately slow). Any failure aborts the
/// whole import before anything is written.
pub(crate) async fn decrypt_all(
    artifact: &BackupArtifact,
    credential: &Credential,
) -> SecureResult<Vec<(String, u64, Vec<u8>)>> {
    let mut keys: HashMap<String, DerivedKey> = HashMap::new();
    for record in &artifact.records {
        if !keys.contains_key(&record.envelope.salt) {
            let salt = record
                .envelope
                .embedded_salt()
                .map_err(|_| SecureError::ImportManifest("malformed envelope salt".into()))?;
            let key = derive_blocking(credential, salt, artifact.kdf.clone()).await?;
            keys.insert(record.envelope.salt.clone(), key);
        }
    }

    let mut decrypted = Vec::with_capacity(artifact.records.len());
    for record in &artifact.records {
        let key = keys
            .get(&record.envelope.salt)
            .ok_or_else(|| SecureError::Internal("derived key missing for salt".into()))?;
        let plaintext = hds_crypto::decrypt(key, &record.envelope)?;
        decrypted.push((record.entity_type.clone(), record.id, plaintext));
    }
    Ok(decrypted)
}
