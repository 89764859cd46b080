//! Sled-backed storage tier.
//!
//! Transactional key-value fallback for environments where the database
//! tier cannot open. Envelope keys are `"{entity_type}/{id:020}"`; the
//! zero-padded id keeps a prefix scan in ascending id order.

use crate::backend::{ensure_quota, PayloadStore, Tier};
use crate::error::{StorageError, StorageResult};
use sled::{Db, Tree};
use std::path::Path;

/// Sled storage tier.
#[derive(Debug)]
pub struct KvStore {
    db: Db,
    payloads: Tree,
    meta: Tree,
    quota: Option<u64>,
}

fn payload_key(entity_type: &str, id: u64) -> Vec<u8> {
    format!("{entity_type}/{id:020}").into_bytes()
}

impl KvStore {
    /// Opens (or creates) the sled database at the given directory.
    pub fn open(path: &Path, quota: Option<u64>) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Backend(format!("create {}: {e}", parent.display())))?;
        }
        let db = sled::open(path)?;
        let payloads = db.open_tree("payloads")?;
        let meta = db.open_tree("meta")?;
        Ok(Self {
            db,
            payloads,
            meta,
            quota,
        })
    }

    fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl PayloadStore for KvStore {
    fn put(&self, entity_type: &str, id: u64, envelope: &[u8]) -> StorageResult<()> {
        let key = payload_key(entity_type, id);
        if self.quota.is_some() {
            let replaced = self.payloads.get(&key)?.map(|v| v.len() as u64).unwrap_or(0);
            ensure_quota(self.quota, self.size()?, replaced, envelope.len() as u64)?;
        }
        self.payloads.insert(key, envelope)?;
        self.flush()
    }

    fn get(&self, entity_type: &str, id: u64) -> StorageResult<Option<Vec<u8>>> {
        let value = self.payloads.get(payload_key(entity_type, id))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn list(&self, entity_type: &str) -> StorageResult<Vec<u64>> {
        let prefix = format!("{entity_type}/");
        let mut ids = Vec::new();
        for entry in self.payloads.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            let suffix = &key[prefix.len()..];
            let id = std::str::from_utf8(suffix)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| StorageError::Backend("malformed payload key".into()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn delete(&self, entity_type: &str, id: u64) -> StorageResult<bool> {
        let existed = self.payloads.remove(payload_key(entity_type, id))?.is_some();
        self.flush()?;
        Ok(existed)
    }

    fn count(&self, entity_type: &str) -> StorageResult<usize> {
        let prefix = format!("{entity_type}/");
        let mut count = 0usize;
        for entry in self.payloads.scan_prefix(prefix.as_bytes()) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    fn size(&self) -> StorageResult<u64> {
        let mut bytes = 0u64;
        for entry in self.payloads.iter() {
            let (_, value) = entry?;
            bytes += value.len() as u64;
        }
        Ok(bytes)
    }

    fn put_meta(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.meta.insert(key.as_bytes(), value)?;
        self.flush()
    }

    fn get_meta(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let value = self.meta.get(key.as_bytes())?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn clear(&self) -> StorageResult<()> {
        self.payloads.clear()?;
        self.meta.clear()?;
        self.flush()
    }

    fn tier(&self) -> Tier {
        Tier::KeyValue
    }
}
