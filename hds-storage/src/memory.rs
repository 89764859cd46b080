//! In-memory storage tier.
//!
//! Degraded mode: nothing survives a process restart. Selected only when no
//! persistent tier passes its probe and the caller explicitly allowed a
//! volatile fallback; the selection is always reported, never silent.

use crate::backend::{ensure_quota, PayloadStore, Tier};
use crate::error::StorageResult;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Volatile in-memory storage tier.
#[derive(Default, Debug)]
pub struct MemoryStore {
    payloads: RwLock<BTreeMap<(String, u64), Vec<u8>>>,
    meta: RwLock<BTreeMap<String, Vec<u8>>>,
    quota: Option<u64>,
}

impl MemoryStore {
    pub fn new(quota: Option<u64>) -> Self {
        Self {
            quota,
            ..Self::default()
        }
    }
}

impl PayloadStore for MemoryStore {
    fn put(&self, entity_type: &str, id: u64, envelope: &[u8]) -> StorageResult<()> {
        let mut payloads = self.payloads.write().unwrap();
        let key = (entity_type.to_string(), id);
        if self.quota.is_some() {
            let current: u64 = payloads.values().map(|v| v.len() as u64).sum();
            let replaced = payloads.get(&key).map(|v| v.len() as u64).unwrap_or(0);
            ensure_quota(self.quota, current, replaced, envelope.len() as u64)?;
        }
        payloads.insert(key, envelope.to_vec());
        Ok(())
    }

    fn get(&self, entity_type: &str, id: u64) -> StorageResult<Option<Vec<u8>>> {
        let payloads = self.payloads.read().unwrap();
        Ok(payloads.get(&(entity_type.to_string(), id)).cloned())
    }

    fn list(&self, entity_type: &str) -> StorageResult<Vec<u64>> {
        let payloads = self.payloads.read().unwrap();
        Ok(payloads
            .keys()
            .filter(|(t, _)| t == entity_type)
            .map(|(_, id)| *id)
            .collect())
    }

    fn delete(&self, entity_type: &str, id: u64) -> StorageResult<bool> {
        let mut payloads = self.payloads.write().unwrap();
        Ok(payloads.remove(&(entity_type.to_string(), id)).is_some())
    }

    fn count(&self, entity_type: &str) -> StorageResult<usize> {
        let payloads = self.payloads.read().unwrap();
        Ok(payloads.keys().filter(|(t, _)| t == entity_type).count())
    }

    fn size(&self) -> StorageResult<u64> {
        let payloads = self.payloads.read().unwrap();
        Ok(payloads.values().map(|v| v.len() as u64).sum())
    }

    fn put_meta(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let mut meta = self.meta.write().unwrap();
        meta.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get_meta(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let meta = self.meta.read().unwrap();
        Ok(meta.get(key).cloned())
    }

    fn clear(&self) -> StorageResult<()> {
        self.payloads.write().unwrap().clear();
        self.meta.write().unwrap().clear();
        Ok(())
    }

    fn tier(&self) -> Tier {
        Tier::Memory
    }
}
