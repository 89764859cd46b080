//! DuckDB-backed storage tier.
//!
//! The preferred high-capacity tier. Envelopes live in a `payloads` table
//! keyed by (entity_type, entity_id); non-secret metadata in `store_meta`.
//! Both columns hold opaque bytes, never plaintext records.

use crate::backend::{ensure_quota, PayloadStore, Tier};
use crate::error::{StorageError, StorageResult};
use chrono::Utc;
use duckdb::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// DuckDB storage tier.
#[derive(Debug)]
pub struct DatabaseStore {
    conn: Arc<Mutex<Connection>>,
    quota: Option<u64>,
}

impl DatabaseStore {
    /// Opens (or creates) the database file and initializes the schema.
    ///
    /// If the initial open fails and a `.wal` file exists alongside the
    /// database, the WAL is removed and the open retried once: an unclean
    /// shutdown can leave a stale WAL that prevents reopening.
    pub fn open(path: &Path, quota: Option<u64>) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Backend(format!("create {}: {e}", parent.display())))?;
        }

        let conn = open_with_wal_recovery(path)?;

        // DuckDB defaults to ~80% of system RAM per connection, far too
        // aggressive for a client-resident store.
        conn.execute_batch("PRAGMA memory_limit='64MB'; PRAGMA threads=1;")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS payloads (
                entity_type VARCHAR NOT NULL,
                entity_id BIGINT NOT NULL,
                envelope BLOB NOT NULL,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (entity_type, entity_id)
            );
            CREATE TABLE IF NOT EXISTS store_meta (
                meta_key VARCHAR PRIMARY KEY,
                meta_value BLOB NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            quota,
        })
    }

    fn lock_conn(&self) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Backend(format!("connection lock poisoned: {e}")))
    }
}

fn open_with_wal_recovery(path: &Path) -> StorageResult<Connection> {
    match Connection::open(path) {
        Ok(conn) => Ok(conn),
        Err(first_err) => {
            let wal_path = path.with_extension(
                path.extension()
                    .map(|ext| format!("{}.wal", ext.to_string_lossy()))
                    .unwrap_or_else(|| "wal".to_string()),
            );
            if wal_path.exists() {
                warn!(
                    wal = %wal_path.display(),
                    "database open failed, removing stale WAL and retrying"
                );
                if std::fs::remove_file(&wal_path).is_ok() {
                    return Ok(Connection::open(path)?);
                }
            }
            Err(first_err.into())
        }
    }
}

impl PayloadStore for DatabaseStore {
    fn put(&self, entity_type: &str, id: u64, envelope: &[u8]) -> StorageResult<()> {
        let conn = self.lock_conn()?;

        if self.quota.is_some() {
            let current: i64 = conn.query_row(
                "SELECT COALESCE(SUM(OCTET_LENGTH(envelope)), 0) FROM payloads",
                [],
                |row| row.get(0),
            )?;
            let replaced: i64 = conn
                .query_row(
                    "SELECT OCTET_LENGTH(envelope) FROM payloads WHERE entity_type = ? AND entity_id = ?",
                    params![entity_type, id as i64],
                    |row| row.get(0),
                )
                .or_else(|e| match e {
                    duckdb::Error::QueryReturnedNoRows => Ok(0),
                    other => Err(other),
                })?;
            ensure_quota(
                self.quota,
                current as u64,
                replaced as u64,
                envelope.len() as u64,
            )?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO payloads (entity_type, entity_id, envelope, updated_at) \
             VALUES (?, ?, ?, ?)",
            params![
                entity_type,
                id as i64,
                envelope.to_vec(),
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    fn get(&self, entity_type: &str, id: u64) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT envelope FROM payloads WHERE entity_type = ? AND entity_id = ?",
            params![entity_type, id as i64],
            |row| row.get::<_, Vec<u8>>(0),
        );
        match result {
            Ok(envelope) => Ok(Some(envelope)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, entity_type: &str) -> StorageResult<Vec<u64>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT entity_id FROM payloads WHERE entity_type = ? ORDER BY entity_id ASC",
        )?;
        let ids: Vec<u64> = stmt
            .query_map(params![entity_type], |row| row.get::<_, i64>(0))?
            .filter_map(|r| r.ok())
            .map(|id| id as u64)
            .collect();
        Ok(ids)
    }

    fn delete(&self, entity_type: &str, id: u64) -> StorageResult<bool> {
        let conn = self.lock_conn()?;
        let affected = conn.execute(
            "DELETE FROM payloads WHERE entity_type = ? AND entity_id = ?",
            params![entity_type, id as i64],
        )?;
        Ok(affected > 0)
    }

    fn count(&self, entity_type: &str) -> StorageResult<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM payloads WHERE entity_type = ?",
            params![entity_type],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn size(&self) -> StorageResult<u64> {
        let conn = self.lock_conn()?;
        let bytes: i64 = conn.query_row(
            "SELECT COALESCE(SUM(OCTET_LENGTH(envelope)), 0) FROM payloads",
            [],
            |row| row.get(0),
        )?;
        Ok(bytes as u64)
    }

    fn put_meta(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO store_meta (meta_key, meta_value) VALUES (?, ?)",
            params![key, value.to_vec()],
        )?;
        Ok(())
    }

    fn get_meta(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT meta_value FROM store_meta WHERE meta_key = ?",
            params![key],
            |row| row.get::<_, Vec<u8>>(0),
        );
        match result {
            Ok(value) => Ok(Some(value)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self) -> StorageResult<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch("DELETE FROM payloads; DELETE FROM store_meta; CHECKPOINT;")?;
        Ok(())
    }

    fn tier(&self) -> Tier {
        Tier::Database
    }
}
