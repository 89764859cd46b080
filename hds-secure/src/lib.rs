//! Secure manager for the HDS encrypted health-data store.
//!
//! Sensitive records (patients, appointments, invoices) live entirely on
//! the user's device, encrypted under a key derived from a PIN or password.
//! This crate orchestrates the full lifecycle around `hds-crypto` and
//! `hds-storage`:
//!
//! - configure / unlock / lock state machine with a hard in-memory key
//!   (lock zeroizes the key, it is never a flag)
//! - per-entity read/write/delete, ciphertext-only persistence
//! - backup export/import and an optional recurring auto-backup
//! - store-wide integrity verification
//! - demo-session isolation: every entry point is refused outright when the
//!   injected [`DemoProbe`] reports a demo session
//!
//! All operations are async and serialized; expected failures come back as
//! typed [`SecureError`] values rather than panics.

mod backup;
mod credential;
mod error;
mod guard;
mod integrity;
mod manager;
mod status;

pub use backup::{
    BackupArtifact, BackupRecord, BackupSink, FileSink, BACKUP_FILE_EXTENSION,
    BACKUP_FORMAT_VERSION, DEFAULT_AUTO_BACKUP_INTERVAL,
};
pub use credential::{Credential, MIN_PASSWORD_CHARS, PIN_DIGITS};
pub use error::{SecureError, SecureResult};
pub use guard::{DemoProbe, NeverDemo};
pub use integrity::{CheckOutcome, EntityCheck, IntegrityReport};
pub use manager::{Clock, SecureManager, SystemClock};
pub use status::StorageStatus;
