use hds_crypto::KdfParams;
use hds_secure::{Credential, DemoProbe, NeverDemo, SecureError, SecureManager};
use hds_storage::{BackendConfig, MemoryStore, PayloadStore};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Small iteration count so the suite stays fast; production stores use
/// the default.
fn fast_kdf() -> KdfParams {
    KdfParams {
        iterations: 1_000,
        ..KdfParams::default()
    }
}

fn manager_over(store: Arc<MemoryStore>) -> Arc<SecureManager> {
    Arc::new(SecureManager::with_backend(store, Arc::new(NeverDemo)).with_kdf_params(fast_kdf()))
}

fn manager() -> Arc<SecureManager> {
    manager_over(Arc::new(MemoryStore::new(None)))
}

/// Demo predicate that can be flipped mid-test.
struct DemoFlag(AtomicBool);

impl DemoFlag {
    fn new(on: bool) -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(on)))
    }
    fn set(&self, on: bool) {
        self.0.store(on, Ordering::SeqCst);
    }
}

impl DemoProbe for DemoFlag {
    fn is_demo_session(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── State machine ────────────────────────────────────────────────

#[tokio::test]
async fn configure_transitions_directly_to_unlocked() {
    let manager = manager();
    manager
        .configure(&Credential::pin("482193"), &["patient", "appointment"])
        .await
        .unwrap();

    let status = manager.status().await.unwrap();
    assert!(status.is_configured);
    assert!(status.is_unlocked);
    assert_eq!(status.entity_counts.len(), 2);
    assert_eq!(status.entity_counts["patient"], 0);
}

#[tokio::test]
async fn configure_twice_fails() {
    let manager = manager();
    manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();
    let err = manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap_err();
    assert!(matches!(err, SecureError::AlreadyConfigured));
}

#[tokio::test]
async fn unlock_before_configure_fails() {
    let manager = manager();
    let err = manager.unlock(&Credential::pin("482193")).await.unwrap_err();
    assert!(matches!(err, SecureError::NotConfigured));
}

#[tokio::test]
async fn locked_is_distinct_from_not_configured() {
    let manager = manager();

    // Not configured yet
    let err = manager.read("patient", 1).await.unwrap_err();
    assert!(matches!(err, SecureError::NotConfigured));

    manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();
    manager.lock().await.unwrap();

    // Configured but locked
    let err = manager.read("patient", 1).await.unwrap_err();
    assert!(matches!(err, SecureError::Locked));
    let err = manager
        .write("patient", 1, &json!({"id": 1}))
        .await
        .unwrap_err();
    assert!(matches!(err, SecureError::Locked));
}

#[tokio::test]
async fn lock_is_idempotent() {
    let manager = manager();
    manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();

    manager.lock().await.unwrap();
    manager.lock().await.unwrap();

    let status = manager.status().await.unwrap();
    assert!(status.is_configured);
    assert!(!status.is_unlocked);
}

#[tokio::test]
async fn lock_before_configure_is_a_noop() {
    let manager = manager();
    manager.lock().await.unwrap();
    let status = manager.status().await.unwrap();
    assert!(!status.is_configured);
    assert!(!status.is_unlocked);
}

#[tokio::test]
async fn failed_unlock_never_partially_unlocks() {
    let manager = manager();
    manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();
    manager.lock().await.unwrap();

    for wrong in ["000000", "482194", "4821", "48219300"] {
        let err = manager.unlock(&Credential::pin(wrong)).await.unwrap_err();
        assert!(matches!(err, SecureError::WrongCredential), "pin {wrong}");
        let status = manager.status().await.unwrap();
        assert!(!status.is_unlocked, "pin {wrong} partially unlocked");
    }
}

#[tokio::test]
async fn failed_unlock_while_unlocked_keeps_session() {
    let manager = manager();
    manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();
    manager
        .write("patient", 1, &json!({"id": 1}))
        .await
        .unwrap();

    let err = manager.unlock(&Credential::pin("000000")).await.unwrap_err();
    assert!(matches!(err, SecureError::WrongCredential));

    // The existing session key is untouched
    assert!(manager.read("patient", 1).await.unwrap().is_some());
}

// ── End-to-end: PIN 482193 / Sophie ──────────────────────────────

#[tokio::test]
async fn pin_sophie_scenario() {
    let manager = manager();
    let record = json!({"id": 1, "firstName": "Sophie"});

    manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();
    manager.write("patient", 1, &record).await.unwrap();
    manager.lock().await.unwrap();

    // Correct PIN: the record comes back byte-for-byte
    manager.unlock(&Credential::pin("482193")).await.unwrap();
    assert_eq!(manager.read("patient", 1).await.unwrap().unwrap(), record);
    manager.lock().await.unwrap();

    // Wrong PIN: WrongCredential, store untouched
    let err = manager.unlock(&Credential::pin("000000")).await.unwrap_err();
    assert!(matches!(err, SecureError::WrongCredential));

    manager.unlock(&Credential::pin("482193")).await.unwrap();
    assert_eq!(manager.read("patient", 1).await.unwrap().unwrap(), record);
}

// ── Per-entity access ────────────────────────────────────────────

#[tokio::test]
async fn write_read_delete_roundtrip() {
    let manager = manager();
    manager
        .configure(&Credential::password("cabinet-secret"), &["invoice"])
        .await
        .unwrap();

    let invoice = json!({"id": 7, "amountCents": 4250, "paid": false});
    manager.write("invoice", 7, &invoice).await.unwrap();
    assert_eq!(manager.read("invoice", 7).await.unwrap().unwrap(), invoice);

    assert!(manager.delete("invoice", 7).await.unwrap());
    assert!(!manager.delete("invoice", 7).await.unwrap());
    assert!(manager.read("invoice", 7).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_entity_type_is_rejected() {
    let manager = manager();
    manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();

    let err = manager
        .write("labresult", 1, &json!({"id": 1}))
        .await
        .unwrap_err();
    assert!(matches!(err, SecureError::UnknownEntityType(t) if t == "labresult"));
}

#[tokio::test]
async fn overwriting_produces_a_fresh_envelope() {
    let store = Arc::new(MemoryStore::new(None));
    let manager = manager_over(store.clone());
    manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();

    manager
        .write("patient", 1, &json!({"id": 1, "firstName": "Sophie"}))
        .await
        .unwrap();
    let first: serde_json::Value =
        serde_json::from_slice(&store.get("patient", 1).unwrap().unwrap()).unwrap();

    manager
        .write("patient", 1, &json!({"id": 1, "firstName": "Sophie"}))
        .await
        .unwrap();
    let second: serde_json::Value =
        serde_json::from_slice(&store.get("patient", 1).unwrap().unwrap()).unwrap();

    // Same plaintext, new nonce and ciphertext every time
    assert_ne!(first["iv"], second["iv"]);
    assert_ne!(first["ciphertext"], second["ciphertext"]);
}

#[tokio::test]
async fn no_plaintext_ever_reaches_the_store() {
    let store = Arc::new(MemoryStore::new(None));
    let manager = manager_over(store.clone());
    manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();
    manager
        .write("patient", 1, &json!({"firstName": "Sophie"}))
        .await
        .unwrap();

    let stored = store.get("patient", 1).unwrap().unwrap();
    let text = String::from_utf8_lossy(&stored);
    assert!(!text.contains("Sophie"));
}

// ── Credential policy ────────────────────────────────────────────

#[tokio::test]
async fn credential_format_is_enforced_at_configure() {
    let manager = manager();
    for bad in [
        Credential::pin("123"),        // too short
        Credential::pin("123456789"),  // too long
        Credential::pin("12a456"),     // not digits
        Credential::password("short"), // below minimum
    ] {
        let err = manager.configure(&bad, &["patient"]).await.unwrap_err();
        assert!(matches!(err, SecureError::CredentialPolicy { .. }), "{bad:?}");
    }
    // A rejected credential leaves nothing behind
    let status = manager.status().await.unwrap();
    assert!(!status.is_configured);
}

// ── Status snapshot ──────────────────────────────────────────────

#[tokio::test]
async fn status_counts_and_size_track_contents() {
    let manager = manager();
    manager
        .configure(&Credential::pin("482193"), &["patient", "invoice"])
        .await
        .unwrap();
    manager.write("patient", 1, &json!({"id": 1})).await.unwrap();
    manager.write("patient", 2, &json!({"id": 2})).await.unwrap();
    manager.write("invoice", 1, &json!({"id": 1})).await.unwrap();

    let status = manager.status().await.unwrap();
    assert_eq!(status.entity_counts["patient"], 2);
    assert_eq!(status.entity_counts["invoice"], 1);
    assert!(status.total_size > 0);
    assert!(status.local_available == status.tier.is_persistent());

    manager.delete("patient", 2).await.unwrap();
    let status = manager.status().await.unwrap();
    assert_eq!(status.entity_counts["patient"], 1);
}

#[tokio::test]
async fn status_is_never_stale_across_lock_transitions() {
    let manager = manager();
    manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();
    assert!(manager.status().await.unwrap().is_unlocked);

    manager.lock().await.unwrap();
    assert!(!manager.status().await.unwrap().is_unlocked);

    manager.unlock(&Credential::pin("482193")).await.unwrap();
    assert!(manager.status().await.unwrap().is_unlocked);
}

#[tokio::test]
async fn status_serializes_with_wire_field_names() {
    let manager = manager();
    manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();
    manager.set_cloud_available(true);

    let status = manager.status().await.unwrap();
    assert!(status.cloud_available);

    let json = serde_json::to_value(&status).unwrap();
    for field in [
        "isConfigured",
        "isUnlocked",
        "tier",
        "localAvailable",
        "cloudAvailable",
        "entitiesCount",
        "totalSize",
    ] {
        assert!(json.get(field).is_some(), "missing field {field}");
    }
}

// ── Reset ────────────────────────────────────────────────────────

#[tokio::test]
async fn reset_discards_payloads_and_key_parameters() {
    let store = Arc::new(MemoryStore::new(None));
    let manager = manager_over(store.clone());
    manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();
    manager.write("patient", 1, &json!({"id": 1})).await.unwrap();

    manager.reset().await.unwrap();

    let status = manager.status().await.unwrap();
    assert!(!status.is_configured);
    assert!(store.get_meta("kdf").unwrap().is_none());
    assert_eq!(store.size().unwrap(), 0);

    // A fresh configure works again
    manager
        .configure(&Credential::pin("111111"), &["patient"])
        .await
        .unwrap();
    assert!(manager.status().await.unwrap().is_unlocked);
}

// ── Multiple instances over one store ────────────────────────────

#[tokio::test]
async fn second_instance_starts_locked_and_unlocks_with_same_credential() {
    let store = Arc::new(MemoryStore::new(None));
    let first = manager_over(store.clone());
    first
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();
    first
        .write("patient", 1, &json!({"id": 1, "firstName": "Sophie"}))
        .await
        .unwrap();
    drop(first);

    let second = manager_over(store);
    let status = second.status().await.unwrap();
    assert!(status.is_configured);
    assert!(!status.is_unlocked);

    second.unlock(&Credential::pin("482193")).await.unwrap();
    assert_eq!(
        second.read("patient", 1).await.unwrap().unwrap(),
        json!({"id": 1, "firstName": "Sophie"})
    );
}

// ── Change credential ────────────────────────────────────────────

#[tokio::test]
async fn change_credential_reencrypts_and_invalidates_old() {
    let manager = manager();
    manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();
    manager
        .write("patient", 1, &json!({"id": 1, "firstName": "Sophie"}))
        .await
        .unwrap();

    manager
        .change_credential(&Credential::pin("482193"), &Credential::password("new-passphrase"))
        .await
        .unwrap();
    manager.lock().await.unwrap();

    let err = manager.unlock(&Credential::pin("482193")).await.unwrap_err();
    assert!(matches!(err, SecureError::WrongCredential));

    manager
        .unlock(&Credential::password("new-passphrase"))
        .await
        .unwrap();
    assert_eq!(
        manager.read("patient", 1).await.unwrap().unwrap(),
        json!({"id": 1, "firstName": "Sophie"})
    );
}

#[tokio::test]
async fn change_credential_rejects_wrong_old_credential() {
    let manager = manager();
    manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();

    let err = manager
        .change_credential(&Credential::pin("000000"), &Credential::pin("111111"))
        .await
        .unwrap_err();
    assert!(matches!(err, SecureError::WrongCredential));

    // The original credential still works
    manager.lock().await.unwrap();
    manager.unlock(&Credential::pin("482193")).await.unwrap();
}

// ── Demo isolation ───────────────────────────────────────────────

#[tokio::test]
async fn every_operation_is_refused_in_a_demo_session() {
    let store = Arc::new(MemoryStore::new(None));
    let demo = DemoFlag::new(true);
    let manager = Arc::new(
        SecureManager::with_backend(store.clone(), demo.clone()).with_kdf_params(fast_kdf()),
    );

    let pin = Credential::pin("482193");
    let artifact = hds_secure::BackupArtifact {
        format_version: hds_secure::BACKUP_FORMAT_VERSION,
        exported_at: chrono::Utc::now(),
        kdf: fast_kdf(),
        entity_counts: Default::default(),
        records: Vec::new(),
    };
    let sink = Arc::new(hds_secure::FileSink::new("/tmp/never-used"));

    let violations: Vec<(&str, SecureError)> = vec![
        ("configure", manager.configure(&pin, &["patient"]).await.unwrap_err()),
        ("unlock", manager.unlock(&pin).await.unwrap_err()),
        ("lock", manager.lock().await.unwrap_err()),
        ("read", manager.read("patient", 1).await.unwrap_err()),
        ("write", manager.write("patient", 1, &json!({})).await.unwrap_err()),
        ("delete", manager.delete("patient", 1).await.unwrap_err()),
        ("status", manager.status().await.unwrap_err()),
        ("reset", manager.reset().await.unwrap_err()),
        ("verify_integrity", manager.verify_integrity().await.unwrap_err()),
        ("export_backup", manager.export_backup().await.unwrap_err()),
        ("import_backup", manager.import_backup(&artifact, &pin).await.unwrap_err()),
        (
            "change_credential",
            manager.change_credential(&pin, &pin).await.unwrap_err(),
        ),
        (
            "enable_auto_backup",
            manager
                .enable_auto_backup(std::time::Duration::from_secs(60), sink)
                .await
                .unwrap_err(),
        ),
        ("disable_auto_backup", manager.disable_auto_backup().await.unwrap_err()),
    ];

    for (name, err) in violations {
        match err {
            SecureError::DemoIsolationViolation { operation } => assert_eq!(operation, name),
            other => panic!("{name}: expected DemoIsolationViolation, got {other:?}"),
        }
    }

    // Zero observable side effects: no salt written, no ciphertext written
    assert!(store.get_meta("kdf").unwrap().is_none());
    assert!(store.get_meta("verification").unwrap().is_none());
    assert_eq!(store.size().unwrap(), 0);
    assert!(store.list("patient").unwrap().is_empty());
}

#[tokio::test]
async fn demo_flag_flipping_mid_session_blocks_immediately() {
    let demo = DemoFlag::new(false);
    let manager = Arc::new(
        SecureManager::with_backend(Arc::new(MemoryStore::new(None)), demo.clone())
            .with_kdf_params(fast_kdf()),
    );
    manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();
    manager.write("patient", 1, &json!({"id": 1})).await.unwrap();

    demo.set(true);
    let err = manager.read("patient", 1).await.unwrap_err();
    assert!(matches!(err, SecureError::DemoIsolationViolation { .. }));

    demo.set(false);
    assert!(manager.read("patient", 1).await.unwrap().is_some());
}

// ── Environment support ──────────────────────────────────────────

#[tokio::test]
async fn configure_fails_loudly_without_a_usable_tier() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"occupied").unwrap();

    let config = BackendConfig::new(blocker.join("data"));
    let manager =
        SecureManager::new(config, Arc::new(NeverDemo)).with_kdf_params(fast_kdf());

    let err = manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap_err();
    match err {
        SecureError::UnsupportedEnvironment { details } => {
            assert!(!details.is_empty());
            assert!(details.iter().all(|d| !d.is_empty()));
        }
        other => panic!("expected UnsupportedEnvironment, got {other:?}"),
    }
}

// ── Serialized concurrency ───────────────────────────────────────

#[tokio::test]
async fn concurrent_writes_to_the_same_entity_are_queued_not_interleaved() {
    let manager = manager();
    manager
        .configure(&Credential::pin("482193"), &["patient"])
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..16u64 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .write("patient", 1, &json!({"id": 1, "rev": i}))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // One of the sixteen complete revisions won; never a torn record
    let record = manager.read("patient", 1).await.unwrap().unwrap();
    let rev = record["rev"].as_u64().unwrap();
    assert!(rev < 16);
    assert_eq!(record["id"], 1);
}
