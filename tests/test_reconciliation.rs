//! Integration tests for rebuilding the key table from backend keys

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use kms_keymanager::backend::BackendOp;
use kms_keymanager::config::DEFAULT_KEY_TAG_PREFIX;
use kms_keymanager::prelude::*;
use kms_keymanager::{BackendError, BackendErrorKind, InMemoryBackend, InMemoryConnector, KeySpec};

const CONFIG: &str = r#"{
    "access_key_id": "AKIDEXAMPLE",
    "secret_access_key": "secret",
    "region": "us-west-2"
}"#;

fn label(id: &str) -> String {
    format!("{}{}", DEFAULT_KEY_TAG_PREFIX, id)
}

/// Only enabled keys carrying the tag prefix are loaded
#[tokio::test]
async fn test_reconciliation_filters_untagged_and_disabled_keys() {
    let backend = Arc::new(InMemoryBackend::new());
    let at = |secs: i64| Utc.timestamp_opt(1_650_000_000 + secs, 0).unwrap();

    backend.insert_key(KeySpec::EccNistP256, &label("a"), true, at(0));
    backend.insert_key(KeySpec::Rsa2048, &label("b"), true, at(1));
    backend.insert_key(KeySpec::EccNistP384, &label("c"), true, at(2));
    backend.insert_key(KeySpec::EccNistP256, "someone-elses-key", true, at(3));
    backend.insert_key(KeySpec::EccNistP256, "", true, at(4));
    backend.insert_key(KeySpec::Rsa4096, &label("disabled"), false, at(5));

    let manager = KeyManager::new(InMemoryConnector::new(Arc::clone(&backend)));
    let report = manager
        .configure(CONFIG, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.examined, 6);
    assert_eq!(report.reconciled, 3);
    assert_eq!(report.skipped, 3);
    assert!(report.failures.is_empty());

    let mut ids: Vec<String> = manager
        .get_public_keys()
        .unwrap()
        .into_iter()
        .map(|key| key.id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);

    let b = manager.get_public_key("b").unwrap().unwrap();
    assert_eq!(b.key_type, KeyType::Rsa2048);
    assert!(manager.get_public_key("disabled").unwrap().is_none());
}

/// With duplicates for one id listed newest first, the newest key wins
#[tokio::test]
async fn test_reconciliation_keeps_newest_duplicate() {
    let backend = Arc::new(InMemoryBackend::new());
    let newest = backend.insert_key(
        KeySpec::EccNistP256,
        &label("dup"),
        true,
        Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
    );
    backend.insert_key(
        KeySpec::EccNistP256,
        &label("dup"),
        true,
        Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    );

    let manager = KeyManager::new(InMemoryConnector::new(Arc::clone(&backend)));
    let report = manager
        .configure(CONFIG, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.reconciled, 1);
    assert_eq!(report.superseded.len(), 1);

    // Signing proves which backend key is behind the id
    let digest = [1u8; 32];
    let signature = manager
        .sign_data("dup", &digest, &SignerOpts::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(backend.verify(
        &newest,
        &digest,
        kms_keymanager::SigningAlgorithm::EcdsaSha256,
        &signature
    ));
    assert!(backend.deletion_requests().is_empty());
}

/// Listing the older duplicate first gives the same table and counts
#[tokio::test]
async fn test_reconciliation_keeps_newest_duplicate_listed_last() {
    let backend = Arc::new(InMemoryBackend::new());
    let older = backend.insert_key(
        KeySpec::EccNistP256,
        &label("dup"),
        true,
        Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    );
    let newest = backend.insert_key(
        KeySpec::EccNistP256,
        &label("dup"),
        true,
        Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
    );

    let manager = KeyManager::new(InMemoryConnector::new(Arc::clone(&backend)));
    let report = manager
        .configure(CONFIG, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.reconciled, 1);
    assert_eq!(report.superseded.len(), 1);
    assert_eq!(report.superseded[0].handle, older);
    assert_eq!(manager.get_public_keys().unwrap().len(), 1);

    // The displaced duplicate is tracked as orphaned and can be swept
    let orphans = manager.orphaned_keys().unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].handle, older);

    let sweep = manager
        .sweep_orphaned_keys(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(sweep.deleted, vec![older]);
    assert_eq!(backend.deletion_requests().len(), 1);
    assert!(!backend.is_pending_deletion(&newest));
}

/// A key that fails to load is reported and the rest still load
#[tokio::test]
async fn test_reconciliation_partial_failure() {
    let backend = Arc::new(InMemoryBackend::new());
    let now = Utc::now();
    backend.insert_key(KeySpec::EccNistP256, &label("good"), true, now);
    let broken = backend.insert_key(KeySpec::EccNistP256, &label("broken"), true, now);
    backend.insert_key(KeySpec::EccSecgP256k1, &label("odd-curve"), true, now);
    backend.fail_operation(
        BackendOp::GetPublicKey,
        Some(&broken),
        BackendError::new(BackendErrorKind::AccessDenied, "not allowed"),
    );

    let manager = KeyManager::new(InMemoryConnector::new(Arc::clone(&backend)));
    let report = manager
        .configure(CONFIG, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.reconciled, 1);
    assert_eq!(report.failures.len(), 2);
    assert!(report.partial_failure().is_some());
    assert!(manager.get_public_key("good").unwrap().is_some());
    assert!(manager.get_public_key("broken").unwrap().is_none());
    assert!(manager.get_public_key("odd-curve").unwrap().is_none());
}

/// Listing failure fails configure
#[tokio::test]
async fn test_reconciliation_list_failure() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.fail_operation(
        BackendOp::ListKeys,
        None,
        BackendError::new(BackendErrorKind::Unavailable, "service down"),
    );

    let manager = KeyManager::new(InMemoryConnector::new(Arc::clone(&backend)));
    let err = manager
        .configure(CONFIG, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), "BackendFailure");
    assert!(err.is_retryable());
    assert!(manager.get_public_keys().is_err());
}

/// A custom tag prefix only picks up keys with that prefix
#[tokio::test]
async fn test_custom_tag_prefix() {
    let backend = Arc::new(InMemoryBackend::new());
    let now = Utc::now();
    backend.insert_key(KeySpec::EccNistP256, &label("default"), true, now);
    backend.insert_key(KeySpec::EccNistP256, "TENANT_B:custom", true, now);

    let manager = KeyManager::new(InMemoryConnector::new(Arc::clone(&backend)));
    let config = r#"{
        "access_key_id": "AKIDEXAMPLE",
        "secret_access_key": "secret",
        "region": "eu-central-1",
        "key_tag_prefix": "TENANT_B:"
    }"#;
    let report = manager
        .configure(config, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.reconciled, 1);
    assert!(manager.get_public_key("custom").unwrap().is_some());
    assert!(manager.get_public_key("default").unwrap().is_none());
}
