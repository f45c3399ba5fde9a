/*!
 * Reconciliation
 *
 * Rebuilds the key entry store from the keys already held by the backend.
 * Keys are tied back to logical ids through their label, which is the
 * ownership tag followed by the logical id.
 */

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;

use crate::backend::{call_backend, KmsBackend};
use crate::error::{error_codes, KmsError, KmsResult};
use crate::key_types::key_type_from_spec;
use crate::store::{KeyEntry, KeyEntryStore, PublicKey, PutOutcome};

/// Backend label for the key behind `logical_id`
pub fn key_label(key_tag_prefix: &str, logical_id: &str) -> String {
    format!("{}{}", key_tag_prefix, logical_id)
}

/// Logical id carried by `label`, if the label starts with the ownership tag
///
/// The tag must be a strict prefix; a tag appearing later in the label does
/// not count. The returned id may be empty.
pub fn parse_key_label<'a>(key_tag_prefix: &str, label: &'a str) -> Option<&'a str> {
    if key_tag_prefix.is_empty() {
        return None;
    }
    label.strip_prefix(key_tag_prefix)
}

/// A backend key that could not be loaded
#[derive(Debug)]
pub struct ReconciliationFailure {
    pub handle: String,
    pub error: KmsError,
}

/// An owned backend key that a newer key for the same logical id displaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupersededKey {
    pub handle: String,
    pub logical_id: String,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Default)]
pub struct ReconciliationReport {
    /// Keys listed by the backend
    pub examined: usize,

    /// Logical ids whose current entry was loaded in this pass
    pub reconciled: usize,

    /// Disabled keys and keys without the ownership tag
    pub skipped: usize,

    /// Owned keys that lost to a newer key with the same logical id,
    /// whichever of the two was listed first
    pub superseded: Vec<SupersededKey>,

    pub failures: Vec<ReconciliationFailure>,
}

impl ReconciliationReport {
    /// Error describing the failed keys, if there were any
    pub fn partial_failure(&self) -> Option<KmsError> {
        if self.failures.is_empty() {
            return None;
        }
        Some(KmsError::ReconciliationPartialFailure {
            failed: self.failures.len(),
            examined: self.examined,
            error_code: error_codes::RECONCILIATION_PARTIAL_FAILURE,
        })
    }
}

enum KeyOutcome {
    Loaded {
        logical_id: String,
        replaced: Option<SupersededKey>,
    },
    Superseded(SupersededKey),
    Skipped,
}

/// Load every enabled, owned backend key into `store`
///
/// Only a failed listing or cancellation aborts the pass. Any other problem
/// with a single key is logged and recorded in the report.
pub async fn reconcile<B: KmsBackend + ?Sized>(
    backend: &B,
    store: &KeyEntryStore,
    key_tag_prefix: &str,
    cancel: &CancellationToken,
) -> KmsResult<ReconciliationReport> {
    let handles = call_backend(
        "list_keys",
        error_codes::BACKEND_LIST_KEYS_FAILED,
        cancel,
        backend.list_keys(cancel),
    )
    .await?;

    let mut report = ReconciliationReport {
        examined: handles.len(),
        ..ReconciliationReport::default()
    };
    let mut loaded = HashSet::new();

    for handle in handles {
        match reconcile_key(backend, store, key_tag_prefix, &handle, cancel).await {
            Ok(KeyOutcome::Loaded {
                logical_id,
                replaced,
            }) => {
                loaded.insert(logical_id);
                report.superseded.extend(replaced);
            }
            Ok(KeyOutcome::Superseded(key)) => report.superseded.push(key),
            Ok(KeyOutcome::Skipped) => report.skipped += 1,
            Err(error @ KmsError::Canceled { .. }) => return Err(error),
            Err(error) => {
                log::error!("Failed to process backend key {}: {}", handle, error);
                report.failures.push(ReconciliationFailure { handle, error });
            }
        }
    }
    report.reconciled = loaded.len();

    for key in &report.superseded {
        log::warn!(
            "Backend key {} for {} is superseded by a newer key and is orphaned",
            key.handle,
            key.logical_id
        );
    }
    log::info!(
        "Reconciled {} of {} backend keys ({} skipped, {} superseded, {} failed)",
        report.reconciled,
        report.examined,
        report.skipped,
        report.superseded.len(),
        report.failures.len()
    );

    Ok(report)
}

async fn reconcile_key<B: KmsBackend + ?Sized>(
    backend: &B,
    store: &KeyEntryStore,
    key_tag_prefix: &str,
    handle: &str,
    cancel: &CancellationToken,
) -> KmsResult<KeyOutcome> {
    let description = call_backend(
        "describe_key",
        error_codes::BACKEND_DESCRIBE_KEY_FAILED,
        cancel,
        backend.describe_key(handle, cancel),
    )
    .await?;

    if !description.enabled {
        log::debug!("Skipping disabled backend key {}", handle);
        return Ok(KeyOutcome::Skipped);
    }

    let logical_id = match parse_key_label(key_tag_prefix, &description.label) {
        Some(id) => id,
        None => {
            log::debug!("Skipping backend key {} not owned by this key manager", handle);
            return Ok(KeyOutcome::Skipped);
        }
    };
    if logical_id.is_empty() {
        return Err(KmsError::InvalidArgument {
            parameter: "label".to_string(),
            expected: "ownership tag followed by a logical key id".to_string(),
            actual: description.label.clone(),
            error_code: error_codes::INVALID_KEY_LABEL,
        });
    }

    // Already current from an earlier pass over the same store
    if store
        .get(logical_id)
        .map_or(false, |current| current.backend_handle == description.handle)
    {
        return Ok(KeyOutcome::Loaded {
            logical_id: logical_id.to_string(),
            replaced: None,
        });
    }

    let key_type = key_type_from_spec(&description.spec)?;

    let pkix_data = call_backend(
        "get_public_key",
        error_codes::BACKEND_GET_PUBLIC_KEY_FAILED,
        cancel,
        backend.get_public_key(handle, cancel),
    )
    .await?;

    let entry = KeyEntry {
        backend_handle: description.handle.clone(),
        creation_time: description.creation_time,
        public_key: PublicKey {
            id: logical_id.to_string(),
            key_type,
            pkix_data,
        },
    };

    match store.put_replacing(logical_id, entry) {
        PutOutcome::Adopted { replaced } => {
            log::debug!("Loaded key {} from backend key {}", logical_id, handle);
            Ok(KeyOutcome::Loaded {
                logical_id: logical_id.to_string(),
                replaced: replaced.map(|old| SupersededKey {
                    handle: old.backend_handle,
                    logical_id: logical_id.to_string(),
                }),
            })
        }
        PutOutcome::Rejected => Ok(KeyOutcome::Superseded(SupersededKey {
            handle: description.handle,
            logical_id: logical_id.to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendOp, InMemoryBackend};
    use crate::error::{BackendError, BackendErrorKind};
    use crate::key_types::{KeySpec, KeyType};
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    const TAG: &str = "SPIRE_SERVER_KEY:";

    #[test]
    fn test_label_round_trip() {
        let label = key_label(TAG, "x509-CA-A");
        assert_eq!(label, "SPIRE_SERVER_KEY:x509-CA-A");
        assert_eq!(parse_key_label(TAG, &label), Some("x509-CA-A"));
    }

    #[test]
    fn test_label_requires_strict_prefix() {
        assert_eq!(parse_key_label(TAG, "other SPIRE_SERVER_KEY:a"), None);
        assert_eq!(parse_key_label(TAG, "spire_server_key:a"), None);
        assert_eq!(parse_key_label(TAG, TAG), Some(""));
        assert_eq!(parse_key_label(TAG, "SPIRE_SERVER_KEY:a:SPIRE_SERVER_KEY:b"), Some("a:SPIRE_SERVER_KEY:b"));
        assert_eq!(parse_key_label("", "anything"), None);
    }

    #[tokio::test]
    async fn test_empty_backend() {
        let backend = InMemoryBackend::new();
        let store = KeyEntryStore::new();
        let report = reconcile(&backend, &store, TAG, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.examined, 0);
        assert!(store.is_empty());
        assert!(report.partial_failure().is_none());
    }

    #[tokio::test]
    async fn test_filters_disabled_and_untagged_keys() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        backend.insert_key(KeySpec::EccNistP256, &key_label(TAG, "a"), true, now);
        backend.insert_key(KeySpec::Rsa2048, &key_label(TAG, "b"), true, now);
        backend.insert_key(KeySpec::EccNistP256, &key_label(TAG, "c"), false, now);
        backend.insert_key(KeySpec::EccNistP256, "someone else's key", true, now);
        backend.insert_key(KeySpec::EccNistP521, &key_label(TAG, "d"), true, now);

        let store = KeyEntryStore::new();
        let report = reconcile(&backend, &store, TAG, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.examined, 5);
        assert_eq!(report.reconciled, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a").unwrap().key_type(), KeyType::EcP256);
        assert_eq!(store.get("b").unwrap().key_type(), KeyType::Rsa2048);
        assert!(store.get("c").is_none());
        assert!(store.get("d").is_none());

        let partial = report.partial_failure().unwrap();
        assert_eq!(partial.error_code(), error_codes::RECONCILIATION_PARTIAL_FAILURE);
    }

    #[tokio::test]
    async fn test_newest_duplicate_wins() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let newer = backend.insert_key(KeySpec::EccNistP256, &key_label(TAG, "a"), true, now);
        backend.insert_key(
            KeySpec::EccNistP256,
            &key_label(TAG, "a"),
            true,
            now - Duration::hours(1),
        );

        let store = KeyEntryStore::new();
        let report = reconcile(&backend, &store, TAG, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.reconciled, 1);
        assert_eq!(report.superseded.len(), 1);
        assert_eq!(store.get("a").unwrap().backend_handle, newer);
    }

    #[tokio::test]
    async fn test_oldest_first_listing_reports_the_same_counts() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let older = backend.insert_key(
            KeySpec::EccNistP256,
            &key_label(TAG, "a"),
            true,
            now - Duration::hours(1),
        );
        let newer = backend.insert_key(KeySpec::EccNistP256, &key_label(TAG, "a"), true, now);

        let store = KeyEntryStore::new();
        let report = reconcile(&backend, &store, TAG, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.reconciled, 1);
        assert_eq!(
            report.superseded,
            vec![SupersededKey {
                handle: older,
                logical_id: "a".to_string(),
            }]
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap().backend_handle, newer);
    }

    #[tokio::test]
    async fn test_second_pass_over_same_store_is_stable() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        backend.insert_key(KeySpec::EccNistP256, &key_label(TAG, "a"), true, now);
        let store = KeyEntryStore::new();
        let cancel = CancellationToken::new();

        reconcile(&backend, &store, TAG, &cancel).await.unwrap();
        let report = reconcile(&backend, &store, TAG, &cancel).await.unwrap();

        assert_eq!(report.reconciled, 1);
        assert!(report.superseded.is_empty());
        assert_eq!(backend.call_count(BackendOp::GetPublicKey), 1);
    }

    #[tokio::test]
    async fn test_per_key_failures_do_not_abort() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let broken = backend.insert_key(KeySpec::EccNistP256, &key_label(TAG, "a"), true, now);
        let no_pub = backend.insert_key(KeySpec::EccNistP384, &key_label(TAG, "b"), true, now);
        backend.insert_key(KeySpec::Rsa4096, &key_label(TAG, "c"), true, now);
        backend.insert_key(KeySpec::Rsa4096, TAG, true, now);
        backend.fail_operation(
            BackendOp::DescribeKey,
            Some(&broken),
            BackendError::new(BackendErrorKind::Internal, "boom"),
        );
        backend.fail_operation(
            BackendOp::GetPublicKey,
            Some(&no_pub),
            BackendError::new(BackendErrorKind::AccessDenied, "no kms:GetPublicKey"),
        );

        let store = KeyEntryStore::new();
        let report = reconcile(&backend, &store, TAG, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.reconciled, 1);
        assert_eq!(report.failures.len(), 3);
        assert!(store.get("c").is_some());
        let failed: Vec<_> = report.failures.iter().map(|f| f.handle.clone()).collect();
        assert!(failed.contains(&broken));
        assert!(failed.contains(&no_pub));
    }

    #[tokio::test]
    async fn test_listing_failure_is_fatal() {
        let backend = InMemoryBackend::new();
        backend.fail_operation(
            BackendOp::ListKeys,
            None,
            BackendError::new(BackendErrorKind::AccessDenied, "bad credentials"),
        );
        let store = KeyEntryStore::new();
        let err = reconcile(&backend, &store, TAG, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), error_codes::BACKEND_LIST_KEYS_FAILED);
    }

    #[tokio::test]
    async fn test_cancellation_aborts() {
        let backend = InMemoryBackend::new();
        backend.insert_key(KeySpec::EccNistP256, &key_label(TAG, "a"), true, Utc::now());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let store = KeyEntryStore::new();
        let err = reconcile(&backend, &store, TAG, &cancel).await.unwrap_err();
        assert_eq!(err.error_type(), "Canceled");
        assert!(store.is_empty());
    }

    proptest! {
        #[test]
        fn prop_label_parse_inverts_label(id in "[a-zA-Z0-9:/_-]{1,40}") {
            let label = key_label(TAG, &id);
            prop_assert_eq!(parse_key_label(TAG, &label), Some(id.as_str()));
        }

        #[test]
        fn prop_untagged_labels_are_ignored(label in "[a-z ]{0,40}") {
            prop_assert_eq!(parse_key_label(TAG, &label), None);
        }
    }
}
