/*!
 * Key lifecycle
 *
 * Generation, rotation and signing over the backend and the key entry store.
 * Rotation decommissions only the backend key that the new entry actually
 * superseded; a key that loses a race for its logical id is recorded as
 * orphaned instead of being deleted.
 */

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::backend::{call_backend, KmsBackend};
use crate::config::KmsConfig;
use crate::error::{error_codes, BackendError, BackendErrorKind, KmsError, KmsResult};
use crate::key_types::{signing_algorithm, spec_from_key_type, KeyType, KeyUsage, SignerOpts};
use crate::reconcile::{self, key_label, ReconciliationReport};
use crate::store::{KeyEntry, KeyEntryStore, PublicKey, PutOutcome};

/// Why a backend key ended up without a store entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanReason {
    /// A newer key for the same logical id was stored first
    LostRace,

    /// The generate call was canceled after the key was created
    Canceled,

    /// The key was created but its public key could not be fetched
    Abandoned,

    /// A newer key for the same logical id replaced it and its deletion
    /// never completed; also how reconciliation reports older duplicates
    Superseded,
}

/// Backend key that no store entry refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedKey {
    pub handle: String,
    pub logical_id: String,
    pub reason: OrphanReason,
    pub detected_at: DateTime<Utc>,
}

/// Outcome of [`KeyLifecycle::sweep_orphaned_keys`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Handles now scheduled for deletion
    pub deleted: Vec<String>,

    /// Handles still orphaned
    pub failed: Vec<String>,
}

/// Generate, rotate, sign and look up keys
pub struct KeyLifecycle<B: KmsBackend> {
    backend: B,
    store: KeyEntryStore,
    key_tag_prefix: String,
    deletion_window_days: u32,
    cleanup_timeout: Duration,
    orphans: Mutex<Vec<OrphanedKey>>,
}

impl<B: KmsBackend> KeyLifecycle<B> {
    /// Create a lifecycle with an empty store
    pub fn new(backend: B, config: &KmsConfig) -> Self {
        Self {
            backend,
            store: KeyEntryStore::new(),
            key_tag_prefix: config.key_tag_prefix.clone(),
            deletion_window_days: config.deletion_window_days,
            cleanup_timeout: config.cleanup_timeout(),
            orphans: Mutex::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn store(&self) -> &KeyEntryStore {
        &self.store
    }

    /// Load the keys the backend already holds into the store
    ///
    /// Older duplicates of a logical id are added to the orphan ledger.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> KmsResult<ReconciliationReport> {
        let report =
            reconcile::reconcile(&self.backend, &self.store, &self.key_tag_prefix, cancel).await?;

        let detected_at = Utc::now();
        let superseded = report
            .superseded
            .iter()
            .map(|key| OrphanedKey {
                handle: key.handle.clone(),
                logical_id: key.logical_id.clone(),
                reason: OrphanReason::Superseded,
                detected_at,
            })
            .collect();
        self.merge_orphans(superseded, false);

        Ok(report)
    }

    /// Create a new backend key for `logical_id` and make it current
    ///
    /// If a previous key was current it is scheduled for deletion. If a newer
    /// key won the race for `logical_id` in the meantime, the new key is left
    /// in the backend and recorded as orphaned; its public key is still
    /// returned.
    pub async fn generate_key(
        &self,
        logical_id: &str,
        key_type: KeyType,
        cancel: &CancellationToken,
    ) -> KmsResult<PublicKey> {
        validate_logical_id(logical_id)?;
        let spec = spec_from_key_type(key_type)?;
        let label = key_label(&self.key_tag_prefix, logical_id);

        let created = call_backend(
            "create_key",
            error_codes::BACKEND_CREATE_KEY_FAILED,
            cancel,
            self.backend
                .create_key(&spec, KeyUsage::SignVerify, &label, cancel),
        )
        .await?;

        let pkix_data = match call_backend(
            "get_public_key",
            error_codes::BACKEND_GET_PUBLIC_KEY_FAILED,
            cancel,
            self.backend.get_public_key(&created.handle, cancel),
        )
        .await
        {
            Ok(pkix_data) => pkix_data,
            Err(error @ KmsError::Canceled { .. }) => {
                self.discard_created_key(&created.handle, logical_id).await;
                return Err(error);
            }
            Err(error) => {
                self.record_orphan(&created.handle, logical_id, OrphanReason::Abandoned);
                return Err(error);
            }
        };

        if cancel.is_cancelled() {
            self.discard_created_key(&created.handle, logical_id).await;
            return Err(KmsError::canceled("generate_key"));
        }

        let entry = KeyEntry {
            backend_handle: created.handle.clone(),
            creation_time: created.creation_time,
            public_key: PublicKey {
                id: logical_id.to_string(),
                key_type,
                pkix_data,
            },
        };
        let public_key = entry.public_key.clone();

        match self.store.put_replacing(logical_id, entry) {
            PutOutcome::Adopted {
                replaced: Some(old),
            } => {
                log::info!(
                    "Rotated key {}: backend key {} replaces {} (fingerprint {})",
                    logical_id,
                    created.handle,
                    old.backend_handle,
                    public_key.fingerprint()
                );
                self.decommission(&old).await?;
            }
            PutOutcome::Adopted { replaced: None } => {
                log::info!(
                    "Generated key {}: backend key {} (fingerprint {})",
                    logical_id,
                    created.handle,
                    public_key.fingerprint()
                );
            }
            PutOutcome::Rejected => {
                log::warn!(
                    "Backend key {} for {} lost to a newer key and is orphaned",
                    created.handle,
                    logical_id
                );
                self.record_orphan(&created.handle, logical_id, OrphanReason::LostRace);
            }
        }

        Ok(public_key)
    }

    /// Sign a precomputed digest with the current key of `logical_id`
    pub async fn sign_data(
        &self,
        logical_id: &str,
        digest: &[u8],
        opts: &SignerOpts,
        cancel: &CancellationToken,
    ) -> KmsResult<Vec<u8>> {
        let entry = self
            .store
            .get(logical_id)
            .ok_or_else(|| KmsError::not_found(logical_id))?;

        let algorithm = signing_algorithm(entry.key_type(), opts)?;

        let expected_len = algorithm.hash().digest_len();
        if digest.len() != expected_len {
            return Err(KmsError::InvalidArgument {
                parameter: "digest".to_string(),
                expected: format!("{} bytes for {}", expected_len, algorithm),
                actual: format!("{} bytes", digest.len()),
                error_code: error_codes::INVALID_DIGEST_LENGTH,
            });
        }

        if let SignerOpts::Pss { hash, salt_length } = opts {
            // 0 and -1 ask for the default, which is the hash length
            if *salt_length > 0 && *salt_length as usize != hash.digest_len() {
                log::warn!(
                    "Ignoring PSS salt length {} for key {}; the backend always uses {}",
                    salt_length,
                    logical_id,
                    hash.digest_len()
                );
            }
        }

        call_backend(
            "sign_digest",
            error_codes::BACKEND_SIGN_FAILED,
            cancel,
            self.backend
                .sign_digest(&entry.backend_handle, digest, algorithm, cancel),
        )
        .await
    }

    /// Current public key of `logical_id`
    pub fn public_key(&self, logical_id: &str) -> Option<PublicKey> {
        self.store.get(logical_id).map(|entry| entry.public_key)
    }

    /// Public keys of every logical id, in no particular order
    pub fn public_keys(&self) -> Vec<PublicKey> {
        self.store
            .list_all()
            .into_iter()
            .map(|entry| entry.public_key)
            .collect()
    }

    /// Backend keys that no store entry refers to
    pub fn orphaned_keys(&self) -> Vec<OrphanedKey> {
        self.lock_orphans().clone()
    }

    /// Carry orphans over from an earlier lifecycle
    ///
    /// An incoming orphan replaces a ledger entry with the same handle. Keys
    /// that are current in this store are not orphans and are dropped.
    pub fn adopt_orphans(&self, orphans: Vec<OrphanedKey>) {
        self.merge_orphans(orphans, true);
    }

    /// Schedule deletion of every orphaned key
    ///
    /// Keys whose deletion fails stay in the orphan list. A key that has since
    /// become current is dropped from the list without being deleted.
    /// Cancellation stops the sweep; keys already handled are still removed
    /// from the list.
    pub async fn sweep_orphaned_keys(&self, cancel: &CancellationToken) -> KmsResult<SweepReport> {
        let orphans = self.orphaned_keys();
        let current = self.current_handles();
        let mut report = SweepReport::default();
        let mut resolved = Vec::new();
        let mut canceled = None;

        for orphan in orphans {
            if current.contains(&orphan.handle) {
                log::debug!(
                    "Backend key {} is current for {}; dropping it from the orphan list",
                    orphan.handle,
                    orphan.logical_id
                );
                resolved.push(orphan.handle);
                continue;
            }

            let result = call_backend(
                "schedule_key_deletion",
                error_codes::BACKEND_SCHEDULE_DELETION_FAILED,
                cancel,
                self.backend
                    .schedule_key_deletion(&orphan.handle, self.deletion_window_days, cancel),
            )
            .await;
            match result {
                Ok(()) => {
                    log::info!(
                        "Scheduled deletion of orphaned backend key {} ({})",
                        orphan.handle,
                        orphan.logical_id
                    );
                    report.deleted.push(orphan.handle);
                }
                Err(error @ KmsError::Canceled { .. }) => {
                    canceled = Some(error);
                    break;
                }
                Err(error) => {
                    log::error!(
                        "Failed to delete orphaned backend key {}: {}",
                        orphan.handle,
                        error
                    );
                    report.failed.push(orphan.handle);
                }
            }
        }

        self.lock_orphans().retain(|orphan| {
            !report.deleted.contains(&orphan.handle) && !resolved.contains(&orphan.handle)
        });

        match canceled {
            Some(error) => Err(error),
            None => Ok(report),
        }
    }

    // The rotation has already committed, so the deletion runs on its own
    // token bounded by the cleanup timeout rather than the caller's token.
    async fn decommission(&self, old: &KeyEntry) -> KmsResult<()> {
        let cleanup = CancellationToken::new();
        let attempt = tokio::time::timeout(
            self.cleanup_timeout,
            call_backend(
                "schedule_key_deletion",
                error_codes::BACKEND_SCHEDULE_DELETION_FAILED,
                &cleanup,
                self.backend.schedule_key_deletion(
                    &old.backend_handle,
                    self.deletion_window_days,
                    &cleanup,
                ),
            ),
        )
        .await;
        let result = attempt.unwrap_or_else(|_| {
            Err(KmsError::backend(
                "schedule_key_deletion",
                BackendError::new(
                    BackendErrorKind::Unavailable,
                    format!("no response within {} ms", self.cleanup_timeout.as_millis()),
                ),
                error_codes::BACKEND_SCHEDULE_DELETION_FAILED,
            ))
        });

        if let Err(error) = &result {
            log::error!(
                "Failed to schedule deletion of superseded backend key {}: {}",
                old.backend_handle,
                error
            );
            self.record_orphan(&old.backend_handle, old.logical_id(), OrphanReason::Superseded);
        }
        result
    }

    // Best effort: the caller's token has fired, so the cleanup runs on its
    // own token bounded by the cleanup timeout.
    async fn discard_created_key(&self, handle: &str, logical_id: &str) {
        let cleanup = CancellationToken::new();
        let attempt = tokio::time::timeout(
            self.cleanup_timeout,
            self.backend
                .schedule_key_deletion(handle, self.deletion_window_days, &cleanup),
        )
        .await;

        match attempt {
            Ok(Ok(())) => {
                log::info!(
                    "Generate for {} canceled; scheduled deletion of backend key {}",
                    logical_id,
                    handle
                );
            }
            Ok(Err(error)) => {
                log::warn!(
                    "Generate for {} canceled; could not delete backend key {}: {}",
                    logical_id,
                    handle,
                    error
                );
                self.record_orphan(handle, logical_id, OrphanReason::Canceled);
            }
            Err(_) => {
                log::warn!(
                    "Generate for {} canceled; deleting backend key {} timed out",
                    logical_id,
                    handle
                );
                self.record_orphan(handle, logical_id, OrphanReason::Canceled);
            }
        }
    }

    fn record_orphan(&self, handle: &str, logical_id: &str, reason: OrphanReason) {
        self.lock_orphans().push(OrphanedKey {
            handle: handle.to_string(),
            logical_id: logical_id.to_string(),
            reason,
            detected_at: Utc::now(),
        });
    }

    fn merge_orphans(&self, orphans: Vec<OrphanedKey>, replace: bool) {
        let current = self.current_handles();
        let mut ledger = self.lock_orphans();
        for orphan in orphans {
            if current.contains(&orphan.handle) {
                continue;
            }
            match ledger.iter_mut().find(|known| known.handle == orphan.handle) {
                Some(known) if replace => *known = orphan,
                Some(_) => {}
                None => ledger.push(orphan),
            }
        }
    }

    fn current_handles(&self) -> HashSet<String> {
        self.store
            .list_all()
            .into_iter()
            .map(|entry| entry.backend_handle)
            .collect()
    }

    fn lock_orphans(&self) -> MutexGuard<'_, Vec<OrphanedKey>> {
        self.orphans.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) fn validate_logical_id(logical_id: &str) -> KmsResult<()> {
    if logical_id.is_empty() {
        return Err(KmsError::invalid_argument(
            "key_id",
            "a non-empty logical key id",
            "empty string",
        ));
    }
    Ok(())
}
