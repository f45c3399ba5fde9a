/*!
 * In-memory key-custody backend
 *
 * Keeps key metadata in process and derives stand-in public keys and
 * signatures from SHA-256, so the key manager can run without a network
 * service. The public keys and signatures are not real key material: the
 * public key bytes are not DER SubjectPublicKeyInfo and must not be handed to
 * anything that parses them. Use [`InMemoryBackend::verify`] to check
 * signatures.
 *
 * Creation times come from an internal clock that advances by one second per
 * created key, and failures and latency can be injected per operation.
 */

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use super::{BackendConnector, BackendResult, KeyDescription, KmsBackend};
use crate::config::KmsConfig;
use crate::error::{BackendError, BackendErrorKind, KmsResult};
use crate::key_types::{KeySpec, KeyUsage, SigningAlgorithm};

/// Backend operations, used to inject failures and count calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    CreateKey,
    DescribeKey,
    GetPublicKey,
    ListKeys,
    ScheduleKeyDeletion,
    SignDigest,
}

#[derive(Debug, Clone)]
struct StoredKey {
    description: KeyDescription,
    usage: KeyUsage,
    pending_deletion: bool,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    op: BackendOp,
    handle: Option<String>,
    error: BackendError,
}

#[derive(Debug)]
struct MemoryState {
    keys: HashMap<String, StoredKey>,
    // Listing order follows creation order
    order: Vec<String>,
    clock: DateTime<Utc>,
    deletion_requests: Vec<(String, u32)>,
    failures: Vec<InjectedFailure>,
    calls: HashMap<BackendOp, usize>,
    latency: Option<Duration>,
}

/// Thread-safe in-memory implementation of [`KmsBackend`]
#[derive(Debug)]
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                keys: HashMap::new(),
                order: Vec::new(),
                clock: Utc.timestamp_opt(1_600_000_000, 0).single().unwrap_or_default(),
                deletion_requests: Vec::new(),
                failures: Vec::new(),
                calls: HashMap::new(),
                latency: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a key directly, bypassing `create_key`; returns its handle
    pub fn insert_key(
        &self,
        spec: KeySpec,
        label: &str,
        enabled: bool,
        creation_time: DateTime<Utc>,
    ) -> String {
        let handle = uuid::Uuid::new_v4().to_string();
        let mut state = self.lock();
        state.keys.insert(
            handle.clone(),
            StoredKey {
                description: KeyDescription {
                    handle: handle.clone(),
                    spec,
                    enabled,
                    label: label.to_string(),
                    creation_time,
                },
                usage: KeyUsage::SignVerify,
                pending_deletion: false,
            },
        );
        state.order.push(handle.clone());
        handle
    }

    /// Set the creation time handed to the next created key
    pub fn set_clock(&self, now: DateTime<Utc>) {
        self.lock().clock = now;
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Make `op` fail with `error`, for every key or only for `handle`
    pub fn fail_operation(&self, op: BackendOp, handle: Option<&str>, error: BackendError) {
        self.lock().failures.push(InjectedFailure {
            op,
            handle: handle.map(str::to_string),
            error,
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Handles passed to `schedule_key_deletion`, in call order
    pub fn deletion_requests(&self) -> Vec<String> {
        self.lock()
            .deletion_requests
            .iter()
            .map(|(handle, _)| handle.clone())
            .collect()
    }

    /// Pending window requested for each deletion, in call order
    pub fn deletion_windows(&self) -> Vec<u32> {
        self.lock()
            .deletion_requests
            .iter()
            .map(|(_, days)| *days)
            .collect()
    }

    pub fn call_count(&self, op: BackendOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of keys held, including those pending deletion
    pub fn key_count(&self) -> usize {
        self.lock().keys.len()
    }

    pub fn is_pending_deletion(&self, handle: &str) -> bool {
        self.lock()
            .keys
            .get(handle)
            .map_or(false, |key| key.pending_deletion)
    }

    /// Check a signature produced by this backend
    pub fn verify(
        &self,
        handle: &str,
        digest: &[u8],
        algorithm: SigningAlgorithm,
        signature: &[u8],
    ) -> bool {
        self.lock().keys.contains_key(handle)
            && fake_signature(handle, digest, algorithm) == signature
    }

    /// Count the call, apply injected failures, and return the latency to wait
    fn begin(&self, op: BackendOp, handle: Option<&str>) -> BackendResult<Option<Duration>> {
        let mut state = self.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        let injected = state.failures.iter().find(|failure| {
            failure.op == op
                && match (&failure.handle, handle) {
                    (None, _) => true,
                    (Some(wanted), Some(actual)) => wanted == actual,
                    (Some(_), None) => false,
                }
        });
        match injected {
            Some(failure) => Err(failure.error.clone()),
            None => Ok(state.latency),
        }
    }

    async fn wait(latency: Option<Duration>, cancel: &CancellationToken) -> BackendResult<()> {
        let Some(latency) = latency else {
            return Ok(());
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(BackendError::new(
                BackendErrorKind::Unavailable,
                "request canceled by caller",
            )),
            _ = tokio::time::sleep(latency) => Ok(()),
        }
    }

    fn live_key(state: &MemoryState, handle: &str) -> BackendResult<StoredKey> {
        let key = state.keys.get(handle).ok_or_else(|| {
            BackendError::new(BackendErrorKind::NotFound, format!("key {} does not exist", handle))
        })?;
        if key.pending_deletion {
            return Err(BackendError::new(
                BackendErrorKind::InvalidRequest,
                format!("key {} is pending deletion", handle),
            ));
        }
        Ok(key.clone())
    }
}

/// Stand-in public key: SHA-256 of the handle, unique per key
fn fake_public_key(handle: &str) -> Vec<u8> {
    Sha256::digest(format!("public:{}", handle).as_bytes()).to_vec()
}

fn fake_signature(handle: &str, digest: &[u8], algorithm: SigningAlgorithm) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(handle.as_bytes());
    hasher.update(algorithm.as_str().as_bytes());
    hasher.update(digest);
    hasher.finalize().to_vec()
}

#[async_trait]
impl KmsBackend for InMemoryBackend {
    async fn create_key(
        &self,
        spec: &KeySpec,
        usage: KeyUsage,
        label: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<KeyDescription> {
        let latency = self.begin(BackendOp::CreateKey, None)?;
        Self::wait(latency, cancel).await?;

        if let KeySpec::Other(name) = spec {
            return Err(BackendError::new(
                BackendErrorKind::InvalidRequest,
                format!("unknown key spec {}", name),
            ));
        }

        let handle = uuid::Uuid::new_v4().to_string();
        let mut state = self.lock();
        let creation_time = state.clock;
        state.clock = creation_time + chrono::Duration::seconds(1);
        let description = KeyDescription {
            handle: handle.clone(),
            spec: spec.clone(),
            enabled: true,
            label: label.to_string(),
            creation_time,
        };
        state.keys.insert(
            handle.clone(),
            StoredKey {
                description: description.clone(),
                usage,
                pending_deletion: false,
            },
        );
        state.order.push(handle);
        Ok(description)
    }

    async fn describe_key(
        &self,
        handle: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<KeyDescription> {
        let latency = self.begin(BackendOp::DescribeKey, Some(handle))?;
        Self::wait(latency, cancel).await?;

        let state = self.lock();
        let key = state.keys.get(handle).ok_or_else(|| {
            BackendError::new(BackendErrorKind::NotFound, format!("key {} does not exist", handle))
        })?;
        let mut description = key.description.clone();
        description.enabled = description.enabled && !key.pending_deletion;
        Ok(description)
    }

    async fn get_public_key(
        &self,
        handle: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<Vec<u8>> {
        let latency = self.begin(BackendOp::GetPublicKey, Some(handle))?;
        Self::wait(latency, cancel).await?;

        let state = self.lock();
        let key = Self::live_key(&state, handle)?;
        if matches!(key.description.spec, KeySpec::SymmetricDefault) {
            return Err(BackendError::new(
                BackendErrorKind::InvalidRequest,
                "symmetric keys have no public key",
            ));
        }
        Ok(fake_public_key(handle))
    }

    async fn list_keys(&self, cancel: &CancellationToken) -> BackendResult<Vec<String>> {
        let latency = self.begin(BackendOp::ListKeys, None)?;
        Self::wait(latency, cancel).await?;

        Ok(self.lock().order.clone())
    }

    async fn schedule_key_deletion(
        &self,
        handle: &str,
        pending_window_days: u32,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        let latency = self.begin(BackendOp::ScheduleKeyDeletion, Some(handle))?;
        Self::wait(latency, cancel).await?;

        let mut state = self.lock();
        state
            .deletion_requests
            .push((handle.to_string(), pending_window_days));
        Self::live_key(&state, handle)?;
        if let Some(key) = state.keys.get_mut(handle) {
            key.pending_deletion = true;
        }
        Ok(())
    }

    async fn sign_digest(
        &self,
        handle: &str,
        digest: &[u8],
        algorithm: SigningAlgorithm,
        cancel: &CancellationToken,
    ) -> BackendResult<Vec<u8>> {
        let latency = self.begin(BackendOp::SignDigest, Some(handle))?;
        Self::wait(latency, cancel).await?;

        let state = self.lock();
        let key = Self::live_key(&state, handle)?;
        if key.usage != KeyUsage::SignVerify || !key.description.enabled {
            return Err(BackendError::new(
                BackendErrorKind::InvalidRequest,
                format!("key {} cannot sign", handle),
            ));
        }
        if digest.len() != algorithm.hash().digest_len() {
            return Err(BackendError::new(
                BackendErrorKind::InvalidRequest,
                format!("digest length {} does not match {}", digest.len(), algorithm),
            ));
        }
        Ok(fake_signature(handle, digest, algorithm))
    }
}

/// Connector that hands out one shared [`InMemoryBackend`]
///
/// Configuring twice reuses the same backend, the way a real service keeps its
/// keys across reconnects.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConnector {
    backend: Arc<InMemoryBackend>,
}

impl InMemoryConnector {
    pub fn new(backend: Arc<InMemoryBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> Arc<InMemoryBackend> {
        Arc::clone(&self.backend)
    }
}

impl BackendConnector for InMemoryConnector {
    type Client = Arc<InMemoryBackend>;

    fn connect(&self, config: &KmsConfig) -> KmsResult<Self::Client> {
        log::info!(
            "Connecting to in-memory key-custody backend for region {}",
            config.region
        );
        Ok(Arc::clone(&self.backend))
    }
}
