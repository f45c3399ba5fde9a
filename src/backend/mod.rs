/*!
 * Backend Client Adapter
 *
 * The narrow interface the key manager uses to reach the remote key-custody
 * service. Concrete SDK bindings implement [`KmsBackend`]; [`InMemoryBackend`]
 * is a self-contained implementation for tests and local runs.
 */

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::KmsConfig;
use crate::error::{BackendError, KmsError, KmsResult};
use crate::key_types::{KeySpec, KeyUsage, SigningAlgorithm};

pub mod memory;

pub use memory::{BackendOp, InMemoryBackend, InMemoryConnector};

/// Result of a single backend call
pub type BackendResult<T> = Result<T, BackendError>;

/// Backend metadata of one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescription {
    pub handle: String,
    pub spec: KeySpec,
    pub enabled: bool,
    /// Free-text description the backend stores with the key
    pub label: String,
    pub creation_time: DateTime<Utc>,
}

/// Operations the key manager needs from the key-custody service
///
/// Every call receives the caller's cancellation token. Implementations should
/// stop waiting on the service once it fires; the key manager also stops
/// waiting on its side.
#[async_trait]
pub trait KmsBackend: Send + Sync {
    /// Create a key and return its metadata
    async fn create_key(
        &self,
        spec: &KeySpec,
        usage: KeyUsage,
        label: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<KeyDescription>;

    async fn describe_key(
        &self,
        handle: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<KeyDescription>;

    /// DER-encoded SubjectPublicKeyInfo of the key
    async fn get_public_key(&self, handle: &str, cancel: &CancellationToken)
        -> BackendResult<Vec<u8>>;

    /// Every key handle visible to the credentials, across all pages
    async fn list_keys(&self, cancel: &CancellationToken) -> BackendResult<Vec<String>>;

    async fn schedule_key_deletion(
        &self,
        handle: &str,
        pending_window_days: u32,
        cancel: &CancellationToken,
    ) -> BackendResult<()>;

    /// Sign a precomputed digest; the backend does not hash it again
    async fn sign_digest(
        &self,
        handle: &str,
        digest: &[u8],
        algorithm: SigningAlgorithm,
        cancel: &CancellationToken,
    ) -> BackendResult<Vec<u8>>;
}

/// Builds a backend client from validated configuration
pub trait BackendConnector: Send + Sync {
    type Client: KmsBackend + 'static;

    fn connect(&self, config: &KmsConfig) -> KmsResult<Self::Client>;
}

/// Await a backend call unless `cancel` fires first
///
/// Backend errors are wrapped as `BackendFailure` for `operation`.
pub(crate) async fn call_backend<T, F>(
    operation: &str,
    error_code: u32,
    cancel: &CancellationToken,
    call: F,
) -> KmsResult<T>
where
    F: Future<Output = BackendResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(KmsError::canceled(operation));
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(KmsError::canceled(operation)),
        result = call => result.map_err(|e| KmsError::backend(operation, e, error_code)),
    }
}

#[async_trait]
impl<B: KmsBackend + ?Sized> KmsBackend for Arc<B> {
    async fn create_key(
        &self,
        spec: &KeySpec,
        usage: KeyUsage,
        label: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<KeyDescription> {
        (**self).create_key(spec, usage, label, cancel).await
    }

    async fn describe_key(
        &self,
        handle: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<KeyDescription> {
        (**self).describe_key(handle, cancel).await
    }

    async fn get_public_key(
        &self,
        handle: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<Vec<u8>> {
        (**self).get_public_key(handle, cancel).await
    }

    async fn list_keys(&self, cancel: &CancellationToken) -> BackendResult<Vec<String>> {
        (**self).list_keys(cancel).await
    }

    async fn schedule_key_deletion(
        &self,
        handle: &str,
        pending_window_days: u32,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        (**self).schedule_key_deletion(handle, pending_window_days, cancel).await
    }

    async fn sign_digest(
        &self,
        handle: &str,
        digest: &[u8],
        algorithm: SigningAlgorithm,
        cancel: &CancellationToken,
    ) -> BackendResult<Vec<u8>> {
        (**self).sign_digest(handle, digest, algorithm, cancel).await
    }
}
