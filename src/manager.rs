/*!
 * Key manager
 *
 * The operations exposed to a transport layer. `configure` validates the
 * configuration, connects to the backend and rebuilds the key table; every
 * other operation works on the state installed by the last successful
 * `configure`.
 */

use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;

use crate::backend::BackendConnector;
use crate::config::KmsConfig;
use crate::error::{KmsError, KmsResult};
use crate::key_types::{KeyType, SignerOpts};
use crate::lifecycle::{validate_logical_id, KeyLifecycle, OrphanedKey, SweepReport};
use crate::reconcile::ReconciliationReport;
use crate::store::PublicKey;

/// Name, version and description of this key manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
}

/// Key manager backed by a remote key-custody service
pub struct KeyManager<C: BackendConnector> {
    connector: C,
    lifecycle: RwLock<Option<Arc<KeyLifecycle<C::Client>>>>,
    // Held for a whole configure so reconfigurations install in call order
    configuring: tokio::sync::Mutex<()>,
}

impl<C: BackendConnector> KeyManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            lifecycle: RwLock::new(None),
            configuring: tokio::sync::Mutex::new(()),
        }
    }

    /// Configure from JSON text
    ///
    /// Decodes and validates the configuration, then behaves like
    /// [`configure_with`](Self::configure_with).
    pub async fn configure(
        &self,
        config_text: &str,
        cancel: &CancellationToken,
    ) -> KmsResult<ReconciliationReport> {
        let config = KmsConfig::from_json(config_text)?;
        self.configure_with(config, cancel).await
    }

    /// Connect to the backend and rebuild the key table from its keys
    ///
    /// Keys that fail to load are logged and reported but do not fail the
    /// call. On error the previously configured state stays in place.
    ///
    /// Concurrent calls run one after another. Orphans tracked by the
    /// previous state are carried over, next to the older duplicates this
    /// reconciliation finds.
    pub async fn configure_with(
        &self,
        config: KmsConfig,
        cancel: &CancellationToken,
    ) -> KmsResult<ReconciliationReport> {
        let _configuring = self.configuring.lock().await;
        config.validate()?;
        let client = self.connector.connect(&config)?;
        let lifecycle = KeyLifecycle::new(client, &config);

        let report = lifecycle.reconcile(cancel).await?;
        if let Some(partial) = report.partial_failure() {
            log::warn!("{}", partial);
        }

        log::info!(
            "Key manager configured for region {} with {} keys",
            config.region,
            lifecycle.store().len()
        );
        let mut installed = self
            .lifecycle
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = installed.as_ref() {
            lifecycle.adopt_orphans(previous.orphaned_keys());
        }
        *installed = Some(Arc::new(lifecycle));

        Ok(report)
    }

    pub fn plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            description: env!("CARGO_PKG_DESCRIPTION"),
        }
    }

    /// Generate or rotate the key behind `logical_id`
    pub async fn generate_key(
        &self,
        logical_id: &str,
        key_type: KeyType,
        cancel: &CancellationToken,
    ) -> KmsResult<PublicKey> {
        self.lifecycle()?
            .generate_key(logical_id, key_type, cancel)
            .await
    }

    /// Sign a precomputed digest with the key behind `logical_id`
    pub async fn sign_data(
        &self,
        logical_id: &str,
        digest: &[u8],
        opts: &SignerOpts,
        cancel: &CancellationToken,
    ) -> KmsResult<Vec<u8>> {
        self.lifecycle()?
            .sign_data(logical_id, digest, opts, cancel)
            .await
    }

    /// Public key behind `logical_id`, or `None` if there is no such key
    pub fn get_public_key(&self, logical_id: &str) -> KmsResult<Option<PublicKey>> {
        validate_logical_id(logical_id)?;
        Ok(self.lifecycle()?.public_key(logical_id))
    }

    pub fn get_public_keys(&self) -> KmsResult<Vec<PublicKey>> {
        Ok(self.lifecycle()?.public_keys())
    }

    pub fn orphaned_keys(&self) -> KmsResult<Vec<OrphanedKey>> {
        Ok(self.lifecycle()?.orphaned_keys())
    }

    pub async fn sweep_orphaned_keys(&self, cancel: &CancellationToken) -> KmsResult<SweepReport> {
        self.lifecycle()?.sweep_orphaned_keys(cancel).await
    }

    fn lifecycle(&self) -> KmsResult<Arc<KeyLifecycle<C::Client>>> {
        self.lifecycle
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(KmsError::not_configured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendOp, InMemoryBackend, InMemoryConnector};
    use crate::error::{error_codes, BackendError, BackendErrorKind};
    use crate::lifecycle::OrphanReason;
    use std::time::Duration;

    const CONFIG: &str = r#"{
        "access_key_id": "AKIDEXAMPLE",
        "secret_access_key": "secret",
        "region": "us-west-2"
    }"#;

    fn manager() -> (Arc<InMemoryBackend>, KeyManager<InMemoryConnector>) {
        let backend = Arc::new(InMemoryBackend::new());
        let manager = KeyManager::new(InMemoryConnector::new(Arc::clone(&backend)));
        (backend, manager)
    }

    #[tokio::test]
    async fn test_calls_before_configure_fail() {
        let (_, manager) = manager();
        let cancel = CancellationToken::new();
        let err = manager
            .generate_key("svid-1", KeyType::EcP256, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), error_codes::NOT_CONFIGURED);
        assert!(manager.get_public_keys().is_err());
        assert_eq!(manager.plugin_info().name, "kms-keymanager");
    }

    #[tokio::test]
    async fn test_invalid_config_does_not_connect() {
        let (backend, manager) = manager();
        let err = manager
            .configure(r#"{"region": "us-west-2"}"#, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "ConfigInvalid");
        assert_eq!(backend.call_count(BackendOp::ListKeys), 0);
    }

    #[tokio::test]
    async fn test_failed_reconfigure_keeps_previous_state() {
        let (backend, manager) = manager();
        let cancel = CancellationToken::new();
        manager.configure(CONFIG, &cancel).await.unwrap();
        manager.generate_key("svid-1", KeyType::EcP256, &cancel).await.unwrap();

        backend.fail_operation(
            BackendOp::ListKeys,
            None,
            BackendError::new(BackendErrorKind::Unavailable, "down"),
        );
        assert!(manager.configure(CONFIG, &cancel).await.is_err());
        assert!(manager.get_public_key("svid-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reconfigure_rebuilds_from_backend() {
        let (_, manager) = manager();
        let cancel = CancellationToken::new();
        manager.configure(CONFIG, &cancel).await.unwrap();
        let first = manager
            .generate_key("svid-1", KeyType::EcP256, &cancel)
            .await
            .unwrap();

        let report = manager.configure(CONFIG, &cancel).await.unwrap();
        assert_eq!(report.reconciled, 1);
        assert_eq!(manager.get_public_key("svid-1").unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_get_public_key_requires_id() {
        let (_, manager) = manager();
        manager.configure(CONFIG, &CancellationToken::new()).await.unwrap();
        assert!(manager.get_public_key("").is_err());
        assert_eq!(manager.get_public_key("missing").unwrap(), None);
    }

    #[tokio::test]
    async fn test_reconfigure_keeps_orphans() {
        let (backend, manager) = manager();
        let cancel = CancellationToken::new();
        manager.configure(CONFIG, &cancel).await.unwrap();
        backend.set_clock(chrono::Utc::now());
        manager.generate_key("svid-1", KeyType::EcP256, &cancel).await.unwrap();

        // The next key is older than the current one and loses
        backend.set_clock(chrono::Utc::now() - chrono::Duration::minutes(10));
        manager.generate_key("svid-1", KeyType::EcP256, &cancel).await.unwrap();
        let lost = manager.orphaned_keys().unwrap();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].reason, OrphanReason::LostRace);

        let report = manager.configure(CONFIG, &cancel).await.unwrap();
        assert_eq!(report.superseded.len(), 1);
        assert_eq!(manager.orphaned_keys().unwrap(), lost);

        let sweep = manager.sweep_orphaned_keys(&cancel).await.unwrap();
        assert_eq!(sweep.deleted, vec![lost[0].handle.clone()]);
        assert_eq!(backend.deletion_requests(), vec![lost[0].handle.clone()]);
    }

    #[tokio::test]
    async fn test_restart_finds_leaked_keys() {
        let (backend, manager) = manager();
        let cancel = CancellationToken::new();
        manager.configure(CONFIG, &cancel).await.unwrap();
        backend.set_clock(chrono::Utc::now());
        manager.generate_key("svid-1", KeyType::EcP256, &cancel).await.unwrap();
        backend.set_clock(chrono::Utc::now() - chrono::Duration::minutes(10));
        manager.generate_key("svid-1", KeyType::EcP256, &cancel).await.unwrap();
        let leaked = manager.orphaned_keys().unwrap()[0].handle.clone();
        let current = manager.get_public_key("svid-1").unwrap();
        drop(manager);

        let restarted = KeyManager::new(InMemoryConnector::new(Arc::clone(&backend)));
        restarted.configure(CONFIG, &cancel).await.unwrap();
        let orphans = restarted.orphaned_keys().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].handle, leaked);
        assert_eq!(orphans[0].reason, OrphanReason::Superseded);
        assert_eq!(restarted.get_public_key("svid-1").unwrap(), current);

        restarted.sweep_orphaned_keys(&cancel).await.unwrap();
        assert_eq!(backend.deletion_requests(), vec![leaked]);
    }

    #[tokio::test]
    async fn test_concurrent_configures_run_one_after_another() {
        let (backend, manager) = manager();
        backend.set_latency(Some(Duration::from_millis(200)));
        let cancel = CancellationToken::new();

        let started = tokio::time::Instant::now();
        let (first, second) = tokio::join!(
            manager.configure(CONFIG, &cancel),
            manager.configure(CONFIG, &cancel)
        );
        first.unwrap();
        second.unwrap();

        // Each pass lists keys once; overlapping passes would finish together
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert_eq!(backend.call_count(BackendOp::ListKeys), 2);
    }
}
