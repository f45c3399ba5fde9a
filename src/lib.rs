/*!
 * KMS Key Manager
 *
 * Manages asymmetric signing keys whose private halves live in a remote
 * key-custody service, and presents them to the caller as a stable table of
 * logical keys.
 *
 * The main pieces are:
 *
 * - A key entry store mapping each logical key id to its current backend key
 * - Reconciliation, which rebuilds that store from the backend on configure
 * - The key lifecycle: generation, rotation with decommissioning, signing
 * - Mapping between caller key types and backend key specs and algorithms
 *
 * The backend is reached through the [`backend::KmsBackend`] trait, so any
 * key-custody service binding can be plugged in.
 */

/// Error types and error codes
pub mod error;

/// Configuration decoding and validation
pub mod config;

/// Key type, key spec and signing algorithm mapping
pub mod key_types;

/// Current key entry per logical key id
pub mod store;

/// Backend client adapter interface and the in-memory backend
pub mod backend;

/// Rebuilding the store from backend keys
pub mod reconcile;

/// Key generation, rotation and signing
pub mod lifecycle;

/// Operations exposed to the transport layer
pub mod manager;

pub use backend::{BackendConnector, InMemoryBackend, InMemoryConnector, KeyDescription, KmsBackend};
pub use config::KmsConfig;
pub use error::{BackendError, BackendErrorKind, KmsError, KmsResult};
pub use key_types::{HashAlgorithm, KeySpec, KeyType, SignerOpts, SigningAlgorithm};
pub use lifecycle::{KeyLifecycle, OrphanReason, OrphanedKey, SweepReport};
pub use manager::{KeyManager, PluginInfo};
pub use reconcile::ReconciliationReport;
pub use store::{KeyEntry, KeyEntryStore, PublicKey};

/// The types most callers need
pub mod prelude {
    pub use crate::backend::{BackendConnector, KmsBackend};
    pub use crate::KeyManager;
    pub use crate::KmsConfig;
    pub use crate::KmsError;
    pub use crate::KmsResult;
    pub use crate::HashAlgorithm;
    pub use crate::KeyType;
    pub use crate::PublicKey;
    pub use crate::SignerOpts;
    pub use tokio_util::sync::CancellationToken;
}
