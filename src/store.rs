/*!
 * Key Entry Store
 *
 * Holds the current backend key for every logical key id. Writes only win
 * when they carry a strictly newer backend creation time.
 */

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::key_types::KeyType;

/// Public half of a logical key, as handed to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    /// Logical key id
    pub id: String,

    /// Key type of the backing key
    pub key_type: KeyType,

    /// DER-encoded SubjectPublicKeyInfo
    pub pkix_data: Vec<u8>,
}

impl PublicKey {
    /// Hex SHA-256 of the SubjectPublicKeyInfo
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.pkix_data))
    }

    /// PEM encoding of the SubjectPublicKeyInfo
    pub fn to_pem(&self) -> String {
        let body = base64::encode(&self.pkix_data);
        let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
        for line in body.as_bytes().chunks(64) {
            pem.push_str(&String::from_utf8_lossy(line));
            pem.push('\n');
        }
        pem.push_str("-----END PUBLIC KEY-----\n");
        pem
    }
}

/// Current backing material of one logical key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    /// Opaque id of the backend key object
    pub backend_handle: String,

    /// Creation time assigned by the backend
    pub creation_time: DateTime<Utc>,

    pub public_key: PublicKey,
}

impl KeyEntry {
    pub fn logical_id(&self) -> &str {
        &self.public_key.id
    }

    pub fn key_type(&self) -> KeyType {
        self.public_key.key_type
    }
}

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The entry is now current; `replaced` is the one it superseded
    Adopted { replaced: Option<KeyEntry> },

    /// A newer or equally old entry is already current
    Rejected,
}

/// Concurrency-safe map from logical key id to its current entry
///
/// One mutex guards the whole map. It is never held across an await point.
#[derive(Debug, Default)]
pub struct KeyEntryStore {
    entries: Mutex<HashMap<String, KeyEntry>>,
}

impl KeyEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // The map only ever holds whole entries, so a panic elsewhere cannot leave
    // it half-written and the poison flag can be ignored.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, KeyEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current entry for `logical_id`
    pub fn get(&self, logical_id: &str) -> Option<KeyEntry> {
        self.lock().get(logical_id).cloned()
    }

    /// Adopt `entry` for `logical_id` if there is none yet or `entry` is strictly newer
    ///
    /// Returns whether the entry was adopted. Ties and older entries leave the
    /// store untouched.
    pub fn put(&self, logical_id: &str, entry: KeyEntry) -> bool {
        !matches!(self.put_replacing(logical_id, entry), PutOutcome::Rejected)
    }

    /// Same policy as [`put`](Self::put), but reports the entry that was replaced
    pub fn put_replacing(&self, logical_id: &str, entry: KeyEntry) -> PutOutcome {
        let mut entries = self.lock();
        match entries.get(logical_id) {
            Some(current) if entry.creation_time <= current.creation_time => {
                log::warn!(
                    "Rejected stale entry for key {}: backend key {} created at {} is not newer than {} created at {}",
                    logical_id,
                    entry.backend_handle,
                    entry.creation_time,
                    current.backend_handle,
                    current.creation_time
                );
                PutOutcome::Rejected
            }
            Some(current) => {
                log::debug!(
                    "Replacing entry for key {}: {} -> {}",
                    logical_id,
                    current.backend_handle,
                    entry.backend_handle
                );
                PutOutcome::Adopted {
                    replaced: entries.insert(logical_id.to_string(), entry),
                }
            }
            None => {
                log::debug!("Adding entry for key {}: {}", logical_id, entry.backend_handle);
                entries.insert(logical_id.to_string(), entry);
                PutOutcome::Adopted { replaced: None }
            }
        }
    }

    /// Snapshot of all entries, in no particular order
    pub fn list_all(&self) -> Vec<KeyEntry> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
