/*!
 * Key manager configuration
 *
 * Decoded from JSON text and validated before any backend client is built.
 */

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{error_codes, KmsError, KmsResult};

/// Label prefix marking a backend key as owned by this key manager
pub const DEFAULT_KEY_TAG_PREFIX: &str = "SPIRE_SERVER_KEY:";

/// Shortest and longest pending window the backend accepts for deletions
pub const MIN_DELETION_WINDOW_DAYS: u32 = 7;
pub const MAX_DELETION_WINDOW_DAYS: u32 = 30;

const DEFAULT_CLEANUP_TIMEOUT_MS: u64 = 5_000;

/// Connection and behavior settings for the key manager
///
/// Fields carry their own serde defaults: the struct wipes itself on drop, so
/// decoding cannot move fields out of a `Default` value.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(deny_unknown_fields)]
pub struct KmsConfig {
    /// Access key id of the backend credentials
    #[serde(default)]
    pub access_key_id: String,

    /// Secret of the backend credentials; wiped on drop
    #[serde(default)]
    pub secret_access_key: String,

    /// Backend region, e.g. `us-west-2`
    #[serde(default)]
    pub region: String,

    /// Endpoint override, for private endpoints or local emulators
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Label prefix identifying keys owned by this key manager
    #[serde(default = "default_key_tag_prefix")]
    pub key_tag_prefix: String,

    /// Days a superseded key stays pending before the backend deletes it
    #[serde(default = "default_deletion_window_days")]
    pub deletion_window_days: u32,

    /// Upper bound on best-effort backend cleanup that runs after the caller's
    /// token has fired
    #[serde(default = "default_cleanup_timeout_ms")]
    pub cleanup_timeout_ms: u64,
}

fn default_key_tag_prefix() -> String {
    DEFAULT_KEY_TAG_PREFIX.to_string()
}

fn default_deletion_window_days() -> u32 {
    MAX_DELETION_WINDOW_DAYS
}

fn default_cleanup_timeout_ms() -> u64 {
    DEFAULT_CLEANUP_TIMEOUT_MS
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            access_key_id: String::new(),
            secret_access_key: String::new(),
            region: String::new(),
            endpoint: None,
            key_tag_prefix: default_key_tag_prefix(),
            deletion_window_days: default_deletion_window_days(),
            cleanup_timeout_ms: default_cleanup_timeout_ms(),
        }
    }
}

impl fmt::Debug for KmsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmsConfig")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("key_tag_prefix", &self.key_tag_prefix)
            .field("deletion_window_days", &self.deletion_window_days)
            .field("cleanup_timeout_ms", &self.cleanup_timeout_ms)
            .finish()
    }
}

impl KmsConfig {
    /// Decode configuration from JSON and validate it
    pub fn from_json(text: &str) -> KmsResult<Self> {
        let config: KmsConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields and value ranges
    pub fn validate(&self) -> KmsResult<()> {
        let required = [
            ("access_key_id", &self.access_key_id),
            ("secret_access_key", &self.secret_access_key),
            ("region", &self.region),
            ("key_tag_prefix", &self.key_tag_prefix),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(KmsError::config_invalid(
                    field,
                    "is required",
                    error_codes::CONFIG_MISSING_FIELD,
                ));
            }
        }

        if let Some(endpoint) = &self.endpoint {
            if !(endpoint.starts_with("https://") || endpoint.starts_with("http://")) {
                return Err(KmsError::config_invalid(
                    "endpoint",
                    "must be an http:// or https:// URL",
                    error_codes::CONFIG_OUT_OF_RANGE,
                ));
            }
        }

        if !(MIN_DELETION_WINDOW_DAYS..=MAX_DELETION_WINDOW_DAYS)
            .contains(&self.deletion_window_days)
        {
            return Err(KmsError::config_invalid(
                "deletion_window_days",
                &format!(
                    "must be between {} and {}, got {}",
                    MIN_DELETION_WINDOW_DAYS, MAX_DELETION_WINDOW_DAYS, self.deletion_window_days
                ),
                error_codes::CONFIG_OUT_OF_RANGE,
            ));
        }

        if self.cleanup_timeout_ms == 0 {
            return Err(KmsError::config_invalid(
                "cleanup_timeout_ms",
                "must be greater than zero",
                error_codes::CONFIG_OUT_OF_RANGE,
            ));
        }

        Ok(())
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }
}
