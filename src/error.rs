/*!
 * Error Handling for the KMS Key Manager
 *
 * Provides the error type shared by every component, stable numeric error
 * codes, user-facing messages and the structured error reported by backend
 * client adapters.
 */

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Error type for all key manager operations
#[derive(Debug, Error)]
pub enum KmsError {
    #[error("Unsupported: {subject} - {reason}")]
    Unsupported {
        subject: String,
        reason: String,
        error_code: u32,
    },

    #[error("Key not found: {logical_id}")]
    NotFound { logical_id: String, error_code: u32 },

    #[error("Backend operation failed: {operation} - {source}")]
    BackendFailure {
        operation: String,
        #[source]
        source: BackendError,
        error_code: u32,
    },

    #[error("Invalid configuration: {field} - {reason}")]
    ConfigInvalid {
        field: String,
        reason: String,
        error_code: u32,
    },

    #[error("Reconciliation incomplete: {failed} of {examined} backend keys could not be reconciled")]
    ReconciliationPartialFailure {
        failed: usize,
        examined: usize,
        error_code: u32,
    },

    #[error("Invalid argument: {parameter} - {expected} - got {actual}")]
    InvalidArgument {
        parameter: String,
        expected: String,
        actual: String,
        error_code: u32,
    },

    #[error("Operation canceled: {operation}")]
    Canceled { operation: String, error_code: u32 },

    #[error("Key manager is not configured")]
    NotConfigured { error_code: u32 },
}

/// Error code constants for different error categories
pub mod error_codes {
    // Type mapping errors: 1000-1999
    pub const UNSUPPORTED_KEY_TYPE: u32 = 1001;
    pub const UNSUPPORTED_KEY_SPEC: u32 = 1002;
    pub const UNSUPPORTED_SIGNING_OPTIONS: u32 = 1003;

    // Store errors: 2000-2999
    pub const KEY_NOT_FOUND: u32 = 2001;

    // Backend errors: 3000-3999
    pub const BACKEND_CREATE_KEY_FAILED: u32 = 3001;
    pub const BACKEND_DESCRIBE_KEY_FAILED: u32 = 3002;
    pub const BACKEND_GET_PUBLIC_KEY_FAILED: u32 = 3003;
    pub const BACKEND_LIST_KEYS_FAILED: u32 = 3004;
    pub const BACKEND_SCHEDULE_DELETION_FAILED: u32 = 3005;
    pub const BACKEND_SIGN_FAILED: u32 = 3006;
    pub const BACKEND_CONNECT_FAILED: u32 = 3007;

    // Configuration errors: 4000-4999
    pub const CONFIG_DECODE_FAILED: u32 = 4001;
    pub const CONFIG_MISSING_FIELD: u32 = 4002;
    pub const CONFIG_OUT_OF_RANGE: u32 = 4003;
    pub const NOT_CONFIGURED: u32 = 4004;

    // Reconciliation errors: 5000-5999
    pub const RECONCILIATION_PARTIAL_FAILURE: u32 = 5001;
    pub const INVALID_KEY_LABEL: u32 = 5002;

    // Caller errors: 6000-6999
    pub const INVALID_ARGUMENT: u32 = 6001;
    pub const INVALID_DIGEST_LENGTH: u32 = 6002;
    pub const OPERATION_CANCELED: u32 = 6003;
}

impl KmsError {
    /// Get the numeric error code for this error
    pub fn error_code(&self) -> u32 {
        match self {
            KmsError::Unsupported { error_code, .. } => *error_code,
            KmsError::NotFound { error_code, .. } => *error_code,
            KmsError::BackendFailure { error_code, .. } => *error_code,
            KmsError::ConfigInvalid { error_code, .. } => *error_code,
            KmsError::ReconciliationPartialFailure { error_code, .. } => *error_code,
            KmsError::InvalidArgument { error_code, .. } => *error_code,
            KmsError::Canceled { error_code, .. } => *error_code,
            KmsError::NotConfigured { error_code } => *error_code,
        }
    }

    /// Get the error category/type as a string
    pub fn error_type(&self) -> &'static str {
        match self {
            KmsError::Unsupported { .. } => "Unsupported",
            KmsError::NotFound { .. } => "NotFound",
            KmsError::BackendFailure { .. } => "BackendFailure",
            KmsError::ConfigInvalid { .. } => "ConfigInvalid",
            KmsError::ReconciliationPartialFailure { .. } => "ReconciliationPartialFailure",
            KmsError::InvalidArgument { .. } => "InvalidArgument",
            KmsError::Canceled { .. } => "Canceled",
            KmsError::NotConfigured { .. } => "NotConfigured",
        }
    }

    /// Get a user-friendly error message
    pub fn user_friendly_message(&self) -> String {
        match self {
            KmsError::Unsupported { subject, .. } => {
                format!("'{}' is not supported by the key-custody backend.", subject)
            }
            KmsError::NotFound { logical_id, .. } => {
                format!("No key is registered under '{}'. Generate it first.", logical_id)
            }
            KmsError::BackendFailure { operation, source, .. } => format!(
                "The key-custody service failed during '{}' ({}).",
                operation, source.kind
            ),
            KmsError::ConfigInvalid { field, .. } => {
                format!("Configuration field '{}' is missing or malformed.", field)
            }
            KmsError::ReconciliationPartialFailure { failed, .. } => format!(
                "{} existing backend keys could not be loaded and will be unavailable.",
                failed
            ),
            KmsError::InvalidArgument {
                parameter, expected, ..
            } => format!("Invalid parameter '{}'. Expected {}.", parameter, expected),
            KmsError::Canceled { operation, .. } => {
                format!("Operation '{}' was canceled before it completed.", operation)
            }
            KmsError::NotConfigured { .. } => {
                "The key manager must be configured before use.".to_string()
            }
        }
    }

    /// Get technical details for debugging
    pub fn technical_details(&self) -> HashMap<String, String> {
        let mut details = HashMap::new();

        details.insert("error_code".to_string(), self.error_code().to_string());
        details.insert("error_type".to_string(), self.error_type().to_string());
        details.insert("timestamp".to_string(), chrono::Utc::now().to_rfc3339());

        match self {
            KmsError::BackendFailure {
                operation, source, ..
            } => {
                details.insert("operation".to_string(), operation.clone());
                details.insert("backend_error_kind".to_string(), source.kind.to_string());
                details.insert("cause".to_string(), source.message.clone());
            }
            KmsError::Unsupported {
                subject, reason, ..
            } => {
                details.insert("subject".to_string(), subject.clone());
                details.insert("reason".to_string(), reason.clone());
            }
            KmsError::ConfigInvalid { field, reason, .. } => {
                details.insert("field".to_string(), field.clone());
                details.insert("reason".to_string(), reason.clone());
            }
            KmsError::InvalidArgument {
                parameter,
                expected,
                actual,
                ..
            } => {
                details.insert("parameter".to_string(), parameter.clone());
                details.insert("expected".to_string(), expected.clone());
                details.insert("actual".to_string(), actual.clone());
            }
            _ => {
                details.insert("details".to_string(), format!("{:?}", self));
            }
        }

        details
    }

    /// Whether repeating the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            KmsError::BackendFailure { source, .. } => source.kind.is_transient(),
            KmsError::Canceled { .. } => true,
            _ => false,
        }
    }
}

/// Convenience constructors for common error types
impl KmsError {
    pub fn unsupported(subject: &str, reason: &str, error_code: u32) -> Self {
        KmsError::Unsupported {
            subject: subject.to_string(),
            reason: reason.to_string(),
            error_code,
        }
    }

    pub fn not_found(logical_id: &str) -> Self {
        KmsError::NotFound {
            logical_id: logical_id.to_string(),
            error_code: error_codes::KEY_NOT_FOUND,
        }
    }

    pub fn backend(operation: &str, source: BackendError, error_code: u32) -> Self {
        KmsError::BackendFailure {
            operation: operation.to_string(),
            source,
            error_code,
        }
    }

    pub fn config_invalid(field: &str, reason: &str, error_code: u32) -> Self {
        KmsError::ConfigInvalid {
            field: field.to_string(),
            reason: reason.to_string(),
            error_code,
        }
    }

    pub fn invalid_argument(parameter: &str, expected: &str, actual: &str) -> Self {
        KmsError::InvalidArgument {
            parameter: parameter.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
            error_code: error_codes::INVALID_ARGUMENT,
        }
    }

    pub fn canceled(operation: &str) -> Self {
        KmsError::Canceled {
            operation: operation.to_string(),
            error_code: error_codes::OPERATION_CANCELED,
        }
    }

    pub fn not_configured() -> Self {
        KmsError::NotConfigured {
            error_code: error_codes::NOT_CONFIGURED,
        }
    }
}

impl From<serde_json::Error> for KmsError {
    fn from(err: serde_json::Error) -> Self {
        KmsError::config_invalid(
            "configuration",
            &format!("unable to decode configuration: {}", err),
            error_codes::CONFIG_DECODE_FAILED,
        )
    }
}

/// Result type alias for key manager operations
pub type KmsResult<T> = Result<T, KmsError>;

/// Failure categories a backend client adapter can report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    NotFound,
    AccessDenied,
    Throttled,
    Unavailable,
    InvalidRequest,
    Internal,
}

impl BackendErrorKind {
    /// Throttling and outages are worth retrying; the rest are not
    pub fn is_transient(self) -> bool {
        matches!(self, BackendErrorKind::Throttled | BackendErrorKind::Unavailable)
    }
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendErrorKind::NotFound => "not found",
            BackendErrorKind::AccessDenied => "access denied",
            BackendErrorKind::Throttled => "throttled",
            BackendErrorKind::Unavailable => "unavailable",
            BackendErrorKind::InvalidRequest => "invalid request",
            BackendErrorKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// Structured error returned by a backend client adapter
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        BackendError {
            kind,
            message: message.into(),
        }
    }
}
