//! Error types for the cloud sync crate.

use thiserror::Error;
use workspace_sync_core::sync::{classify_http_status, SyncRetryClass};
use workspace_sync_core::StorageError;

/// Result type alias for cloud sync operations.
pub type Result<T> = std::result::Result<T, CloudSyncError>;

/// Errors that can occur while talking to the sync backend.
#[derive(Debug, Error)]
pub enum CloudSyncError {
    /// Backend URL/key or owner id missing; sync is disabled, not broken
    #[error("Sync is not configured: {0}")]
    NotConfigured(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API error response from the backend
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Invalid request (missing required data, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication error (missing or invalid key)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Failure reported by a non-HTTP backend (in-process store, socket)
    #[error("Backend error: {0}")]
    Backend(String),

    /// Remote row did not match the schema of its data type
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Change-feed channel gave up after exhausting reconnect attempts
    #[error("Channel {channel} exhausted after {attempts} reconnect attempts")]
    ChannelExhausted { channel: String, attempts: u32 },

    /// Device-local storage failure
    #[error("Local storage error: {0}")]
    Storage(#[from] StorageError),
}

impl CloudSyncError {
    /// Create an API error from status and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::NotConfigured(message.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create an auth error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_configured(&self) -> bool {
        matches!(self, Self::NotConfigured(_))
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> SyncRetryClass {
        match self {
            Self::Api { status, .. } => classify_http_status(*status),
            Self::Http(_) | Self::Backend(_) => SyncRetryClass::Retryable,
            Self::Auth(_) => SyncRetryClass::ReauthRequired,
            Self::NotConfigured(_)
            | Self::Json(_)
            | Self::InvalidRequest(_)
            | Self::MalformedPayload(_)
            | Self::ChannelExhausted { .. }
            | Self::Storage(_) => SyncRetryClass::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_class_for_auth_error_is_reauth() {
        let err = CloudSyncError::api(401, "unauthorized");
        assert_eq!(err.retry_class(), SyncRetryClass::ReauthRequired);
        assert_eq!(err.status_code(), Some(401));
    }

    #[test]
    fn transient_backend_errors_are_retryable() {
        assert_eq!(
            CloudSyncError::api(503, "unavailable").retry_class(),
            SyncRetryClass::Retryable
        );
        assert_eq!(
            CloudSyncError::backend("connection reset").retry_class(),
            SyncRetryClass::Retryable
        );
    }

    #[test]
    fn configuration_absent_is_permanent() {
        let err = CloudSyncError::not_configured("no backend url");
        assert!(err.is_not_configured());
        assert_eq!(err.retry_class(), SyncRetryClass::Permanent);
    }
}
