//! Error types for device-local storage.

use thiserror::Error;

/// Result type alias for local storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors raised by [`crate::local_store::LocalStore`] implementations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem error while reading or writing the backing file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file exists but is not a JSON object of strings
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A lock guarding the store was poisoned by a panicking writer
    #[error("Local store lock poisoned")]
    Poisoned,
}
