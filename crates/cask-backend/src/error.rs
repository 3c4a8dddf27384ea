//! Backend error type.

use std::io;

use thiserror::Error;

/// Errors reported by a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Transient failure (network, timeout, remote outage). Safe to retry.
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },

    /// The object does not exist.
    #[error("object not found: {key}")]
    ObjectNotFound { key: String },

    /// The key cannot name an object in this backend.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// A signed URL or credential was rejected.
    #[error("access denied: {0}")]
    AccessDenied(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

impl BackendError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Map an I/O error touching `key`: a missing file is a missing object,
    /// everything else is treated as transient.
    pub fn from_io(key: &str, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::ObjectNotFound {
                key: key.to_string(),
            }
        } else {
            Self::Unavailable {
                message: format!("{}: {}", key, err),
            }
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
