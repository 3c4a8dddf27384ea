//! Artifact store errors.

use std::io;
use std::path::{Path, PathBuf};

use cask_archive::ArchiveError;
use cask_backend::BackendError;
use thiserror::Error;

use crate::cache::CacheError;
use crate::config::ConfigError;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by [`ArtifactStore`](crate::ArtifactStore).
///
/// Every variant raised by an operation on an artifact names its key.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The remote object does not exist.
    #[error("artifact not found: {key}")]
    ArtifactNotFound { key: String },

    /// The backend could not be reached or rejected the call. Not retried.
    #[error("backend unavailable for {key}: {message}")]
    BackendUnavailable { key: String, message: String },

    /// The key cannot name an object. Retrying will not help.
    #[error("invalid artifact key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// The backend refused the request (credentials, signed URL).
    #[error("access denied for {key}: {message}")]
    AccessDenied { key: String, message: String },

    /// The stored blob is not a valid archive.
    #[error("corrupt archive for {key}: {message}")]
    CorruptArchive { key: String, message: String },

    /// The local cache directory could not be read or written.
    #[error("cache error for {key}: {source}")]
    CacheIo {
        key: String,
        #[source]
        source: CacheError,
    },

    /// Local I/O outside the cache (source tree, destination).
    #[error("I/O error for {key} at {}: {source}", .path.display())]
    Io {
        key: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl StoreError {
    /// The artifact key this error concerns, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::ArtifactNotFound { key }
            | Self::BackendUnavailable { key, .. }
            | Self::InvalidKey { key, .. }
            | Self::AccessDenied { key, .. }
            | Self::CorruptArchive { key, .. }
            | Self::CacheIo { key, .. }
            | Self::Io { key, .. } => Some(key),
            Self::Config(_) => None,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }

    pub(crate) fn backend(key: &str, err: BackendError) -> Self {
        match err {
            BackendError::ObjectNotFound { .. } => Self::ArtifactNotFound {
                key: key.to_string(),
            },
            BackendError::InvalidKey { reason, .. } => Self::InvalidKey {
                key: key.to_string(),
                reason,
            },
            BackendError::AccessDenied(message) => Self::AccessDenied {
                key: key.to_string(),
                message,
            },
            BackendError::Unavailable { message } => Self::BackendUnavailable {
                key: key.to_string(),
                message,
            },
        }
    }

    pub(crate) fn cache(key: &str, source: CacheError) -> Self {
        Self::CacheIo {
            key: key.to_string(),
            source,
        }
    }

    pub(crate) fn io(key: &str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            key: key.to_string(),
            path: path.to_path_buf(),
            source,
        }
    }

    /// Unpack failures while filling a cache staging directory. Damage is
    /// the blob's fault; anything else is the cache directory's.
    pub(crate) fn unpack_into_cache(key: &str, staged: &Path, err: ArchiveError) -> Self {
        match err {
            ArchiveError::Io(source) => Self::cache(key, CacheError::io(staged, source)),
            other if other.is_corrupt() => Self::CorruptArchive {
                key: key.to_string(),
                message: other.to_string(),
            },
            other => Self::cache(
                key,
                CacheError::io(staged, io::Error::new(io::ErrorKind::Other, other.to_string())),
            ),
        }
    }

    /// Archive failures. `path` is the local side of the operation: the
    /// source tree when packing, the target directory when unpacking.
    pub(crate) fn archive(key: &str, path: &Path, err: ArchiveError) -> Self {
        match err {
            ArchiveError::Io(source) => Self::io(key, path, source),
            ArchiveError::SourceMissing(missing) => Self::io(
                key,
                &missing,
                io::Error::new(io::ErrorKind::NotFound, "source path does not exist"),
            ),
            other if other.is_corrupt() => Self::CorruptArchive {
                key: key.to_string(),
                message: other.to_string(),
            },
            other => Self::io(key, path, io::Error::new(io::ErrorKind::Other, other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_not_found_maps_to_artifact_not_found() {
        let err = StoreError::backend(
            "k",
            BackendError::ObjectNotFound {
                key: "k".to_string(),
            },
        );
        assert!(matches!(err, StoreError::ArtifactNotFound { ref key } if key == "k"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_backend_unavailable_keeps_key() {
        let err = StoreError::backend("models/a", BackendError::unavailable("timed out"));
        assert_eq!(err.key(), Some("models/a"));
        assert!(err.is_transient());
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_invalid_key_is_terminal() {
        let err = StoreError::backend(
            "../escape",
            BackendError::InvalidKey {
                key: "../escape".to_string(),
                reason: "key must be a relative path without '..'".to_string(),
            },
        );
        assert!(matches!(err, StoreError::InvalidKey { ref key, .. } if key == "../escape"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_access_denied_is_terminal() {
        let err = StoreError::backend("k", BackendError::AccessDenied("bad signature".to_string()));
        assert!(matches!(err, StoreError::AccessDenied { .. }));
        assert_eq!(err.key(), Some("k"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_unpack_io_failure_is_cache_error() {
        let err = StoreError::unpack_into_cache(
            "k",
            Path::new("/cache/.staging/x/content"),
            ArchiveError::Io(io::Error::new(io::ErrorKind::Other, "no space left on device")),
        );
        match err {
            StoreError::CacheIo {
                key,
                source: CacheError::Io { path, .. },
            } => {
                assert_eq!(key, "k");
                assert_eq!(path, PathBuf::from("/cache/.staging/x/content"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let err = StoreError::unpack_into_cache(
            "k",
            Path::new("/cache/.staging/x/content"),
            ArchiveError::Corrupt("bad gzip header".to_string()),
        );
        assert!(matches!(err, StoreError::CorruptArchive { .. }));
    }

    #[test]
    fn test_archive_corrupt_mapping() {
        let err = StoreError::archive(
            "k",
            Path::new("/dest"),
            ArchiveError::Corrupt("bad gzip header".to_string()),
        );
        assert!(matches!(err, StoreError::CorruptArchive { .. }));
    }

    #[test]
    fn test_archive_source_missing_mapping() {
        let err = StoreError::archive(
            "k",
            Path::new("/src"),
            ArchiveError::SourceMissing(PathBuf::from("/src/missing")),
        );
        match err {
            StoreError::Io { path, source, .. } => {
                assert_eq!(path, PathBuf::from("/src/missing"));
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
