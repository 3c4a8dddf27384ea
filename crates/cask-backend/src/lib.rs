//! Cask backend contract
//!
//! A backend is one remote object store (a bucket or equivalent). It exposes
//! the primitive operations the artifact store builds on:
//! - `upload` / `download` / `delete` of a whole object by key
//! - `timestamp` (last-modified time, or `None` when absent)
//! - `signed_url` for time-bounded access without credentials
//! - `grant_access` to a user or to everyone
//! - `qualified_location`, the canonical `scheme://container/key` form
//!
//! Backends never retry. A transient failure is reported as
//! [`BackendError::Unavailable`] and left to the caller.
//!
//! Two adapters live in this crate:
//! - [`FsBackend`]: a bucket rooted in a local directory (`file://`)
//! - [`MemoryBackend`]: an in-process bucket with call instrumentation,
//!   simulated transfer latency and fault injection (`mem://`)

mod error;
mod fs;
mod memory;
pub mod signing;

pub use error::{BackendError, BackendResult};
pub use fs::FsBackend;
pub use memory::{CallCounts, MemoryBackend};
pub use signing::{SignedUrl, SigningError, UrlSigner};

use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last-modified time reported by a backend.
pub type Timestamp = DateTime<Utc>;

/// HTTP method a signed URL is valid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Put,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            other => Err(format!("unsupported HTTP method: {}", other)),
        }
    }
}

/// Who an access grant applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Grantee {
    /// A single principal (user or service account identifier)
    User(String),
    /// Everyone, authenticated or not
    Public,
}

impl Grantee {
    /// `None` means everyone.
    pub fn from_principal(principal: Option<&str>) -> Self {
        match principal {
            Some(p) if !p.is_empty() => Self::User(p.to_string()),
            _ => Self::Public,
        }
    }
}

impl fmt::Display for Grantee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{}", id),
            Self::Public => f.write_str("public"),
        }
    }
}

/// One remote object store.
///
/// Implementations must be usable from several threads; each call is a
/// blocking operation that either completes or fails with a [`BackendError`].
pub trait Backend: Send + Sync {
    /// URI scheme used in qualified locations (e.g. `gs`, `s3`, `file`).
    fn scheme(&self) -> &str;

    /// Name of the container, creating it on first use if it does not exist.
    fn container(&self) -> BackendResult<String>;

    /// Store the file at `local_path` under `key`, replacing any previous object.
    ///
    /// Returns the last-modified time the backend assigned to this upload.
    /// It must describe the uploaded object even when another writer replaces
    /// it before the call returns.
    fn upload(&self, key: &str, local_path: &Path) -> BackendResult<Timestamp>;

    /// Write the object stored under `key` to `local_path`.
    fn download(&self, key: &str, local_path: &Path) -> BackendResult<()>;

    /// Remove the object. Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> BackendResult<()>;

    /// Last-modified time of the object, `None` if it does not exist.
    fn timestamp(&self, key: &str) -> BackendResult<Option<Timestamp>>;

    /// URL granting `method` on the object until `ttl` elapses.
    fn signed_url(&self, key: &str, method: HttpMethod, ttl: Duration) -> BackendResult<String>;

    /// Give `grantee` owner access to an existing object.
    fn grant_access(&self, key: &str, grantee: &Grantee) -> BackendResult<()>;

    /// Canonical URI of the object.
    fn qualified_location(&self, key: &str) -> BackendResult<String> {
        Ok(format!("{}://{}/{}", self.scheme(), self.container()?, key))
    }
}

/// Reject keys that cannot name an object: empty, absolute or climbing
/// out with `..`.
pub fn validate_key(key: &str) -> BackendResult<()> {
    if key.is_empty() {
        return Err(BackendError::InvalidKey {
            key: key.to_string(),
            reason: "key is empty".to_string(),
        });
    }
    let path = Path::new(key);
    if !path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(BackendError::InvalidKey {
            key: key.to_string(),
            reason: "key must be a relative path without '..'".to_string(),
        });
    }
    Ok(())
}
