//! Artifact store
//!
//! Ties one backend, the archiver and the local cache together. Per key:
//!
//! ```text
//! Absent --put--> RemoteOnly --get / put(cache)--> Cached --delete--> Absent
//! ```
//!
//! Remote mutation always happens before cache mutation, and a cache failure
//! never touches the remote object. Nothing is retried.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use cask_archive::Archiver;
use cask_backend::{Backend, Grantee, HttpMethod, Timestamp};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::cache::CacheManager;
use crate::error::{StoreError, StoreResult};
use crate::fsutil;

/// Default lifetime of signed URLs.
pub const DEFAULT_URL_TTL: Duration = Duration::from_secs(100_000);

/// Skew above which timestamp-based invalidation becomes unreliable.
pub const MAX_CLOCK_SKEW_MS: i64 = 1_000;

/// A keyed artifact, optionally bound to a local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub key: String,
    /// Used when an operation is given no explicit path
    pub local_path: Option<PathBuf>,
}

impl Artifact {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            local_path: None,
        }
    }

    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }
}

/// What a `put` did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PutOutcome {
    pub key: String,
    /// Timestamp the backend assigned to this upload
    pub remote_timestamp: Timestamp,
    /// Size of the uploaded blob
    pub blob_size: u64,
    /// Whether the upload was mirrored into the cache
    pub cached: bool,
}

/// Artifact store over one backend container.
pub struct ArtifactStore {
    backend: Box<dyn Backend>,
    cache: CacheManager,
    archiver: Archiver,
    url_ttl: Duration,
    clock_skew: Mutex<Option<chrono::Duration>>,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("scheme", &self.backend.scheme())
            .field("cache", &self.cache)
            .field("url_ttl", &self.url_ttl)
            .finish()
    }
}

impl ArtifactStore {
    pub fn new(backend: Box<dyn Backend>, cache: CacheManager) -> Self {
        Self {
            backend,
            cache,
            archiver: Archiver::new(),
            url_ttl: DEFAULT_URL_TTL,
            clock_skew: Mutex::new(None),
        }
    }

    pub fn with_url_ttl(mut self, ttl: Duration) -> Self {
        self.url_ttl = ttl;
        self
    }

    pub fn with_archiver(mut self, archiver: Archiver) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn url_ttl(&self) -> Duration {
        self.url_ttl
    }

    /// Skew from the last [`measure_clock_skew`](Self::measure_clock_skew).
    pub fn clock_skew(&self) -> Option<chrono::Duration> {
        self.clock_skew.lock().ok().and_then(|s| *s)
    }

    /// Pack `source` (or the artifact's local path) and upload it.
    ///
    /// With `cache`, the uploaded blob is also unpacked into the cache and
    /// recorded at the new remote timestamp. Without it, any existing entry
    /// is dropped.
    pub fn put(
        &self,
        artifact: &Artifact,
        source: Option<&Path>,
        cache: bool,
    ) -> StoreResult<PutOutcome> {
        let key = artifact.key.as_str();
        let source = resolve_path(key, source, artifact.local_path.as_deref(), "source")?;

        let blob = self
            .cache
            .temp_file("put")
            .map_err(|e| StoreError::cache(key, e))?;
        let result = self.upload_and_mirror(key, source, &blob, cache);
        self.cache.discard(&blob);
        result
    }

    fn upload_and_mirror(
        &self,
        key: &str,
        source: &Path,
        blob: &Path,
        cache: bool,
    ) -> StoreResult<PutOutcome> {
        let blob_size = self
            .archiver
            .pack_to_file(source, blob)
            .map_err(|e| StoreError::archive(key, source, e))?;

        // The entry is recorded at the upload's own timestamp, never at a
        // later query that may already see another writer's object.
        let remote_timestamp = self
            .backend
            .upload(key, blob)
            .map_err(|e| StoreError::backend(key, e))?;
        tracing::info!(key, bytes = blob_size, source = %source.display(), "uploaded artifact");

        if cache {
            self.install_blob(key, blob, remote_timestamp)?;
        } else {
            self.cache
                .invalidate(key)
                .map_err(|e| StoreError::cache(key, e))?;
        }

        Ok(PutOutcome {
            key: key.to_string(),
            remote_timestamp,
            blob_size,
            cached: cache,
        })
    }

    /// Unpack `blob` into staging and record it as the entry for `key`.
    fn install_blob(&self, key: &str, blob: &Path, timestamp: Timestamp) -> StoreResult<()> {
        let staged = self.cache.stage(key).map_err(|e| StoreError::cache(key, e))?;
        if let Err(e) = self.archiver.unpack_file(blob, &staged) {
            self.discard_staged(&staged);
            return Err(StoreError::unpack_into_cache(key, &staged, e));
        }
        if let Err(e) = self.cache.record(key, &staged, timestamp) {
            self.discard_staged(&staged);
            return Err(StoreError::cache(key, e));
        }
        Ok(())
    }

    fn discard_staged(&self, staged_content: &Path) {
        // Staged content lives in its own slot directory
        match staged_content.parent() {
            Some(slot) => self.cache.discard(slot),
            None => self.cache.discard(staged_content),
        }
    }

    /// Materialize the artifact.
    ///
    /// Returns the destination (`destination`, else the artifact's local
    /// path). With neither, the cache content path is returned instead of
    /// copying. The destination is only modified once the full content is
    /// available locally.
    pub fn get(&self, artifact: &Artifact, destination: Option<&Path>) -> StoreResult<PathBuf> {
        let key = artifact.key.as_str();
        let remote_timestamp = self
            .backend
            .timestamp(key)
            .map_err(|e| StoreError::backend(key, e))?;

        let Some(remote_timestamp) = remote_timestamp else {
            self.cache
                .invalidate(key)
                .map_err(|e| StoreError::cache(key, e))?;
            return Err(StoreError::ArtifactNotFound {
                key: key.to_string(),
            });
        };

        if self.cache.is_valid(key, Some(remote_timestamp)) {
            tracing::debug!(key, "cache hit");
        } else {
            tracing::debug!(key, remote = %remote_timestamp, "cache miss, downloading");
            self.download_into_cache(key, remote_timestamp)?;
        }

        let content = self.cache.cache_path_for(key);
        match destination.or(artifact.local_path.as_deref()) {
            Some(dest) => {
                materialize(key, &content, dest)?;
                Ok(dest.to_path_buf())
            }
            None => Ok(content),
        }
    }

    fn download_into_cache(&self, key: &str, timestamp: Timestamp) -> StoreResult<()> {
        let blob = self
            .cache
            .temp_file("get")
            .map_err(|e| StoreError::cache(key, e))?;

        let result = match self.backend.download(key, &blob) {
            Ok(()) => self.install_blob(key, &blob, timestamp),
            Err(e) => {
                let err = StoreError::backend(key, e);
                if matches!(err, StoreError::ArtifactNotFound { .. }) {
                    // Deleted between the timestamp query and the download
                    let _ = self.cache.invalidate(key);
                }
                Err(err)
            }
        };
        self.cache.discard(&blob);
        result
    }

    /// Remove the artifact remotely and locally. Absent keys succeed.
    pub fn delete(&self, artifact: &Artifact) -> StoreResult<()> {
        let key = artifact.key.as_str();
        self.backend
            .delete(key)
            .map_err(|e| StoreError::backend(key, e))?;
        self.cache
            .invalidate(key)
            .map_err(|e| StoreError::cache(key, e))?;
        tracing::info!(key, "deleted artifact");
        Ok(())
    }

    /// Signed URL for `method`, valid for the configured TTL.
    pub fn artifact_url(&self, artifact: &Artifact, method: HttpMethod) -> StoreResult<String> {
        self.artifact_url_with_ttl(artifact, method, self.url_ttl)
    }

    pub fn artifact_url_with_ttl(
        &self,
        artifact: &Artifact,
        method: HttpMethod,
        ttl: Duration,
    ) -> StoreResult<String> {
        let key = artifact.key.as_str();
        self.backend
            .signed_url(key, method, ttl)
            .map_err(|e| StoreError::backend(key, e))
    }

    pub fn qualified_location(&self, artifact: &Artifact) -> StoreResult<String> {
        let key = artifact.key.as_str();
        self.backend
            .qualified_location(key)
            .map_err(|e| StoreError::backend(key, e))
    }

    /// Grant owner access to `principal`, or to everyone when `None`.
    ///
    /// An absent key first gets an empty placeholder artifact so there is
    /// an object to grant on.
    pub fn grant_access(&self, artifact: &Artifact, principal: Option<&str>) -> StoreResult<()> {
        let key = artifact.key.as_str();
        let exists = self
            .backend
            .timestamp(key)
            .map_err(|e| StoreError::backend(key, e))?
            .is_some();
        if !exists {
            self.upload_placeholder(key)?;
        }

        let grantee = Grantee::from_principal(principal);
        self.backend
            .grant_access(key, &grantee)
            .map_err(|e| StoreError::backend(key, e))?;
        tracing::info!(key, grantee = %grantee, "granted access");
        Ok(())
    }

    fn upload_placeholder(&self, key: &str) -> StoreResult<()> {
        let empty = self.cache.stage(key).map_err(|e| StoreError::cache(key, e))?;
        let blob = self
            .cache
            .temp_file("placeholder")
            .map_err(|e| StoreError::cache(key, e));

        let result = blob.and_then(|blob| {
            let uploaded = self
                .archiver
                .pack_to_file(&empty, &blob)
                .map_err(|e| StoreError::archive(key, &empty, e))
                .and_then(|_| {
                    self.backend
                        .upload(key, &blob)
                        .map(|_| ())
                        .map_err(|e| StoreError::backend(key, e))
                });
            self.cache.discard(&blob);
            uploaded
        });
        self.discard_staged(&empty);

        if result.is_ok() {
            tracing::info!(key, "uploaded empty placeholder");
        }
        result
    }

    pub fn timestamp(&self, artifact: &Artifact) -> StoreResult<Option<Timestamp>> {
        let key = artifact.key.as_str();
        self.backend
            .timestamp(key)
            .map_err(|e| StoreError::backend(key, e))
    }

    /// Name of the backend container, creating it if needed.
    pub fn container(&self) -> StoreResult<String> {
        self.backend
            .container()
            .map_err(|e| StoreError::backend("", e))
    }

    /// Upload a probe object and compare its remote timestamp to the local
    /// clock. Positive skew means the local clock is ahead.
    pub fn measure_clock_skew(&self) -> StoreResult<chrono::Duration> {
        let key = format!(".cask-probe/{}", Uuid::new_v4());
        let probe = self
            .cache
            .temp_file("probe")
            .map_err(|e| StoreError::cache(&key, e))?;

        let result = fs::write(&probe, b"probe")
            .map_err(|e| StoreError::io(&key, &probe, e))
            .and_then(|_| {
                self.backend
                    .upload(&key, &probe)
                    .map_err(|e| StoreError::backend(&key, e))
            })
            .map(|remote| {
                let now = Utc::now();
                if let Err(e) = self.backend.delete(&key) {
                    tracing::warn!(key = %key, error = %e, "failed to delete clock probe");
                }
                now - remote
            });
        self.cache.discard(&probe);

        let skew = result?;
        if skew.num_milliseconds().abs() > MAX_CLOCK_SKEW_MS {
            tracing::warn!(
                skew_ms = skew.num_milliseconds(),
                "local and backend clocks differ; cache validity checks may be wrong"
            );
        } else {
            tracing::debug!(skew_ms = skew.num_milliseconds(), "measured clock skew");
        }
        if let Ok(mut slot) = self.clock_skew.lock() {
            *slot = Some(skew);
        }
        Ok(skew)
    }
}

fn resolve_path<'a>(
    key: &str,
    explicit: Option<&'a Path>,
    fallback: Option<&'a Path>,
    what: &str,
) -> StoreResult<&'a Path> {
    explicit.or(fallback).ok_or_else(|| StoreError::Io {
        key: key.to_string(),
        path: PathBuf::new(),
        source: io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no {} path given and artifact has no local path", what),
        ),
    })
}

/// Copy cached `content` into `dest`.
///
/// The copy is built in a sibling directory first. A missing `dest` is then
/// created by renaming that directory into place in one step. An existing
/// `dest` instead receives the copy's top-level entries one rename at a
/// time, replacing same-named entries and leaving the others alone; a
/// failure partway through that merge leaves the entries already moved.
fn materialize(key: &str, content: &Path, dest: &Path) -> StoreResult<()> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    let staging = parent.join(format!(".{}.cask-{}", name, Uuid::new_v4()));

    let result = copy_then_commit(content, &staging, dest)
        .map_err(|(path, e)| StoreError::io(key, &path, e));
    if let Err(e) = fsutil::remove_path(&staging) {
        tracing::warn!(path = %staging.display(), error = %e, "failed to remove destination staging");
    }
    result
}

fn copy_then_commit(content: &Path, staging: &Path, dest: &Path) -> Result<(), (PathBuf, io::Error)> {
    fsutil::copy_tree(content, staging).map_err(|e| (staging.to_path_buf(), e))?;

    match fs::symlink_metadata(dest) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return fs::rename(staging, dest).map_err(|e| (dest.to_path_buf(), e));
        }
        Err(e) => return Err((dest.to_path_buf(), e)),
        Ok(meta) if !meta.is_dir() => {
            return Err((
                dest.to_path_buf(),
                io::Error::new(io::ErrorKind::AlreadyExists, "destination is not a directory"),
            ));
        }
        Ok(_) => {}
    }

    let entries = fs::read_dir(staging).map_err(|e| (staging.to_path_buf(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| (staging.to_path_buf(), e))?;
        let target = dest.join(entry.file_name());
        fsutil::remove_path(&target).map_err(|e| (target.clone(), e))?;
        fs::rename(entry.path(), &target).map_err(|e| (target.clone(), e))?;
    }
    Ok(())
}
