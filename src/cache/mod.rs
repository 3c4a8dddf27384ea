//! Local artifact cache
//!
//! Mirrors remote artifacts as unpacked directories so repeated reads skip
//! the download. Layout under the cache root:
//!
//! ```text
//! <root>/entries/<sanitized-key>-<sha256[0:8]>/content/   unpacked artifact
//! <root>/entries/<sanitized-key>-<sha256[0:8]>/entry.json sidecar
//! <root>/.staging/<uuid>/                                 entries being built
//! <root>/.tmp/<prefix>-<uuid>                             blobs in transit
//! ```
//!
//! An entry is valid only while the remote timestamp it was recorded with is
//! not older than the remote object's current timestamp. Entries are
//! installed by renaming a fully built staging directory, so content is never
//! visible without its sidecar.

mod entry;

pub use entry::{CacheEntry, CacheStats};

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use cask_backend::Timestamp;
use regex_lite::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::fsutil;

/// Cache result type
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors from cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl CacheError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

const ENTRIES_DIR: &str = "entries";
const STAGING_DIR: &str = ".staging";
const TEMP_DIR: &str = ".tmp";
pub(crate) const CONTENT_DIR: &str = "content";

/// Directory name for a key: readable prefix plus a digest suffix so keys
/// that sanitize to the same prefix stay disjoint.
fn entry_dir_name(key: &str) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let unsafe_chars = UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]").expect("valid regex"));

    let mut sanitized = unsafe_chars.replace_all(key, "_").into_owned();
    sanitized.truncate(64);

    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!("{}-{}", sanitized, &digest[..8])
}

/// Manages the cache directory.
#[derive(Debug, Clone)]
pub struct CacheManager {
    root: PathBuf,
}

impl CacheManager {
    /// Cache rooted at `root`. Nothing is created until the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.root.join(ENTRIES_DIR).join(entry_dir_name(key))
    }

    /// Where the unpacked content for `key` lives. Deterministic; the
    /// directory may not exist.
    pub fn cache_path_for(&self, key: &str) -> PathBuf {
        self.entry_dir(key).join(CONTENT_DIR)
    }

    /// The recorded entry for `key`, if any.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        let entry = CacheEntry::read(&self.entry_dir(key))?;
        if entry.key != key {
            tracing::warn!(key, recorded = %entry.key, "cache entry belongs to another key");
            return None;
        }
        entry.content_path.is_dir().then_some(entry)
    }

    /// True only if an entry exists, the remote object exists and the
    /// entry is not older than it.
    pub fn is_valid(&self, key: &str, remote_timestamp: Option<Timestamp>) -> bool {
        match self.entry(key) {
            Some(entry) => entry.is_current(remote_timestamp),
            None => false,
        }
    }

    /// A fresh, empty directory to unpack content into before [`record`].
    ///
    /// [`record`]: Self::record
    pub fn stage(&self, key: &str) -> CacheResult<PathBuf> {
        let slot = self.root.join(STAGING_DIR).join(Uuid::new_v4().to_string());
        let content = slot.join(CONTENT_DIR);
        fs::create_dir_all(&content).map_err(|e| CacheError::io(&content, e))?;
        tracing::debug!(key, path = %content.display(), "staging cache content");
        Ok(content)
    }

    /// Install `staged_content` as the entry for `key`, taken at `timestamp`.
    ///
    /// The staged directory is consumed. Any previous entry is replaced.
    pub fn record(
        &self,
        key: &str,
        staged_content: &Path,
        timestamp: Timestamp,
    ) -> CacheResult<CacheEntry> {
        let slot = self.staging_slot_for(staged_content)?;

        let mut entry = CacheEntry::new(key, timestamp);
        if let Err(e) = entry.write(&slot) {
            self.discard(&slot);
            return Err(e);
        }

        let entry_dir = self.entry_dir(key);
        let entries_root = self.root.join(ENTRIES_DIR);
        let install = fs::create_dir_all(&entries_root)
            .and_then(|_| fsutil::remove_path(&entry_dir))
            .and_then(|_| fs::rename(&slot, &entry_dir));
        if let Err(e) = install {
            self.discard(&slot);
            return Err(CacheError::io(&entry_dir, e));
        }

        entry.content_path = entry_dir.join(CONTENT_DIR);
        tracing::debug!(key, timestamp = %timestamp, "recorded cache entry");
        Ok(entry)
    }

    /// Staging slot holding `staged_content` as its `content/` directory.
    ///
    /// Content from [`stage`](Self::stage) already sits in one; anything else
    /// is moved (or copied, across filesystems) into a new slot.
    fn staging_slot_for(&self, staged_content: &Path) -> CacheResult<PathBuf> {
        let staging_root = self.root.join(STAGING_DIR);
        if let Some(slot) = staged_content.parent() {
            if slot.parent() == Some(staging_root.as_path())
                && staged_content.file_name() == Some(OsStr::new(CONTENT_DIR))
            {
                return Ok(slot.to_path_buf());
            }
        }

        let slot = staging_root.join(Uuid::new_v4().to_string());
        let content = slot.join(CONTENT_DIR);
        fs::create_dir_all(&slot).map_err(|e| CacheError::io(&slot, e))?;
        if fs::rename(staged_content, &content).is_err() {
            if let Err(e) = fsutil::copy_tree(staged_content, &content) {
                self.discard(&slot);
                return Err(CacheError::io(staged_content, e));
            }
        }
        Ok(slot)
    }

    /// Drop the entry for `key`. Absent entries are a no-op.
    pub fn invalidate(&self, key: &str) -> CacheResult<()> {
        let entry_dir = self.entry_dir(key);
        if entry_dir.exists() {
            tracing::debug!(key, "invalidating cache entry");
        }
        fsutil::remove_path(&entry_dir).map_err(|e| CacheError::io(&entry_dir, e))
    }

    /// Path for a blob in transit. The file is not created.
    pub fn temp_file(&self, prefix: &str) -> CacheResult<PathBuf> {
        let dir = self.root.join(TEMP_DIR);
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        Ok(dir.join(format!("{}-{}", prefix, Uuid::new_v4())))
    }

    /// Remove a staging or temp path, logging instead of failing.
    pub fn discard(&self, path: &Path) {
        if let Err(e) = fsutil::remove_path(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to clean up cache scratch path");
        }
    }

    /// Every readable entry, ordered by key.
    pub fn list(&self) -> CacheResult<Vec<CacheEntry>> {
        let entries_root = self.root.join(ENTRIES_DIR);
        let read_dir = match fs::read_dir(&entries_root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::io(&entries_root, e)),
        };

        let mut entries = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(|e| CacheError::io(&entries_root, e))?;
            if let Some(entry) = CacheEntry::read(&dir_entry.path()) {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    pub fn stats(&self) -> CacheResult<CacheStats> {
        let entries = self.list()?;
        let mut total_size_bytes = 0;
        for entry in &entries {
            total_size_bytes += fsutil::dir_size(&entry.content_path)
                .map_err(|e| CacheError::io(&entry.content_path, e))?;
        }
        Ok(CacheStats {
            count: entries.len(),
            total_size_bytes,
        })
    }

    /// Remove every entry and any leftover scratch files. Returns the number
    /// of entries removed.
    pub fn clear(&self) -> CacheResult<usize> {
        let entries = self.list()?;
        for dir in [ENTRIES_DIR, STAGING_DIR, TEMP_DIR] {
            let path = self.root.join(dir);
            fsutil::remove_path(&path).map_err(|e| CacheError::io(&path, e))?;
        }
        tracing::info!(count = entries.len(), root = %self.root.display(), "cleared cache");
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn staged_with(cache: &CacheManager, key: &str, file: &str, content: &str) -> PathBuf {
        let staged = cache.stage(key).unwrap();
        fs::write(staged.join(file), content).unwrap();
        staged
    }

    #[test]
    fn test_root_created_lazily() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cache");
        let cache = CacheManager::new(&root);

        let _ = cache.cache_path_for("a");
        assert!(!cache.is_valid("a", Some(Utc::now())));
        assert!(!root.exists());
    }

    #[test]
    fn test_cache_path_deterministic_and_disjoint() {
        let cache = CacheManager::new("/cache");
        assert_eq!(cache.cache_path_for("a/b"), cache.cache_path_for("a/b"));
        // Both sanitize to "a_b"
        assert_ne!(cache.cache_path_for("a/b"), cache.cache_path_for("a:b"));

        let path = cache.cache_path_for("models/v1.tgz");
        let name = path.parent().unwrap().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("models_v1.tgz-"));
        assert_eq!(name.len(), "models_v1.tgz-".len() + 8);
    }

    #[test]
    fn test_record_then_valid() {
        let temp = TempDir::new().unwrap();
        let cache = CacheManager::new(temp.path());
        let ts = Utc::now();

        let staged = staged_with(&cache, "k", "f.txt", "v1");
        let entry = cache.record("k", &staged, ts).unwrap();

        assert_eq!(entry.content_path, cache.cache_path_for("k"));
        assert_eq!(fs::read_to_string(cache.cache_path_for("k").join("f.txt")).unwrap(), "v1");
        assert!(cache.is_valid("k", Some(ts)));
        assert!(!staged.exists());
    }

    #[test]
    fn test_newer_remote_is_stale() {
        let temp = TempDir::new().unwrap();
        let cache = CacheManager::new(temp.path());
        let ts = Utc::now();

        let staged = staged_with(&cache, "k", "f.txt", "v1");
        cache.record("k", &staged, ts).unwrap();

        assert!(!cache.is_valid("k", Some(ts + Duration::microseconds(1))));
        assert!(!cache.is_valid("k", None));
        assert!(cache.is_valid("k", Some(ts - Duration::seconds(5))));
    }

    #[test]
    fn test_record_replaces_previous_content() {
        let temp = TempDir::new().unwrap();
        let cache = CacheManager::new(temp.path());

        let first = staged_with(&cache, "k", "old.txt", "v1");
        cache.record("k", &first, Utc::now()).unwrap();
        let second = staged_with(&cache, "k", "new.txt", "v2");
        cache.record("k", &second, Utc::now()).unwrap();

        let content = cache.cache_path_for("k");
        assert!(!content.join("old.txt").exists());
        assert_eq!(fs::read_to_string(content.join("new.txt")).unwrap(), "v2");
    }

    #[test]
    fn test_record_external_directory() {
        let temp = TempDir::new().unwrap();
        let cache = CacheManager::new(temp.path().join("cache"));
        let external = temp.path().join("external");
        fs::create_dir_all(&external).unwrap();
        fs::write(external.join("f.txt"), "ext").unwrap();

        cache.record("k", &external, Utc::now()).unwrap();
        assert_eq!(fs::read_to_string(cache.cache_path_for("k").join("f.txt")).unwrap(), "ext");
    }

    #[test]
    fn test_invalidate() {
        let temp = TempDir::new().unwrap();
        let cache = CacheManager::new(temp.path());
        let ts = Utc::now();

        let staged = staged_with(&cache, "k", "f.txt", "v1");
        cache.record("k", &staged, ts).unwrap();
        cache.invalidate("k").unwrap();

        assert!(!cache.is_valid("k", Some(ts)));
        assert!(!cache.cache_path_for("k").exists());
        // Idempotent
        cache.invalidate("k").unwrap();
        cache.invalidate("never-cached").unwrap();
    }

    #[test]
    fn test_content_without_sidecar_is_invalid() {
        let temp = TempDir::new().unwrap();
        let cache = CacheManager::new(temp.path());
        fs::create_dir_all(cache.cache_path_for("k")).unwrap();

        assert!(cache.entry("k").is_none());
        assert!(!cache.is_valid("k", Some(Utc::now())));
    }

    #[test]
    fn test_list_stats_clear() {
        let temp = TempDir::new().unwrap();
        let cache = CacheManager::new(temp.path());

        let b = staged_with(&cache, "b", "f", "12345");
        cache.record("b", &b, Utc::now()).unwrap();
        let a = staged_with(&cache, "a", "f", "123");
        cache.record("a", &a, Utc::now()).unwrap();

        let keys: Vec<_> = cache.list().unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["a", "b"]);

        let stats = cache.stats().unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_size_bytes, 8);

        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.list().unwrap().is_empty());
        assert_eq!(cache.stats().unwrap(), CacheStats::default());
    }

    #[test]
    fn test_temp_file_unique() {
        let temp = TempDir::new().unwrap();
        let cache = CacheManager::new(temp.path());

        let a = cache.temp_file("blob").unwrap();
        let b = cache.temp_file("blob").unwrap();
        assert_ne!(a, b);
        assert!(a.parent().unwrap().is_dir());
        assert!(!a.exists());
    }
}
