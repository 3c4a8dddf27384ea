//! Cache entry sidecar.

use std::fs;
use std::path::{Path, PathBuf};

use cask_backend::Timestamp;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{CacheError, CacheResult};

/// A cached, unpacked artifact and the remote timestamp it was taken at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Artifact key this entry mirrors
    pub key: String,
    /// Remote timestamp observed when the content was recorded
    pub remote_timestamp: Timestamp,
    /// Local time the entry was recorded
    pub recorded_at: Timestamp,
    /// Unpacked content directory (not persisted; derived from the layout)
    #[serde(skip)]
    pub content_path: PathBuf,
}

impl CacheEntry {
    /// Sidecar file name inside an entry directory.
    pub const METADATA_FILENAME: &'static str = "entry.json";

    pub(crate) fn new(key: &str, remote_timestamp: Timestamp) -> Self {
        Self {
            key: key.to_string(),
            remote_timestamp,
            recorded_at: Utc::now(),
            content_path: PathBuf::new(),
        }
    }

    /// Whether content taken at `remote_timestamp` is still current.
    ///
    /// An absent remote object is never current.
    pub fn is_current(&self, remote_timestamp: Option<Timestamp>) -> bool {
        match remote_timestamp {
            Some(remote) => self.remote_timestamp >= remote,
            None => false,
        }
    }

    /// Read the sidecar in `entry_dir`. `None` when missing or unreadable.
    pub(crate) fn read(entry_dir: &Path) -> Option<Self> {
        let meta_path = entry_dir.join(Self::METADATA_FILENAME);
        let contents = fs::read_to_string(&meta_path).ok()?;
        match serde_json::from_str::<Self>(&contents) {
            Ok(mut entry) => {
                entry.content_path = entry_dir.join(super::CONTENT_DIR);
                Some(entry)
            }
            Err(e) => {
                tracing::warn!(path = %meta_path.display(), error = %e, "ignoring malformed cache metadata");
                None
            }
        }
    }

    pub(crate) fn write(&self, entry_dir: &Path) -> CacheResult<()> {
        let meta_path = entry_dir.join(Self::METADATA_FILENAME);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&meta_path, json).map_err(|e| CacheError::io(&meta_path, e))
    }
}

/// Totals over every cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of entries
    pub count: usize,
    /// Total size of unpacked content in bytes
    pub total_size_bytes: u64,
}
