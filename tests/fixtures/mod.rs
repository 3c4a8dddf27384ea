//! Shared helpers for integration tests.
//!
//! - in-memory stores sharing one bucket (to play "another writer")
//! - source trees with nested and empty directories
//! - tree snapshots for structural comparison

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use cask::{Artifact, ArtifactStore, CacheManager, MemoryBackend};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Store over `backend` with its own cache directory under `temp`.
pub fn store_over(temp: &TempDir, backend: &MemoryBackend, cache_name: &str) -> ArtifactStore {
    ArtifactStore::new(
        Box::new(backend.clone()),
        CacheManager::new(temp.path().join(cache_name)),
    )
}

/// Fresh bucket plus a store over it.
pub fn memory_store(temp: &TempDir) -> (ArtifactStore, MemoryBackend) {
    let backend = MemoryBackend::new("test-bucket");
    let store = store_over(temp, &backend, "cache");
    (store, backend)
}

/// Write `files` (relative path, content) under `root`; paths ending in
/// `/` become empty directories.
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    fs::create_dir_all(root).unwrap();
    for (rel, content) in files {
        let path = root.join(rel);
        if rel.ends_with('/') {
            fs::create_dir_all(&path).unwrap();
        } else {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
        }
    }
}

/// A small model-like source tree.
pub fn sample_tree(temp: &TempDir, name: &str, version: &str) -> PathBuf {
    let root = temp.path().join(name);
    write_tree(
        &root,
        &[
            ("config.json", &format!(r#"{{"version":"{}"}}"#, version)),
            ("weights/layer0.bin", "0123456789"),
            ("weights/layer1.bin", version),
            ("notes/", ""),
        ],
    );
    root
}

/// Relative path → file bytes (`None` for directories).
pub fn snapshot(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
    let mut out = BTreeMap::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.unwrap();
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap()
            .to_string_lossy()
            .replace('\\', "/");
        let content = if entry.file_type().is_dir() {
            None
        } else {
            Some(fs::read(entry.path()).unwrap())
        };
        out.insert(rel, content);
    }
    out
}

/// `size` bytes of incompressible, deterministic data.
pub fn write_noise(path: &Path, size: usize) {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut data = Vec::with_capacity(size);
    while data.len() < size {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        data.extend_from_slice(&state.to_le_bytes());
    }
    data.truncate(size);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, data).unwrap();
}

pub fn artifact(key: &str) -> Artifact {
    Artifact::new(key)
}
