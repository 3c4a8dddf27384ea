//! Built-in defaults (layer 1)

use serde::{Deserialize, Serialize};

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Cache root (default: "~/.cache/cask")
    pub cache_dir: String,

    /// Lifetime of signed URLs in seconds (default: 100000)
    pub url_ttl_seconds: u64,

    /// Probe backend clock skew when a store is built (default: false)
    pub measure_timestamp_diff: bool,

    /// Gzip level of packed blobs, 0-9 (default: 6)
    pub compression_level: u32,

    /// Backend kind (default: "fs")
    pub backend_kind: String,

    /// Container name (default: "cask-artifacts")
    pub container: String,

    /// Root directory of filesystem buckets (default: "~/.local/share/cask/buckets")
    pub fs_root: String,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            cache_dir: "~/.cache/cask".to_string(),
            url_ttl_seconds: 100_000,
            measure_timestamp_diff: false,
            compression_level: 6,
            backend_kind: "fs".to_string(),
            container: "cask-artifacts".to_string(),
            fs_root: "~/.local/share/cask/buckets".to_string(),
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "store": {
                "cache_dir": self.cache_dir,
                "url_ttl_seconds": self.url_ttl_seconds,
                "measure_timestamp_diff": self.measure_timestamp_diff,
                "compression_level": self.compression_level
            },
            "backend": {
                "kind": self.backend_kind,
                "container": self.container,
                "root": self.fs_root
            }
        })
    }
}
