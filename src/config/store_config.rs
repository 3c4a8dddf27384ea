//! Typed view over the effective configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::effective::{ConfigError, EffectiveConfig};

/// Which adapter backs the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Bucket directory on the local filesystem
    Fs,
    /// In-process bucket, lost at exit
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fs => "fs",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fs" | "file" => Ok(Self::Fs),
            "memory" | "mem" => Ok(Self::Memory),
            _ => Err(ConfigError::UnknownBackend(s.to_string())),
        }
    }
}

/// `[backend]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub container: String,
    /// Parent directory of filesystem buckets
    pub root: PathBuf,
    /// Signing key file; a per-process key is generated when unset
    pub credentials: Option<PathBuf>,
}

/// Everything needed to build an [`ArtifactStore`](crate::ArtifactStore).
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub cache_dir: PathBuf,
    pub url_ttl: Duration,
    pub measure_timestamp_diff: bool,
    /// Gzip level for packed blobs
    pub compression_level: u32,
    pub backend: BackendConfig,
}

#[derive(Deserialize)]
struct RawConfig {
    store: RawStore,
    backend: RawBackend,
}

#[derive(Deserialize)]
struct RawStore {
    cache_dir: String,
    url_ttl_seconds: u64,
    measure_timestamp_diff: bool,
    compression_level: u32,
}

#[derive(Deserialize)]
struct RawBackend {
    kind: String,
    container: String,
    root: String,
    #[serde(default)]
    credentials: Option<String>,
}

impl StoreConfig {
    /// Read the typed view out of a validated effective config.
    pub fn from_effective(effective: &EffectiveConfig) -> Result<Self, ConfigError> {
        Self::from_value(effective.resolved().clone())
    }

    fn from_value(value: Value) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(Self {
            cache_dir: expand_home(&raw.store.cache_dir),
            url_ttl: Duration::from_secs(raw.store.url_ttl_seconds),
            measure_timestamp_diff: raw.store.measure_timestamp_diff,
            compression_level: raw.store.compression_level,
            backend: BackendConfig {
                kind: raw.backend.kind.parse()?,
                container: raw.backend.container,
                root: expand_home(&raw.backend.root),
                credentials: raw
                    .backend
                    .credentials
                    .filter(|c| !c.is_empty())
                    .map(|c| expand_home(&c)),
            },
        })
    }

    /// Build the effective config and its typed view in one step.
    pub fn load(
        config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<(Self, EffectiveConfig), ConfigError> {
        let effective = EffectiveConfig::build(config_path, cli_overrides)?;
        let typed = Self::from_effective(&effective)?;
        Ok((typed, effective))
    }

    /// Config for a store over an in-memory bucket, caching under `cache_dir`.
    pub fn in_memory(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            url_ttl: Duration::from_secs(100_000),
            measure_timestamp_diff: false,
            compression_level: 6,
            backend: BackendConfig {
                kind: BackendKind::Memory,
                container: "cask-artifacts".to_string(),
                root: PathBuf::new(),
                credentials: None,
            },
        }
    }
}

/// Resolve a leading `~/` against `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// `~/.config/cask/config.toml`
pub fn default_config_path() -> PathBuf {
    expand_home("~/.config/cask/config.toml")
}
