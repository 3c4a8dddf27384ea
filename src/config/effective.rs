//! Effective configuration with provenance
//!
//! Captures the merged configuration plus where each layer came from. The
//! serialized form is redacted; lookups read the resolved values.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::defaults::BuiltinDefaults;
use super::merge::merge_layers;
use super::BackendKind;

/// Schema version for effective_config
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "cask/effective_config@1";

/// Upper bound for signed URL lifetimes (7 days).
pub const MAX_URL_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Origin of a configuration source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Cli,
}

/// A contributing config source with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 digest of raw file bytes (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Effective configuration with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub schema_version: u32,
    pub schema_id: String,

    /// When this config was computed
    pub created_at: DateTime<Utc>,

    /// Merged configuration with secrets redacted
    pub config: Value,

    /// Contributing sources in precedence order
    pub sources: Vec<ConfigSource>,

    /// Redacted key paths
    pub redactions: Vec<String>,

    /// Merged configuration as loaded
    #[serde(skip)]
    resolved: Value,
}

/// Keys that contain secrets and should be redacted
const SECRET_KEYS: &[&str] = &[
    "password",
    "token",
    "secret",
    "private_key",
    "api_key",
    "credential",
];

impl EffectiveConfig {
    /// Build effective config from the defaults, an optional TOML file and
    /// CLI overrides. A missing file is skipped.
    pub fn build(
        config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        if let Some(path) = config_path {
            if path.exists() {
                let (value, digest) = Self::load_toml_file(path)?;
                layers.push(value);
                sources.push(ConfigSource {
                    origin: ConfigOrigin::File,
                    path: Some(path.to_string_lossy().to_string()),
                    digest: Some(digest),
                });
            } else {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
            }
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let resolved = merge_layers(layers);
        Self::validate_config(&resolved)?;

        let mut config = resolved.clone();
        let redactions = Self::redact_secrets(&mut config);

        Ok(Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            config,
            sources,
            redactions,
            resolved,
        })
    }

    /// Load and parse a TOML file, returning the value and digest
    fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let digest = hex::encode(Sha256::digest(&bytes));

        let contents = String::from_utf8(bytes)
            .map_err(|e| ConfigError::Parse(format!("{}: invalid UTF-8: {}", path.display(), e)))?;
        let toml_value: toml::Value = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;

        Ok((Self::toml_to_json(toml_value), digest))
    }

    fn toml_to_json(toml: toml::Value) -> Value {
        match toml {
            toml::Value::String(s) => Value::String(s),
            toml::Value::Integer(i) => Value::Number(i.into()),
            toml::Value::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            toml::Value::Boolean(b) => Value::Bool(b),
            toml::Value::Datetime(dt) => Value::String(dt.to_string()),
            toml::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Self::toml_to_json).collect())
            }
            toml::Value::Table(table) => Value::Object(
                table
                    .into_iter()
                    .map(|(k, v)| (k, Self::toml_to_json(v)))
                    .collect(),
            ),
        }
    }

    /// Redact secrets in place, returning the redacted paths
    fn redact_secrets(value: &mut Value) -> Vec<String> {
        let mut redactions = Vec::new();
        Self::redact_recursive(value, String::new(), &mut redactions);
        redactions
    }

    fn redact_recursive(value: &mut Value, path: String, redactions: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let key_lower = key.to_lowercase();
                    let current_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", path, key)
                    };

                    let is_secret = SECRET_KEYS.iter().any(|s| key_lower.contains(s));
                    if is_secret && !val.is_object() && !val.is_array() {
                        *val = Value::String("[REDACTED]".to_string());
                        redactions.push(current_path);
                    } else {
                        Self::redact_recursive(val, current_path, redactions);
                    }
                }
            }
            Value::Array(arr) => {
                for (i, val) in arr.iter_mut().enumerate() {
                    Self::redact_recursive(val, format!("{}[{}]", path, i), redactions);
                }
            }
            _ => {}
        }
    }

    fn validate_config(config: &Value) -> Result<(), ConfigError> {
        if let Some(v) = config.pointer("/store/url_ttl_seconds") {
            if !matches!(v.as_u64(), Some(ttl) if ttl > 0 && ttl <= MAX_URL_TTL_SECONDS) {
                return Err(ConfigError::Validation(format!(
                    "store.url_ttl_seconds must be in (0, {}]",
                    MAX_URL_TTL_SECONDS
                )));
            }
        }

        if let Some(v) = config.pointer("/store/compression_level") {
            if !matches!(v.as_u64(), Some(level) if level <= 9) {
                return Err(ConfigError::Validation(
                    "store.compression_level must be an integer in 0..=9".to_string(),
                ));
            }
        }

        let container = config.pointer("/backend/container").and_then(|v| v.as_str());
        if container.map_or(true, |c| c.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "backend.container must be a non-empty string".to_string(),
            ));
        }

        let kind = config
            .pointer("/backend/kind")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        kind.parse::<BackendKind>()?;

        Ok(())
    }

    /// Serialize the redacted view to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write the redacted view to a file
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }

    /// The resolved (unredacted) configuration
    pub fn resolved(&self) -> &Value {
        &self.resolved
    }

    /// Get a resolved value by dot-separated path
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.resolved;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    pub fn get_u64(&self, path: &str) -> Option<u64> {
        self.get(path).and_then(|v| v.as_u64())
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(|v| v.as_str())
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(|v| v.as_bool())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown backend kind {0:?} (expected \"fs\" or \"memory\")")]
    UnknownBackend(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_build_with_defaults_only() {
        let config = EffectiveConfig::build(None, None).unwrap();

        assert_eq!(config.schema_version, SCHEMA_VERSION);
        assert_eq!(config.get_u64("store.url_ttl_seconds"), Some(100_000));
        assert_eq!(config.get_str("backend.kind"), Some("fs"));
        assert_eq!(config.get_bool("store.measure_timestamp_diff"), Some(false));
    }

    #[test]
    fn test_build_with_cli_override() {
        let cli = json!({"store": {"url_ttl_seconds": 600}});
        let config = EffectiveConfig::build(None, Some(cli)).unwrap();

        assert_eq!(config.get_u64("store.url_ttl_seconds"), Some(600));
        assert_eq!(config.get_str("backend.container"), Some("cask-artifacts"));
    }

    #[test]
    fn test_validation_ttl_bounds() {
        for bad in [json!(0), json!(MAX_URL_TTL_SECONDS + 1), json!(-5), json!("long")] {
            let cli = json!({"store": {"url_ttl_seconds": bad}});
            let err = EffectiveConfig::build(None, Some(cli)).unwrap_err();
            assert!(err.to_string().contains("url_ttl_seconds"), "{}", err);
        }

        let cli = json!({"store": {"url_ttl_seconds": MAX_URL_TTL_SECONDS}});
        assert!(EffectiveConfig::build(None, Some(cli)).is_ok());
    }

    #[test]
    fn test_validation_compression_level() {
        for bad in [json!(10), json!(-1), json!("fast")] {
            let cli = json!({"store": {"compression_level": bad}});
            let err = EffectiveConfig::build(None, Some(cli)).unwrap_err();
            assert!(err.to_string().contains("compression_level"), "{}", err);
        }

        let cli = json!({"store": {"compression_level": 0}});
        assert!(EffectiveConfig::build(None, Some(cli)).is_ok());
    }

    #[test]
    fn test_validation_empty_container() {
        let cli = json!({"backend": {"container": "  "}});
        let err = EffectiveConfig::build(None, Some(cli)).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_validation_unknown_backend() {
        let cli = json!({"backend": {"kind": "tape"}});
        let err = EffectiveConfig::build(None, Some(cli)).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBackend(ref k) if k == "tape"));
    }

    #[test]
    fn test_credentials_redacted_in_view_only() {
        let cli = json!({"backend": {"credentials": "/keys/signing.key"}});
        let config = EffectiveConfig::build(None, Some(cli)).unwrap();

        assert_eq!(config.config["backend"]["credentials"], "[REDACTED]");
        assert_eq!(config.get_str("backend.credentials"), Some("/keys/signing.key"));
        assert_eq!(config.redactions, vec!["backend.credentials".to_string()]);
        assert!(!config.to_json().unwrap().contains("/keys/signing.key"));
    }

    #[test]
    fn test_load_toml_file() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "[store]").unwrap();
        writeln!(temp, "url_ttl_seconds = 900").unwrap();
        writeln!(temp, "[backend]").unwrap();
        writeln!(temp, "kind = \"memory\"").unwrap();

        let config = EffectiveConfig::build(Some(temp.path()), None).unwrap();

        assert_eq!(config.get_u64("store.url_ttl_seconds"), Some(900));
        assert_eq!(config.get_str("backend.kind"), Some("memory"));
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[1].origin, ConfigOrigin::File);
        assert_eq!(config.sources[1].digest.as_ref().unwrap().len(), 64);
    }

    #[test]
    fn test_cli_beats_file() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "[backend]\ncontainer = \"from-file\"").unwrap();

        let cli = json!({"backend": {"container": "from-cli"}});
        let config = EffectiveConfig::build(Some(temp.path()), Some(cli)).unwrap();

        assert_eq!(config.get_str("backend.container"), Some("from-cli"));
        let origins: Vec<_> = config.sources.iter().map(|s| s.origin.clone()).collect();
        assert_eq!(
            origins,
            vec![ConfigOrigin::Builtin, ConfigOrigin::File, ConfigOrigin::Cli]
        );
    }

    #[test]
    fn test_invalid_toml() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "[store\nbroken").unwrap();

        let err = EffectiveConfig::build(Some(temp.path()), None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = EffectiveConfig::build(Some(&dir.path().join("absent.toml")), None).unwrap();
        assert_eq!(config.sources.len(), 1);
    }
}
