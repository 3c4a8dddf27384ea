//! Configuration layering and store construction from a config file.

mod fixtures;

use std::fs;
use std::time::Duration;

use cask::config::{BackendKind, ConfigOrigin};
use cask::{build_store, ConfigError, HttpMethod, StoreConfig};
use cask_backend::UrlSigner;
use serde_json::json;
use tempfile::TempDir;

use fixtures::{artifact, sample_tree, snapshot};

fn write_config(temp: &TempDir, body: &str) -> std::path::PathBuf {
    let path = temp.path().join("config.toml");
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_file_layer_builds_fs_store() {
    let temp = TempDir::new().unwrap();
    let config_path = write_config(
        &temp,
        &format!(
            r#"
[store]
cache_dir = "{cache}"
url_ttl_seconds = 3600

[backend]
kind = "fs"
container = "team-artifacts"
root = "{root}"
"#,
            cache = temp.path().join("cache").display(),
            root = temp.path().join("buckets").display(),
        ),
    );

    let (config, effective) = StoreConfig::load(Some(&config_path), None).unwrap();
    assert_eq!(config.backend.kind, BackendKind::Fs);
    assert_eq!(config.url_ttl, Duration::from_secs(3600));
    assert_eq!(effective.sources[1].origin, ConfigOrigin::File);

    let store = build_store(&config).unwrap();
    let src = sample_tree(&temp, "src", "v1");
    store.put(&artifact("a/b"), Some(&src), true).unwrap();

    assert!(temp
        .path()
        .join("buckets/team-artifacts/objects/a/b")
        .is_file());
    assert_eq!(
        store.qualified_location(&artifact("a/b")).unwrap(),
        "file://team-artifacts/a/b"
    );

    let dest = temp.path().join("dest");
    store.get(&artifact("a/b"), Some(&dest)).unwrap();
    assert_eq!(snapshot(&dest), snapshot(&src));
}

#[test]
fn test_cli_overrides_file() {
    let temp = TempDir::new().unwrap();
    let config_path = write_config(
        &temp,
        "[backend]\nkind = \"fs\"\ncontainer = \"from-file\"\n",
    );

    let cli = json!({"backend": {"kind": "memory"}});
    let (config, effective) = StoreConfig::load(Some(&config_path), Some(cli)).unwrap();

    assert_eq!(config.backend.kind, BackendKind::Memory);
    assert_eq!(config.backend.container, "from-file");
    assert_eq!(effective.sources.len(), 3);
}

#[test]
fn test_invalid_values_rejected() {
    let temp = TempDir::new().unwrap();

    let path = write_config(&temp, "[store]\nurl_ttl_seconds = 0\n");
    assert!(matches!(
        StoreConfig::load(Some(&path), None),
        Err(ConfigError::Validation(_))
    ));

    let path = write_config(&temp, "[backend]\nkind = \"gcs\"\n");
    assert!(matches!(
        StoreConfig::load(Some(&path), None),
        Err(ConfigError::UnknownBackend(_))
    ));
}

#[test]
fn test_credentials_file_signs_urls() {
    let temp = TempDir::new().unwrap();
    let key_path = temp.path().join("signing.key");
    let signer = UrlSigner::generate();
    fs::write(&key_path, signer.encode()).unwrap();

    let cli = json!({
        "store": {"cache_dir": temp.path().join("cache").to_string_lossy()},
        "backend": {"kind": "memory", "credentials": key_path.to_string_lossy()}
    });
    let (config, effective) = StoreConfig::load(None, Some(cli)).unwrap();
    assert!(effective.redactions.contains(&"backend.credentials".to_string()));

    let store = build_store(&config).unwrap();
    let src = sample_tree(&temp, "src", "v1");
    store.put(&artifact("k"), Some(&src), false).unwrap();

    let url = store.artifact_url(&artifact("k"), HttpMethod::Get).unwrap();
    let verified = signer
        .verify(&url, HttpMethod::Get, chrono::Utc::now())
        .unwrap();
    assert_eq!(verified.key, "k");
    assert_eq!(verified.container, "cask-artifacts");
}
