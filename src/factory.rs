//! Build backends and stores from configuration.

use cask_archive::Archiver;
use cask_backend::{Backend, FsBackend, MemoryBackend, UrlSigner};

use crate::cache::CacheManager;
use crate::config::{BackendConfig, BackendKind, ConfigError, StoreConfig};
use crate::error::StoreResult;
use crate::store::ArtifactStore;

/// Signing key from the configured credentials file, or a fresh one.
fn load_signer(config: &BackendConfig) -> Result<UrlSigner, ConfigError> {
    match &config.credentials {
        Some(path) => UrlSigner::load(path).map_err(|e| {
            ConfigError::Validation(format!(
                "backend.credentials {}: {}",
                path.display(),
                e
            ))
        }),
        None => Ok(UrlSigner::generate()),
    }
}

/// The adapter named by `config`.
pub fn build_backend(config: &BackendConfig) -> Result<Box<dyn Backend>, ConfigError> {
    let signer = load_signer(config)?;
    let backend: Box<dyn Backend> = match config.kind {
        BackendKind::Fs => Box::new(
            FsBackend::new(&config.root, config.container.clone()).with_signer(signer),
        ),
        BackendKind::Memory => Box::new(MemoryBackend::with_signer(config.container.clone(), signer)),
    };
    tracing::debug!(kind = %config.kind, container = %config.container, "built backend");
    Ok(backend)
}

/// A store over the configured backend and cache directory.
///
/// Probes clock skew when `measure_timestamp_diff` is set.
pub fn build_store(config: &StoreConfig) -> StoreResult<ArtifactStore> {
    let backend = build_backend(&config.backend)?;
    let store = ArtifactStore::new(backend, CacheManager::new(&config.cache_dir))
        .with_url_ttl(config.url_ttl)
        .with_archiver(Archiver::new().with_level(config.compression_level));

    if config.measure_timestamp_diff {
        store.measure_clock_skew()?;
    }
    Ok(store)
}
