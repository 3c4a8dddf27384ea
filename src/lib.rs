//! Cask - artifact persistence with a validated local cache
//!
//! Stores, retrieves, deletes and shares directory or file artifacts against
//! interchangeable object-storage backends. Artifacts travel as gzip'd tar
//! blobs; reads are served from a local cache while the remote timestamp
//! says the cached copy is current.

pub mod cache;
pub mod config;
pub mod error;
pub mod factory;
pub mod fsutil;
pub mod store;

pub use cache::{CacheEntry, CacheError, CacheManager, CacheStats};
pub use config::{ConfigError, EffectiveConfig, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use factory::{build_backend, build_store};
pub use store::{Artifact, ArtifactStore, PutOutcome};

pub use cask_archive::{ArchiveError, Archiver};
pub use cask_backend::{
    Backend, BackendError, FsBackend, Grantee, HttpMethod, MemoryBackend, Timestamp,
};
