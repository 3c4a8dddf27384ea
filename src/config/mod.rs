//! Layered configuration
//!
//! 1. Built-in defaults
//! 2. Config file (~/.config/cask/config.toml)
//! 3. CLI flags

mod defaults;
mod effective;
mod merge;
mod store_config;

pub use defaults::BuiltinDefaults;
pub use effective::{
    ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig, MAX_URL_TTL_SECONDS,
};
pub use merge::{deep_merge, merge_layers};
pub use store_config::{
    default_config_path, expand_home, BackendConfig, BackendKind, StoreConfig,
};
