//! Cask CLI
//!
//! Entry point for the `cask` command-line tool.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use cask::config::{default_config_path, StoreConfig};
use cask::{build_store, Artifact, ArtifactStore, CacheManager, HttpMethod};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

#[derive(Parser)]
#[command(name = "cask")]
#[command(about = "Artifact store with a validated local cache", version)]
struct Cli {
    /// Config file (default: ~/.config/cask/config.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Backend kind override ("fs" or "memory")
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Container override
    #[arg(long, global = true)]
    container: Option<String>,

    /// Cache directory override
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a directory or file and upload it
    Put {
        key: String,
        path: PathBuf,

        /// Do not mirror the upload into the local cache
        #[arg(long)]
        no_cache: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Download an artifact (prints the destination, or the cache path)
    Get {
        key: String,
        dest: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Delete an artifact remotely and from the cache
    Delete { key: String },

    /// Print a signed URL for an artifact
    Url {
        key: String,

        /// HTTP method the URL is valid for
        #[arg(long, default_value = "GET")]
        method: String,

        /// Lifetime in seconds (default: store.url_ttl_seconds)
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Print the qualified location of an artifact
    Location { key: String },

    /// Grant owner access to a principal, or to everyone
    Grant {
        key: String,

        /// Principal to grant; omit for public access
        #[arg(long)]
        principal: Option<String>,
    },

    /// Print the remote timestamp of an artifact
    Timestamp {
        key: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Local cache commands
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cache entries
    List {
        #[arg(long)]
        json: bool,
    },

    /// Show cache totals
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Remove every cache entry
    Clear {
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli);

    match cli.command {
        Commands::Put {
            key,
            path,
            no_cache,
            json,
        } => run_put(&config, &key, &path, !no_cache, json),
        Commands::Get { key, dest, json } => run_get(&config, &key, dest.as_deref(), json),
        Commands::Delete { key } => run_delete(&config, &key),
        Commands::Url { key, method, ttl } => run_url(&config, &key, &method, ttl),
        Commands::Location { key } => run_location(&config, &key),
        Commands::Grant { key, principal } => run_grant(&config, &key, principal.as_deref()),
        Commands::Timestamp { key, json } => run_timestamp(&config, &key, json),
        Commands::Cache { action } => {
            let cache = CacheManager::new(&config.cache_dir);
            match action {
                CacheCommands::List { json } => run_cache_list(&cache, json),
                CacheCommands::Stats { json } => run_cache_stats(&cache, json),
                CacheCommands::Clear { json } => run_cache_clear(&cache, json),
            }
        }
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn fail(message: impl Display) -> ! {
    eprintln!("Error: {}", message);
    process::exit(1);
}

fn load_config(cli: &Cli) -> StoreConfig {
    let mut overrides = serde_json::Map::new();
    if let Some(ref dir) = cli.cache_dir {
        overrides.insert(
            "store".to_string(),
            json!({"cache_dir": dir.to_string_lossy()}),
        );
    }
    let mut backend = serde_json::Map::new();
    if let Some(ref kind) = cli.backend {
        backend.insert("kind".to_string(), json!(kind));
    }
    if let Some(ref container) = cli.container {
        backend.insert("container".to_string(), json!(container));
    }
    if !backend.is_empty() {
        overrides.insert("backend".to_string(), serde_json::Value::Object(backend));
    }
    let overrides = (!overrides.is_empty()).then_some(serde_json::Value::Object(overrides));

    let path = cli.config.clone().unwrap_or_else(default_config_path);
    if cli.config.is_some() && !path.exists() {
        fail(format!("config file not found: {}", path.display()));
    }

    match StoreConfig::load(Some(&path), overrides) {
        Ok((config, effective)) => {
            tracing::debug!(
                sources = effective.sources.len(),
                redactions = ?effective.redactions,
                "loaded configuration"
            );
            config
        }
        Err(e) => fail(format!("configuration: {}", e)),
    }
}

fn open_store(config: &StoreConfig) -> ArtifactStore {
    build_store(config).unwrap_or_else(|e| fail(e))
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => fail(format!("serializing output: {}", e)),
    }
}

fn run_put(config: &StoreConfig, key: &str, path: &Path, cache: bool, json: bool) {
    let store = open_store(config);
    let outcome = store
        .put(&Artifact::new(key), Some(path), cache)
        .unwrap_or_else(|e| fail(e));

    if json {
        print_json(&outcome);
    } else {
        println!(
            "Uploaded {} ({} bytes{})",
            outcome.key,
            outcome.blob_size,
            if outcome.cached { ", cached" } else { "" }
        );
    }
}

fn run_get(config: &StoreConfig, key: &str, dest: Option<&Path>, json: bool) {
    let store = open_store(config);
    let path = store
        .get(&Artifact::new(key), dest)
        .unwrap_or_else(|e| fail(e));

    if json {
        print_json(&json!({"key": key, "path": path}));
    } else {
        println!("{}", path.display());
    }
}

fn run_delete(config: &StoreConfig, key: &str) {
    let store = open_store(config);
    store
        .delete(&Artifact::new(key))
        .unwrap_or_else(|e| fail(e));
    println!("Deleted {}", key);
}

fn run_url(config: &StoreConfig, key: &str, method: &str, ttl: Option<u64>) {
    let method: HttpMethod = method.parse().unwrap_or_else(|e: String| fail(e));
    let store = open_store(config);
    let artifact = Artifact::new(key);

    let url = match ttl {
        Some(secs) => store.artifact_url_with_ttl(&artifact, method, Duration::from_secs(secs)),
        None => store.artifact_url(&artifact, method),
    }
    .unwrap_or_else(|e| fail(e));
    println!("{}", url);
}

fn run_location(config: &StoreConfig, key: &str) {
    let store = open_store(config);
    let location = store
        .qualified_location(&Artifact::new(key))
        .unwrap_or_else(|e| fail(e));
    println!("{}", location);
}

fn run_grant(config: &StoreConfig, key: &str, principal: Option<&str>) {
    let store = open_store(config);
    store
        .grant_access(&Artifact::new(key), principal)
        .unwrap_or_else(|e| fail(e));
    println!("Granted {} on {}", principal.unwrap_or("public access"), key);
}

fn run_timestamp(config: &StoreConfig, key: &str, json: bool) {
    let store = open_store(config);
    let timestamp = store
        .timestamp(&Artifact::new(key))
        .unwrap_or_else(|e| fail(e));

    if json {
        print_json(&json!({"key": key, "timestamp": timestamp}));
        return;
    }
    match timestamp {
        Some(ts) => println!("{}", ts.to_rfc3339()),
        None => fail(format!("artifact not found: {}", key)),
    }
}

fn run_cache_list(cache: &CacheManager, json: bool) {
    let entries = cache.list().unwrap_or_else(|e| fail(e));

    if json {
        print_json(&entries);
        return;
    }
    if entries.is_empty() {
        println!("Cache is empty: {}", cache.root().display());
        return;
    }
    for entry in entries {
        println!(
            "{}  remote={}  recorded={}",
            entry.key,
            entry.remote_timestamp.to_rfc3339(),
            entry.recorded_at.to_rfc3339()
        );
    }
}

fn run_cache_stats(cache: &CacheManager, json: bool) {
    let stats = cache.stats().unwrap_or_else(|e| fail(e));

    if json {
        print_json(&stats);
    } else {
        println!("Root:    {}", cache.root().display());
        println!("Entries: {}", stats.count);
        println!("Size:    {} bytes", stats.total_size_bytes);
    }
}

fn run_cache_clear(cache: &CacheManager, json: bool) {
    let removed = cache.clear().unwrap_or_else(|e| fail(e));

    if json {
        print_json(&json!({"removed": removed}));
    } else {
        println!("Removed {} cache entries", removed);
    }
}
