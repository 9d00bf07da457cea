//! Configuration management for chaincore

use crate::blockchain::{Chain, ChainOptions};
use crate::cache::{DEFAULT_BLOCK_CACHE_SIZE, DEFAULT_COIN_CACHE_SIZE};
use crate::chaindb::ChainDb;
use crate::clock::SystemClock;
use crate::error::{ChainError, Result};
use crate::hash::from_hex;
use crate::params::{ChainParams, Network};
use crate::persistence::{Database, InMemoryPersistence, Persistence};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Database path that selects the in-memory backend.
pub const IN_MEMORY_PATH: &str = ":memory:";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Extra checkpoints appended to the network's table.
    #[serde(default)]
    pub checkpoints: Vec<CheckpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_network")]
    pub network: Network,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_script_threads")]
    pub script_threads: usize,
    #[serde(default = "default_coin_cache_size")]
    pub coin_cache_size: usize,
    #[serde(default = "default_block_cache_size")]
    pub block_cache_size: usize,
    /// Added to the system clock, in seconds.
    #[serde(default)]
    pub clock_offset_secs: i64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            script_threads: default_script_threads(),
            coin_cache_size: default_coin_cache_size(),
            block_cache_size: default_block_cache_size(),
            clock_offset_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointConfig {
    pub height: u32,
    /// Display (byte-reversed) hex.
    pub hash: String,
}

fn default_network() -> Network {
    Network::Regtest
}

fn default_db_path() -> String {
    "./data/chain.db".to_string()
}

fn default_script_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_coin_cache_size() -> usize {
    DEFAULT_COIN_CACHE_SIZE
}

fn default_block_cache_size() -> usize {
    DEFAULT_BLOCK_CACHE_SIZE
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// Reads `path`, falling back to defaults when the file does not exist.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let config: Config = match fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => return Err(e.into()),
    };
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn from_toml(contents: &str) -> Result<Config> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database.path.is_empty() {
            return Err(ChainError::Config("database.path must be set".to_string()));
        }
        if self.validation.script_threads == 0 {
            return Err(ChainError::Config(
                "validation.script_threads must be at least 1".to_string(),
            ));
        }
        if self.validation.coin_cache_size == 0 || self.validation.block_cache_size == 0 {
            return Err(ChainError::Config("cache sizes must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Network parameters with the configured extra checkpoints.
    pub fn chain_params(&self) -> Result<ChainParams> {
        let mut params = ChainParams::for_network(self.chain.network)?;
        for checkpoint in &self.checkpoints {
            params.add_checkpoint(checkpoint.height, from_hex(&checkpoint.hash)?);
        }
        Ok(params)
    }

    pub fn open_database(&self) -> Result<ChainDb> {
        let store: Arc<dyn Persistence> = if self.database.path == IN_MEMORY_PATH {
            Arc::new(InMemoryPersistence::new())
        } else {
            if let Some(parent) = Path::new(&self.database.path).parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            Arc::new(Database::open(&self.database.path)?)
        };
        Ok(ChainDb::with_cache_sizes(
            store,
            self.validation.coin_cache_size,
            self.validation.block_cache_size,
        ))
    }

    pub fn chain_options(&self) -> ChainOptions {
        ChainOptions::default()
            .with_script_threads(self.validation.script_threads)
            .with_clock(Arc::new(SystemClock::with_offset(
                self.validation.clock_offset_secs,
            )))
    }

    /// Opens the configured chain.
    pub fn open_chain(&self) -> Result<Chain> {
        info!(
            "Opening {} chain at {}",
            self.chain.network, self.database.path
        );
        Chain::open(self.chain_params()?, self.open_database()?, self.chain_options())
    }
}

/// Installs the global `tracing` subscriber. Later calls are no-ops.
pub fn init_logging(filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .try_init();
}
