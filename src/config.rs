//! Node configuration.
//!
//! Loaded from a TOML file with per-field defaults so a partial config
//! is always usable. The `redis_url`/`pg_url` mirrors are recognized and
//! carried for the external analytics layers; the core never requires
//! them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::{consensus, mempool};
use crate::error::{NodeError, NodeResult};
use crate::network_type::NetworkType;

/// Platform data directory: `~/.bt2c` (or the OS config dir on Windows).
pub fn default_data_dir() -> PathBuf {
    if cfg!(windows) {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bt2c")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bt2c")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Optional mempool/cache mirror endpoint (consumed by outer layers)
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Optional relational analytics mirror (not authoritative)
    #[serde(default)]
    pub pg_url: Option<String>,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_block_time_ms")]
    pub block_time_ms: u64,
    #[serde(default = "default_proposer_timeout_ms")]
    pub proposer_timeout_ms: u64,
    #[serde(default = "default_max_block_bytes")]
    pub max_block_bytes: usize,
    #[serde(default = "default_mempool_max_count")]
    pub mempool_max_count: usize,
    #[serde(default = "default_mempool_max_size_bytes")]
    pub mempool_max_size_bytes: usize,
    #[serde(default = "default_mempool_expiration_ms")]
    pub mempool_expiration_ms: u64,
    #[serde(default = "default_mempool_persistence_ms")]
    pub mempool_persistence_ms: u64,
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}
fn default_api_port() -> u16 {
    8335
}
fn default_network() -> String {
    "testnet".to_string()
}
fn default_block_time_ms() -> u64 {
    consensus::TARGET_BLOCK_TIME_MS
}
fn default_proposer_timeout_ms() -> u64 {
    consensus::PROPOSER_TIMEOUT_MS
}
fn default_max_block_bytes() -> usize {
    consensus::MAX_BLOCK_BYTES
}
fn default_mempool_max_count() -> usize {
    mempool::MAX_COUNT
}
fn default_mempool_max_size_bytes() -> usize {
    mempool::MAX_SIZE_BYTES
}
fn default_mempool_expiration_ms() -> u64 {
    mempool::EXPIRATION_MS
}
fn default_mempool_persistence_ms() -> u64 {
    mempool::PERSISTENCE_INTERVAL_MS
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config uses defaults")
    }
}

impl Config {
    pub fn network_type(&self) -> NetworkType {
        NetworkType::from_config(&self.network)
    }

    /// Data directory for the configured network. Testnet gets its own
    /// subdirectory so both networks can coexist on one machine.
    pub fn network_data_dir(&self) -> PathBuf {
        match self.network_type().data_subdir() {
            Some(sub) => self.data_dir.join(sub),
            None => self.data_dir.clone(),
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> NodeResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NodeError::Config(format!(
                "cannot read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        toml::from_str(&raw).map_err(|e| NodeError::Config(format!("malformed config: {e}")))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> NodeResult<()> {
        let raw = toml::to_string_pretty(self)
            .map_err(|e| NodeError::Config(format!("cannot serialize config: {e}")))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| NodeError::Config(format!("cannot create config dir: {e}")))?;
        }
        std::fs::write(path.as_ref(), raw).map_err(|e| {
            NodeError::Config(format!(
                "cannot write config {}: {e}",
                path.as_ref().display()
            ))
        })
    }

    /// Load the config, writing the defaults on first run.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> NodeResult<Self> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            let config = Self::default();
            config.save_to_file(&path)?;
            tracing::info!("✓ Wrote default config to {}", path.as_ref().display());
            Ok(config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_complete() {
        let config = Config::default();
        assert_eq!(config.network, "testnet");
        assert_eq!(config.block_time_ms, consensus::TARGET_BLOCK_TIME_MS);
        assert_eq!(config.mempool_max_count, mempool::MAX_COUNT);
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            network = "mainnet"
            block_time_ms = 60000
            "#,
        )
        .unwrap();
        assert_eq!(config.network_type(), NetworkType::Mainnet);
        assert_eq!(config.block_time_ms, 60_000);
        assert_eq!(config.proposer_timeout_ms, consensus::PROPOSER_TIMEOUT_MS);
    }

    #[test]
    fn test_network_data_dir_split() {
        let mut config = Config::default();
        config.data_dir = PathBuf::from("/tmp/bt2c");
        config.network = "testnet".into();
        assert_eq!(config.network_data_dir(), PathBuf::from("/tmp/bt2c/testnet"));
        config.network = "mainnet".into();
        assert_eq!(config.network_data_dir(), PathBuf::from("/tmp/bt2c"));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config::load_or_create(&path).unwrap();
        let reloaded = Config::load_from_file(&path).unwrap();
        assert_eq!(reloaded.api_port, config.api_port);
        assert_eq!(reloaded.network, config.network);
    }
}
