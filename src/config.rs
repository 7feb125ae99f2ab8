//! Configuration for gramitra-sync

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gramitra-sync")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for the durable queue and record store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Identity string reported in operations from this node
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Maximum operations the outbox will hold before reporting
    /// StorageExhausted (0 = unlimited)
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: u64,

    /// sled cache size in bytes
    #[serde(default = "default_cache_size")]
    pub cache_size: u64,

    /// Page size for pull_changes batches
    #[serde(default = "default_pull_batch")]
    pub pull_batch: u64,

    /// Broadcast channel capacity for the authority change hub
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_node_id() -> String {
    "gramitra-node".to_string()
}

fn default_outbox_capacity() -> u64 {
    10_000
}

fn default_cache_size() -> u64 {
    16 * 1024 * 1024 // 16MB
}

fn default_pull_batch() -> u64 {
    256
}

fn default_broadcast_capacity() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            node_id: default_node_id(),
            outbox_capacity: default_outbox_capacity(),
            cache_size: default_cache_size(),
            pull_batch: default_pull_batch(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Outbox database path
    pub fn outbox_db_path(&self) -> PathBuf {
        self.data_dir.join("outbox.sled")
    }

    /// Record store database path
    pub fn record_db_path(&self) -> PathBuf {
        self.data_dir.join("records.sled")
    }

    /// Config file path
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
