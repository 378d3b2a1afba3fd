//! Node configuration loading and management.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use attest_core::EngineConfig;

/// Full configuration for the Attest node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AttestConfig {
    /// Reconciler, watcher and verifier tuning.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Simulated ledger settings.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// API server settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Interval between blocks produced by the in-process ledger.
    #[serde(default = "default_block_interval_ms")]
    pub block_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API listen address.
    #[serde(default = "default_api_addr")]
    pub listen_addr: String,
    /// API port.
    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Which index store implementation backs the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Rocksdb,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    /// Path to the data directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_block_interval_ms() -> u64 {
    1_000
}
fn default_api_addr() -> String {
    "127.0.0.1".into()
}
fn default_api_port() -> u16 {
    9001
}
fn default_backend() -> StorageBackend {
    StorageBackend::Rocksdb
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            block_interval_ms: default_block_interval_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_api_addr(),
            port: default_api_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl AttestConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: AttestConfig = toml::from_str(&contents)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save the current config to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Socket address string the API binds to.
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.listen_addr, self.api.port)
    }
}
