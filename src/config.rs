//! Configuration for lp-event-queue

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::backfill::BackfillConfig;
use crate::error::StorageError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lp-event-queue")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database and config file
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Public base URL of the host, used to build object permalinks
    #[serde(default = "default_http_path")]
    pub http_path: String,

    /// Default tracing directive, extended by RUST_LOG
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Bulk initializer settings
    #[serde(default)]
    pub backfill: BackfillConfig,
}

fn default_http_path() -> String {
    "http://localhost".to_string()
}

fn default_log_filter() -> String {
    "lp_event_queue=info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            http_path: default_http_path(),
            log_filter: default_log_filter(),
            backfill: BackfillConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| StorageError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), StorageError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| StorageError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Path of the config file inside the storage directory
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    /// Path of the SQLite database
    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join("lerq.db")
    }
}
