//! Configuration for asset-custody

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CustodyError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("asset-custody")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the database and config file
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// SQLite file name inside `storage_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// How long a write waits for the database lock
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Buffered custody events per subscriber before lagging
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Tell room administrators when an issue leaves stock at or below
    /// its threshold
    #[serde(default = "default_true")]
    pub low_stock_notifications: bool,
}

fn default_database_file() -> String {
    "custody.db".to_string()
}

fn default_http_port() -> u16 {
    8095
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_event_bus_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            database_file: default_database_file(),
            http_port: default_http_port(),
            bind_address: default_bind_address(),
            busy_timeout_ms: default_busy_timeout_ms(),
            event_bus_capacity: default_event_bus_capacity(),
            low_stock_notifications: true,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CustodyError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CustodyError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CustodyError> {
        let content = toml::to_string_pretty(self).map_err(|e| CustodyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(&self.database_file)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: Config = toml::from_str("http_port = 9000\n").unwrap();
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.database_file, "custody.db");
        assert_eq!(config.busy_timeout(), Duration::from_millis(5000));
        assert!(config.low_stock_notifications);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage_dir = dir.path().to_path_buf();
        config.low_stock_notifications = false;
        config.save(config.config_path()).unwrap();

        let loaded = Config::load(config.config_path()).unwrap();
        assert_eq!(loaded.storage_dir, dir.path());
        assert!(!loaded.low_stock_notifications);
        assert_eq!(loaded.database_path(), dir.path().join("custody.db"));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        assert!(matches!(
            toml::from_str::<Config>("http_port = \"eighty\"").map_err(|e| CustodyError::Config(e.to_string())),
            Err(CustodyError::Config(_))
        ));
    }
}
