//! Configuration management for the projection engine
//! Supports environment variables and default values for the store paths and
//! watcher pacing.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the projection engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Store locations
    pub storage: StorageConfig,

    /// Watcher pacing and recovery behaviour
    pub watcher: WatcherConfig,

    /// Read API server
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the projection database (created if missing)
    pub api_database: String,

    /// Path of the ledger database (opened read-only)
    pub ledger_database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Idle sleep between polls when the ledger has no new event (default: 100)
    pub poll_interval_ms: u64,

    /// Floor between two mempool rebuilds in seconds (default: 10)
    pub mempool_sync_interval_secs: u64,

    /// How long to wait on the migration advisory lock before breaking it
    /// (default: 30)
    pub migration_lock_timeout_secs: u64,

    /// Swallow non-uniqueness mempool SQL errors instead of propagating them
    /// (default: false)
    pub tolerate_mempool_errors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Port the read API listens on (default: 3001)
    pub port: u16,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            api_database: "api.db".to_string(),
            ledger_database: "ledger.db".to_string(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            mempool_sync_interval_secs: 10,
            migration_lock_timeout_secs: 30,
            tolerate_mempool_errors: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 3001 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            watcher: WatcherConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn api_database_path(&self) -> PathBuf {
        PathBuf::from(&self.api_database)
    }

    pub fn ledger_database_path(&self) -> PathBuf {
        PathBuf::from(&self.ledger_database)
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn mempool_sync_interval(&self) -> Duration {
        Duration::from_secs(self.mempool_sync_interval_secs)
    }

    pub fn migration_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.migration_lock_timeout_secs)
    }
}

impl Config {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(api_database) = env::var("API_DATABASE") {
            config.storage.api_database = api_database;
        }

        if let Ok(ledger_database) = env::var("LEDGER_DATABASE") {
            config.storage.ledger_database = ledger_database;
        }

        if let Ok(poll_interval) = env::var("WATCHER_POLL_INTERVAL_MS") {
            config.watcher.poll_interval_ms = poll_interval
                .parse()
                .unwrap_or(config.watcher.poll_interval_ms);
        }

        if let Ok(sync_interval) = env::var("WATCHER_MEMPOOL_SYNC_INTERVAL_SECS") {
            config.watcher.mempool_sync_interval_secs = sync_interval
                .parse()
                .unwrap_or(config.watcher.mempool_sync_interval_secs);
        }

        if let Ok(lock_timeout) = env::var("WATCHER_MIGRATION_LOCK_TIMEOUT_SECS") {
            config.watcher.migration_lock_timeout_secs = lock_timeout
                .parse()
                .unwrap_or(config.watcher.migration_lock_timeout_secs);
        }

        if let Ok(tolerate) = env::var("WATCHER_TOLERATE_MEMPOOL_ERRORS") {
            config.watcher.tolerate_mempool_errors = tolerate
                .parse()
                .unwrap_or(config.watcher.tolerate_mempool_errors);
        }

        if let Ok(port) = env::var("API_PORT") {
            config.api.port = port.parse().unwrap_or(config.api.port);
        }

        // Validate configuration
        config.validate();

        config
    }

    /// Validate configuration values
    fn validate(&mut self) {
        // A zero poll interval would spin the follow loop
        if self.watcher.poll_interval_ms == 0 {
            eprintln!("⚠️  Invalid poll_interval_ms: 0, using default");
            self.watcher.poll_interval_ms = 100;
        }

        if self.watcher.migration_lock_timeout_secs == 0 {
            eprintln!("⚠️  Invalid migration_lock_timeout_secs: 0, using default");
            self.watcher.migration_lock_timeout_secs = 30;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.watcher.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.watcher.mempool_sync_interval(), Duration::from_secs(10));
        assert!(!config.watcher.tolerate_mempool_errors);
    }
}
