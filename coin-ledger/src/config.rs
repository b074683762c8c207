//! Configuration for the coin ledger

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Price simulator configuration
    pub simulator: SimulatorConfig,

    /// Lock acquisition configuration
    pub locking: LockConfig,

    /// History paging configuration
    pub history: HistoryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/coin-ledger"),
            service_name: "coin-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            simulator: SimulatorConfig::default(),
            locking: LockConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// fsync every committed batch
    pub sync_writes: bool,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 2,
            sync_writes: true,
            enable_statistics: false,
        }
    }
}

/// Price simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Run the background ticker when the ledger opens
    pub enabled: bool,

    /// Tick interval (milliseconds)
    pub tick_interval_ms: u64,

    /// Smallest value a coin can take
    pub value_floor: Decimal,

    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 5_000,
            value_floor: Decimal::new(1, 8), // 0.00000001
            seed: None,
        }
    }
}

impl SimulatorConfig {
    /// Tick interval as a Duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// Lock acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Total time to wait for a lock before reporting Busy (milliseconds)
    pub wait_timeout_ms: u64,

    /// First backoff slice (microseconds)
    pub initial_backoff_us: u64,

    /// Largest backoff slice (microseconds)
    pub max_backoff_us: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 500,
            initial_backoff_us: 50,
            max_backoff_us: 20_000,
        }
    }
}

impl LockConfig {
    /// Total wait budget
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// First backoff slice
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_micros(self.initial_backoff_us.max(1))
    }

    /// Largest backoff slice
    pub fn max_backoff(&self) -> Duration {
        Duration::from_micros(self.max_backoff_us.max(self.initial_backoff_us).max(1))
    }
}

/// History paging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Page size when the query has none
    pub default_page_size: usize,

    /// Largest page a query may ask for
    pub max_page_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 500,
        }
    }
}

impl HistoryConfig {
    /// Resolve a requested page size
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size.max(1))
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("COIN_LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(tick) = std::env::var("COIN_LEDGER_TICK_MS") {
            config.simulator.tick_interval_ms = tick.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid COIN_LEDGER_TICK_MS '{}': {}", tick, e))
            })?;
        }

        if let Ok(enabled) = std::env::var("COIN_LEDGER_SIMULATOR") {
            config.simulator.enabled = enabled.parse().map_err(|e| {
                crate::Error::Config(format!(
                    "Invalid COIN_LEDGER_SIMULATOR '{}': {}",
                    enabled, e
                ))
            })?;
        }

        if let Ok(seed) = std::env::var("COIN_LEDGER_SEED") {
            config.simulator.seed = Some(seed.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid COIN_LEDGER_SEED '{}': {}", seed, e))
            })?);
        }

        if let Ok(timeout) = std::env::var("COIN_LEDGER_LOCK_TIMEOUT_MS") {
            config.locking.wait_timeout_ms = timeout.parse().map_err(|e| {
                crate::Error::Config(format!(
                    "Invalid COIN_LEDGER_LOCK_TIMEOUT_MS '{}': {}",
                    timeout, e
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.simulator.value_floor <= Decimal::ZERO {
            return Err(crate::Error::Config(
                "simulator.value_floor must be positive".to_string(),
            ));
        }
        if self.simulator.tick_interval_ms == 0 {
            return Err(crate::Error::Config(
                "simulator.tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.history.max_page_size == 0 {
            return Err(crate::Error::Config(
                "history.max_page_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
