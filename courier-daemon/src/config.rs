//! Configuration loading for the courier daemon.
//!
//! Configuration is loaded from a TOML file (default: `courierd.toml`).

use courier_core::Backoff;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("config read error: {0}")]
    Io(String),

    /// The file is not valid TOML for this schema.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Root configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Daemon endpoint and file locations.
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Broker session configuration.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Outgoing delivery configuration.
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Periodic maintenance configuration.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// Daemon endpoint and file locations.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Path of the Unix listening socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Path of the single-instance pid file.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    /// Path of the persisted key-value store.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

/// Broker session configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Broker URI, e.g. `tcp://push.example.com:9911`.
    #[serde(default = "default_broker_uri")]
    pub uri: String,
    /// Reconnect backoff base (milliseconds).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Reconnect backoff cap (milliseconds).
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Reconnect backoff jitter span (milliseconds).
    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,
}

/// Outgoing delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Transient attempts before a message is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Retry backoff base (milliseconds).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Retry backoff cap (milliseconds).
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Retry backoff jitter span (milliseconds).
    #[serde(default = "default_delivery_jitter_ms")]
    pub backoff_jitter_ms: u64,
}

/// Periodic maintenance configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    /// Maintenance interval in seconds (default: 3600 = 1 hour).
    #[serde(default = "default_maintenance_interval")]
    pub interval_secs: u64,
    /// Enable the maintenance task (default: true).
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Background identifier pass interval in seconds.
    #[serde(default = "default_identify_interval")]
    pub identify_interval_secs: u64,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Ok(toml::from_str(&raw)?)
    }
}

impl BrokerConfig {
    /// The reconnect backoff curve described by this config.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
            Duration::from_millis(self.backoff_jitter_ms),
        )
    }
}

impl DeliveryConfig {
    /// The retry backoff curve described by this config.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
            Duration::from_millis(self.backoff_jitter_ms),
        )
    }
}

// Default value functions
fn default_socket_path() -> PathBuf {
    PathBuf::from("courierd.sock")
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("courierd.pid")
}

fn default_store_path() -> PathBuf {
    PathBuf::from("courier.db")
}

fn default_broker_uri() -> String {
    "tcp://127.0.0.1:9911".to_string()
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_backoff_jitter_ms() -> u64 {
    1_000
}

fn default_delivery_jitter_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    5
}

fn default_maintenance_interval() -> u64 {
    3_600
}

fn default_enabled() -> bool {
    true
}

fn default_identify_interval() -> u64 {
    3_600
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            pid_file: default_pid_file(),
            store_path: default_store_path(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: default_broker_uri(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            backoff_jitter_ms: default_backoff_jitter_ms(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            backoff_jitter_ms: default_delivery_jitter_ms(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_maintenance_interval(),
            enabled: default_enabled(),
            identify_interval_secs: default_identify_interval(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            broker: BrokerConfig::default(),
            delivery: DeliveryConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}
