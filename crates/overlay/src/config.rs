//! Configuration module
//!
//! YAML configuration files with one section per component

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::node_manager::NodeRegistryConfig;
use crate::scheduler::DepartureConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlayConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub departure: DepartureSection,
    #[serde(default)]
    pub log: LogConfig,
}

impl OverlayConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub name: String,
    /// Snapshot directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Periodic snapshot interval in seconds, 0 disables it
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            data_dir: default_data_dir(),
            save_interval_secs: default_save_interval_secs(),
        }
    }
}


/// HTTP command surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_addr")]
    pub addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: default_http_addr(),
        }
    }
}


/// Node registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: i64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl RegistryConfig {
    pub fn to_registry_config(&self) -> NodeRegistryConfig {
        NodeRegistryConfig {
            heartbeat_timeout_secs: self.heartbeat_timeout_secs,
            check_interval_secs: self.check_interval_secs,
        }
    }
}

/// Placement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Backup copies per chunk, 0 disables replication
    #[serde(default)]
    pub backup_count: usize,
    /// Capacity assumed for peers that join without one
    #[serde(default = "default_capacity_bytes")]
    pub default_capacity_bytes: u64,
    /// Default chunk size for creations without a size
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,
    #[serde(default = "default_true")]
    pub load_balance: bool,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            backup_count: 0,
            default_capacity_bytes: default_capacity_bytes(),
            default_chunk_size: default_chunk_size(),
            load_balance: true,
        }
    }
}

/// Migration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: default_transfer_timeout_ms(),
        }
    }
}

impl MigrationConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

/// Departure handling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepartureSection {
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl Default for DepartureSection {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_parallel: default_max_parallel(),
        }
    }
}

impl DepartureSection {
    /// Promotions of a failed owner's backups are bounded by `promote_timeout`
    pub fn to_departure_config(&self, promote_timeout: Duration) -> DepartureConfig {
        DepartureConfig {
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            max_parallel: self.max_parallel,
            promote_timeout,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions

fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./overlay_data")
}

fn default_save_interval_secs() -> u64 {
    60
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_heartbeat_timeout_secs() -> i64 {
    30
}

fn default_check_interval_secs() -> u64 {
    10
}

fn default_capacity_bytes() -> u64 {
    1024 * 1024 * 1024 // 1GB
}

fn default_chunk_size() -> u64 {
    64
}

fn default_true() -> bool {
    true
}

fn default_transfer_timeout_ms() -> u64 {
    5000
}

fn default_shutdown_timeout_ms() -> u64 {
    10000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    50
}

fn default_backoff_max_ms() -> u64 {
    1000
}

fn default_max_parallel() -> usize {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}
