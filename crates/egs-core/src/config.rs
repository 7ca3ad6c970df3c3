//! Configuration types for the GPR engine daemon

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::RawInventoryItem;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Workspaces and the clusters they may reach
    pub workspaces: Vec<WorkspaceConfig>,
    /// Inventory used to seed the index before the first feed event
    pub inventory: Vec<RawInventoryItem>,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::EgsError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::EgsError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::EgsError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

/// Admission, sweep and retention settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between idle-timeout / exit-duration sweeps
    pub sweep_interval_secs: u64,
    /// Selection attempts that may hit insufficient capacity before a GPR fails
    pub max_selection_retries: u32,
    /// How long terminal GPRs remain queryable
    pub terminal_retention_secs: u64,
    /// Buffer size of the inventory feed channel
    pub inventory_channel_capacity: usize,
}

impl SchedulerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// `None` when the retention is too long to represent, i.e. forever
    pub fn terminal_retention(&self) -> Option<chrono::Duration> {
        i64::try_from(self.terminal_retention_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            max_selection_retries: 10,
            terminal_retention_secs: 3600,
            inventory_channel_capacity: 64,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// A workspace and its reachable clusters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub name: String,
    pub clusters: Vec<String>,
}
