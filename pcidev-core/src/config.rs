//! Configuration management.

use crate::error::{PciDevError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// A cluster-network uplink that claims host NICs on a set of nodes.
///
/// NICs named here are never offered for passthrough on the matched nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    pub name: String,
    /// Nodes this uplink configuration currently applies to
    pub matched_nodes: Vec<String>,
    /// Interface names used by the uplink (e.g. "eth2")
    pub nics: Vec<String>,
}

impl UplinkConfig {
    /// Check whether this uplink applies to the given node.
    pub fn matches_node(&self, node_name: &str) -> bool {
        self.matched_nodes.iter().any(|n| n == node_name)
    }
}

/// Persistent configuration for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_name: String,
    pub sysfs_root: String,
    pub db_path: String,
    pub inventory_interval_secs: u64,
    pub claim_resync_secs: u64,
    pub passthrough_driver: String,
    pub passthrough_modules: Vec<String>,
    pub management_interfaces: Vec<String>,
    pub uplinks: Vec<UplinkConfig>,
    pub health_channel_capacity: usize,
    pub log_level: String,
    pub metrics_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            sysfs_root: paths::DEFAULT_SYSFS_ROOT.to_string(),
            db_path: paths::db_path().to_string_lossy().to_string(),
            inventory_interval_secs: 20,
            claim_resync_secs: 60,
            passthrough_driver: "vfio-pci".to_string(),
            passthrough_modules: vec!["vfio-pci".to_string(), "vfio_iommu_type1".to_string()],
            management_interfaces: vec!["mgmt-br".to_string(), "mgmt-bo".to_string()],
            uplinks: Vec::new(),
            health_channel_capacity: 64,
            log_level: "info".to_string(),
            metrics_port: 9464,
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    ///
    /// `PCIDEV_CONFIG` wins over the default location.
    pub fn config_path() -> PathBuf {
        std::env::var("PCIDEV_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| paths::config_dir().join("config.json"))
    }

    /// Load configuration from disk, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        let config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        Ok(config.with_env_overrides())
    }

    /// Parse a configuration file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| PciDevError::InvalidConfig {
            reason: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&content).map_err(|e| PciDevError::InvalidConfig {
            reason: format!("Failed to parse config: {}", e),
        })
    }

    /// Apply `NODE_NAME`, `PCIDEV_SYSFS_ROOT` and `PCIDEV_DB_PATH`.
    ///
    /// An unset node name falls back to the kernel host name.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(node) = std::env::var("NODE_NAME") {
            self.node_name = node;
        }
        if let Ok(root) = std::env::var("PCIDEV_SYSFS_ROOT") {
            self.sysfs_root = root;
        }
        if let Ok(db) = std::env::var("PCIDEV_DB_PATH") {
            self.db_path = db;
        }
        if self.node_name.is_empty() {
            if let Ok(host) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
                self.node_name = host.trim().to_string();
            }
        }
        self
    }

    /// Reject configurations the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(PciDevError::InvalidConfig {
                reason: "node name is empty (set NODE_NAME)".to_string(),
            });
        }
        if self.inventory_interval_secs == 0 || self.claim_resync_secs == 0 {
            return Err(PciDevError::InvalidConfig {
                reason: "reconcile intervals must be greater than zero".to_string(),
            });
        }
        if self.health_channel_capacity == 0 {
            return Err(PciDevError::InvalidConfig {
                reason: "health_channel_capacity must be greater than zero".to_string(),
            });
        }
        if self.passthrough_driver.trim().is_empty() {
            return Err(PciDevError::InvalidConfig {
                reason: "passthrough_driver is empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn inventory_interval(&self) -> Duration {
        Duration::from_secs(self.inventory_interval_secs)
    }

    pub fn claim_resync_interval(&self) -> Duration {
        Duration::from_secs(self.claim_resync_secs)
    }
}
