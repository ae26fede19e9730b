//! Host network topology queries.
//!
//! Used for two things: keeping the NICs that carry the node's management
//! and cluster-network traffic out of the device inventory, and recording or
//! restoring a NIC's link state around passthrough.

use crate::config::UplinkConfig;
use crate::error::{PciDevError, Result};
use crate::host::{is_valid_pci_address, read_link_name, HostPaths};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fs;
use tokio::process::Command;
use tracing::{debug, info, instrument};

/// Network state the agent needs from the host.
#[async_trait]
pub trait NetworkTopology: Send + Sync {
    /// PCI addresses of NICs that must never be offered for passthrough on `node_name`.
    async fn management_nic_addresses(&self, node_name: &str) -> Result<Vec<String>>;

    /// Interface backed by the PCI function at `address`, if any.
    async fn interface_for_address(&self, address: &str) -> Option<String>;

    /// Operational link state of `interface` ("up", "down", ...).
    async fn link_state(&self, interface: &str) -> Result<String>;

    /// Bring `interface` up.
    async fn set_link_up(&self, interface: &str) -> Result<()>;
}

/// `NetworkTopology` backed by `class/net` in sysfs and the `ip` command.
#[derive(Debug, Clone)]
pub struct SysfsNetwork {
    paths: HostPaths,
    /// Bridge/bond interfaces carrying management traffic
    management_interfaces: Vec<String>,
    uplinks: Vec<UplinkConfig>,
}

impl SysfsNetwork {
    pub fn new(
        paths: HostPaths,
        management_interfaces: Vec<String>,
        uplinks: Vec<UplinkConfig>,
    ) -> Self {
        Self { paths, management_interfaces, uplinks }
    }

    fn interfaces(&self) -> Result<Vec<String>> {
        let net = self.paths.net_class();
        if !net.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&net).map_err(|e| PciDevError::host_io(&net, e))?;
        let mut names: Vec<String> =
            entries.flatten().map(|e| e.file_name().to_string_lossy().to_string()).collect();
        names.sort();
        Ok(names)
    }

    /// PCI address behind `interface`; virtual interfaces have none.
    fn pci_address(&self, interface: &str) -> Option<String> {
        read_link_name(&self.paths.net_class().join(interface).join("device"))
            .filter(|addr| is_valid_pci_address(addr))
    }

    fn master(&self, interface: &str) -> Option<String> {
        read_link_name(&self.paths.net_class().join(interface).join("master"))
    }
}

#[async_trait]
impl NetworkTopology for SysfsNetwork {
    #[instrument(skip(self))]
    async fn management_nic_addresses(&self, node_name: &str) -> Result<Vec<String>> {
        let interfaces = self.interfaces()?;

        // Members of the management bridge/bond
        let mut skip_interfaces: BTreeSet<String> = interfaces
            .iter()
            .filter(|iface| {
                self.master(iface).is_some_and(|m| self.management_interfaces.contains(&m))
            })
            .cloned()
            .collect();

        // Uplinks of cluster networks covering this node
        for uplink in self.uplinks.iter().filter(|u| u.matches_node(node_name)) {
            skip_interfaces.extend(uplink.nics.iter().cloned());
        }

        debug!(interfaces = ?skip_interfaces, "Skipping interfaces");

        let addresses: Vec<String> =
            skip_interfaces.iter().filter_map(|iface| self.pci_address(iface)).collect();

        debug!(addresses = ?addresses, "Skipping interfaces with PCI addresses");
        Ok(addresses)
    }

    async fn interface_for_address(&self, address: &str) -> Option<String> {
        self.interfaces()
            .ok()?
            .into_iter()
            .find(|iface| self.pci_address(iface).as_deref() == Some(address))
    }

    async fn link_state(&self, interface: &str) -> Result<String> {
        let path = self.paths.net_class().join(interface).join("operstate");
        fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|e| PciDevError::host_io(path, e))
    }

    #[instrument(skip(self))]
    async fn set_link_up(&self, interface: &str) -> Result<()> {
        let output = Command::new("ip")
            .args(["link", "set", interface, "up"])
            .output()
            .await
            .map_err(|e| PciDevError::Internal(format!("Failed to run ip: {}", e)))?;

        if !output.status.success() {
            return Err(PciDevError::Internal(format!(
                "Failed to bring {} up: {}",
                interface,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        info!(interface = %interface, "Link restored to up");
        Ok(())
    }
}
