//! PCI device record types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carrying the owning node's name, used to scope listings to one node.
pub const NODE_LABEL: &str = "nodename";

/// IOMMU group number for devices whose group is not known.
pub const UNKNOWN_IOMMU_GROUP: i32 = -1;

/// PCI class/subclass of PCI-to-PCI bridges.
pub const PCI_BRIDGE_CLASS: &str = "0604";

/// PCI class id of network controllers.
pub const NETWORK_CLASS_ID: &str = "02";

/// Known vendor IDs.
pub mod vendor {
    pub const NVIDIA: &str = "10de";
    pub const AMD: &str = "1002";
    pub const INTEL: &str = "8086";
}

/// One PCI function as reported by the host bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciFunction {
    /// PCI address (e.g., "0000:01:00.0")
    pub address: String,
    /// Vendor ID (e.g., "10de" for NVIDIA)
    pub vendor_id: String,
    /// Device ID (e.g., "2204" for RTX 3090)
    pub device_id: String,
    /// Class ID (e.g., "03" for display controllers)
    pub class_id: String,
    /// Subclass ID (e.g., "00" for VGA)
    pub subclass_id: String,
    /// Current driver (None if unbound)
    pub driver: Option<String>,
}

impl PciFunction {
    /// Check if this function is a PCI-to-PCI bridge.
    pub fn is_bridge(&self) -> bool {
        format!("{}{}", self.class_id, self.subclass_id) == PCI_BRIDGE_CLASS
    }
}

/// Device record: one physical PCI function on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PciDevice {
    /// Record name, unique per (node, address)
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub status: PciDeviceStatus,
    /// Optimistic concurrency token maintained by the store
    #[serde(default)]
    pub resource_version: i64,
}

/// Observed state of a device record, refreshed every inventory cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PciDeviceStatus {
    pub address: String,
    pub vendor_id: String,
    pub device_id: String,
    pub class_id: String,
    pub node_name: String,
    pub kernel_driver_in_use: Option<String>,
    pub iommu_group: i32,
    pub resource_name: String,
    pub description: String,
}

impl PciDevice {
    /// Build a new record for a function discovered on `node_name`.
    pub fn for_node(function: &PciFunction, node_name: &str, iommu_group: i32) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(NODE_LABEL.to_string(), node_name.to_string());

        let mut device = Self {
            name: device_name(node_name, &function.address),
            labels,
            status: PciDeviceStatus::default(),
            resource_version: 0,
        };
        device.status.refresh(function, node_name, iommu_group);
        device
    }

    /// Check whether the record says the device is bound to `driver`.
    pub fn driver_is(&self, driver: &str) -> bool {
        self.status.kernel_driver_in_use.as_deref() == Some(driver)
    }

    /// Check if the device is a network controller.
    pub fn is_network(&self) -> bool {
        self.status.class_id == NETWORK_CLASS_ID
    }
}

impl PciDeviceStatus {
    /// Refresh status fields from the current host view of the function.
    pub fn refresh(&mut self, function: &PciFunction, node_name: &str, iommu_group: i32) {
        self.address = function.address.clone();
        self.vendor_id = function.vendor_id.clone();
        self.device_id = function.device_id.clone();
        self.class_id = function.class_id.clone();
        self.node_name = node_name.to_string();
        self.kernel_driver_in_use = function.driver.clone();
        self.iommu_group = iommu_group;
        self.resource_name = resource_name(&function.vendor_id, &function.device_id);
        self.description = display_name(&function.vendor_id, &function.device_id);
    }
}

/// Record name for the device at `address` on `node_name`.
///
/// `node1` + `0000:01:00.0` becomes `node1-000001000`.
pub fn device_name(node_name: &str, address: &str) -> String {
    let flat: String = address.chars().filter(|c| *c != ':' && *c != '.').collect();
    format!("{}-{}", node_name, flat).to_lowercase()
}

/// Resource class shared by all devices with the same vendor and device ids.
pub fn resource_name(vendor_id: &str, device_id: &str) -> String {
    let domain = match vendor_id {
        vendor::NVIDIA => "nvidia.com".to_string(),
        vendor::AMD => "amd.com".to_string(),
        vendor::INTEL => "intel.com".to_string(),
        other => format!("pci-{}", other),
    };
    format!("{}/{}-{}", domain, vendor_id, device_id)
}

/// Get a human-readable device name.
pub fn display_name(vendor_id: &str, device_id: &str) -> String {
    let vendor_name = match vendor_id {
        vendor::NVIDIA => "NVIDIA",
        vendor::AMD => "AMD",
        vendor::INTEL => "Intel",
        _ => "Unknown",
    };

    format!("{} [{}:{}]", vendor_name, vendor_id, device_id)
}
