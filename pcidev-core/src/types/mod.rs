//! Core domain types.

pub mod claim;
pub mod device;

// Re-exports
pub use claim::{ClaimPhase, ClaimSpec, ClaimStatus, PciDeviceClaim};
pub use device::{
    device_name, resource_name, PciDevice, PciDeviceStatus, PciFunction, NETWORK_CLASS_ID,
    NODE_LABEL, PCI_BRIDGE_CLASS, UNKNOWN_IOMMU_GROUP,
};
