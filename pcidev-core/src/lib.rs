//! PCI device agent core library.
//!
//! Discovers PCI functions on a cluster node, keeps device records in sync
//! with the host, binds claimed devices to the passthrough driver and
//! reports their health to the allocation protocol.

pub mod allocation;
pub mod claims;
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod inventory;
pub mod observability;
pub mod paths;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use allocation::{AllocationRegistry, DeviceHealth, HealthSink, HealthUpdate};
pub use claims::{ClaimController, RecoveryReport};
pub use config::Config;
pub use error::{PciDevError, Result};
pub use events::{ClaimEvent, ClaimEventBus};
pub use inventory::{InventoryReconciler, ReconcileReport};
pub use observability::{
    health::HealthChecker, init as init_observability, shutdown as shutdown_observability,
};
pub use store::{ClaimStore, DeviceStore, LabelSelector, SqliteStore, Store};
pub use types::{PciDevice, PciDeviceClaim, PciFunction};
