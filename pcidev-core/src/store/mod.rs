//! Record store for device and claim records.
//!
//! The controllers only ever see the [`DeviceStore`] and [`ClaimStore`]
//! traits. Records carry a `resource_version`; status updates are
//! compare-and-swap on it so two writers cannot silently overwrite each
//! other.
//!
//! Claims are removed in two steps. [`ClaimStore::request_claim_deletion`]
//! marks the record and announces it on the claim event bus, and
//! [`ClaimStore::finalize_claim_deletion`] drops the row once the device has
//! been released.

use crate::error::Result;
use crate::events::ClaimSubscriber;
use crate::types::{PciDevice, PciDeviceClaim, NODE_LABEL};
use async_trait::async_trait;
use std::collections::BTreeMap;

pub mod migrations;
mod sqlite;

pub use sqlite::SqliteStore;


/// Equality-based label selector.
///
/// An empty selector matches every record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    /// Selector for records belonging to `node_name`.
    pub fn node(node_name: &str) -> Self {
        Self::everything().with(NODE_LABEL, node_name)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> =
            self.requirements.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Persistence for device records.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get_device(&self, name: &str) -> Result<PciDevice>;

    async fn list_devices(&self, selector: &LabelSelector) -> Result<Vec<PciDevice>>;

    /// Insert a new record; fails with `AlreadyExists` if the name is taken.
    async fn create_device(&self, device: &PciDevice) -> Result<PciDevice>;

    /// Replace the status of an existing record.
    ///
    /// Fails with `Conflict` when `device.resource_version` is stale.
    async fn update_device_status(&self, device: &PciDevice) -> Result<PciDevice>;

    async fn delete_device(&self, name: &str) -> Result<()>;
}

/// Persistence and change notification for claim records.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn get_claim(&self, name: &str) -> Result<PciDeviceClaim>;

    async fn list_claims(&self) -> Result<Vec<PciDeviceClaim>>;

    /// Insert a new claim and publish a `Changed` event.
    ///
    /// Fails with `AlreadyExists` if the name is taken or another claim not
    /// being deleted already names the same owner.
    async fn create_claim(&self, claim: &PciDeviceClaim) -> Result<PciDeviceClaim>;

    /// Replace owner and spec and publish a `Changed` event.
    ///
    /// Moving a claim onto a device that already has an active claim fails
    /// with `AlreadyExists`.
    async fn update_claim_spec(&self, claim: &PciDeviceClaim) -> Result<PciDeviceClaim>;

    /// Replace the status (compare-and-swap on `resource_version`).
    ///
    /// Status writes come from the controller itself and are not published.
    async fn update_claim_status(&self, claim: &PciDeviceClaim) -> Result<PciDeviceClaim>;

    /// Mark a claim for deletion and publish a `Removing` event.
    ///
    /// Requesting deletion twice is not an error.
    async fn request_claim_deletion(&self, name: &str) -> Result<PciDeviceClaim>;

    /// Remove the claim record for good.
    async fn finalize_claim_deletion(&self, name: &str) -> Result<()>;

    fn subscribe_claims(&self) -> ClaimSubscriber;
}

/// Everything the controllers need from the record store.
pub trait Store: DeviceStore + ClaimStore {}

impl<T: DeviceStore + ClaimStore> Store for T {}
