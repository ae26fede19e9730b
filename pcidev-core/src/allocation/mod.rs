//! Allocation health registry.
//!
//! Tracks, per resource class, which device addresses are offered to the
//! allocation protocol and whether each is allocatable. The registry lives
//! in memory only and is rebuilt from claims on every start.
//!
//! Once the allocation protocol has attached to a class (see
//! [`AllocationRegistry::attach`]), every change to that class is pushed as
//! a full listing through a bounded channel drained by a single consumer
//! task. Producers never wait: a full queue drops the update, since the next
//! listing supersedes it anyway.

use crate::error::{PciDevError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};

/// Health of one device as reported to the allocation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHealth {
    /// Enabled for passthrough and allocatable
    Healthy,
    /// Present but not allocatable
    Unhealthy,
}

impl std::fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "Healthy"),
            Self::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatableDevice {
    pub address: String,
    pub health: DeviceHealth,
}

impl AllocatableDevice {
    fn new(address: impl Into<String>, health: DeviceHealth) -> Self {
        Self { address: address.into(), health }
    }
}

/// Full device listing of one class after a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthUpdate {
    pub class: String,
    pub devices: Vec<AllocatableDevice>,
}

/// Point-in-time view of a resource class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceClassSnapshot {
    pub name: String,
    pub devices: Vec<AllocatableDevice>,
    /// Whether the allocation protocol is currently attached
    pub attached: bool,
}

impl ResourceClassSnapshot {
    pub fn health_of(&self, address: &str) -> Option<DeviceHealth> {
        self.devices.iter().find(|d| d.address == address).map(|d| d.health)
    }
}

/// Receiving side of the allocation protocol's watch stream.
#[async_trait]
pub trait HealthSink: Send + Sync {
    /// Deliver one update. An error ends the stream for this attachment.
    async fn send(&self, update: HealthUpdate) -> Result<()>;
}

struct ResourceClass {
    name: String,
    devices: Vec<AllocatableDevice>,
    updates: Option<mpsc::Sender<HealthUpdate>>,
}

impl ResourceClass {
    fn snapshot(&self) -> ResourceClassSnapshot {
        ResourceClassSnapshot {
            name: self.name.clone(),
            devices: self.devices.clone(),
            attached: self.updates.is_some(),
        }
    }

    fn set_health(&mut self, address: &str, health: DeviceHealth) -> bool {
        match self.devices.iter_mut().find(|d| d.address == address) {
            Some(device) if device.health == health => false,
            Some(device) => {
                device.health = health;
                true
            }
            None => {
                self.devices.push(AllocatableDevice::new(address, health));
                true
            }
        }
    }

    /// Queue the current listing for the attached consumer, if any.
    fn push(&mut self) {
        let Some(tx) = &self.updates else {
            return;
        };

        let update = HealthUpdate { class: self.name.clone(), devices: self.devices.clone() };
        match tx.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("pcidev_health_updates_dropped_total").increment(1);
                debug!(class = %self.name, "Health update queue full, dropping update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(class = %self.name, "Health update stream closed, detaching");
                self.updates = None;
            }
        }
    }
}

/// Registry of resource classes and their device health.
///
/// Shared between the claim controller and the allocation protocol; all
/// access goes through one lock.
pub struct AllocationRegistry {
    classes: Mutex<HashMap<String, ResourceClass>>,
    channel_capacity: usize,
}

impl AllocationRegistry {
    /// Create an empty registry whose update queues hold `channel_capacity` listings.
    pub fn new(channel_capacity: usize) -> Self {
        Self { classes: Mutex::new(HashMap::new()), channel_capacity: channel_capacity.max(1) }
    }

    /// Look up a resource class.
    pub async fn find(&self, class: &str) -> Result<ResourceClassSnapshot> {
        let classes = self.classes.lock().await;
        classes
            .get(class)
            .map(ResourceClass::snapshot)
            .ok_or_else(|| PciDevError::ResourceClassNotFound { class: class.to_string() })
    }

    /// Register a new resource class.
    ///
    /// Every seed address starts unhealthy except `claimed`, which starts
    /// healthy (and is added if it is not among the seeds).
    #[instrument(skip(self, seeds))]
    pub async fn create(
        &self,
        class: &str,
        seeds: &[String],
        claimed: &str,
    ) -> Result<ResourceClassSnapshot> {
        let mut classes = self.classes.lock().await;
        if classes.contains_key(class) {
            return Err(PciDevError::AlreadyExists {
                kind: "resource class",
                name: class.to_string(),
            });
        }

        let mut entry =
            ResourceClass { name: class.to_string(), devices: Vec::new(), updates: None };
        for address in seeds {
            if !entry.devices.iter().any(|d| &d.address == address) {
                entry
                    .devices
                    .push(AllocatableDevice::new(address.clone(), DeviceHealth::Unhealthy));
            }
        }
        entry.set_health(claimed, DeviceHealth::Healthy);

        info!(class = %class, devices = entry.devices.len(), "Resource class registered");
        let snapshot = entry.snapshot();
        classes.insert(class.to_string(), entry);
        Ok(snapshot)
    }

    /// Mark `address` healthy in `class`, adding it if the class does not list it yet.
    #[instrument(skip(self))]
    pub async fn mark_healthy(&self, class: &str, address: &str) -> Result<()> {
        let mut classes = self.classes.lock().await;
        let entry = classes
            .get_mut(class)
            .ok_or_else(|| PciDevError::ResourceClassNotFound { class: class.to_string() })?;

        if entry.set_health(address, DeviceHealth::Healthy) {
            debug!("Device marked healthy");
            entry.push();
        }
        Ok(())
    }

    /// Mark `address` unhealthy in every class that lists it.
    ///
    /// Returns whether any class listed the address.
    #[instrument(skip(self))]
    pub async fn mark_unhealthy(&self, address: &str) -> bool {
        let mut classes = self.classes.lock().await;
        let mut found = false;
        for entry in classes.values_mut() {
            let Some(device) = entry.devices.iter_mut().find(|d| d.address == address) else {
                continue;
            };
            found = true;
            if device.health != DeviceHealth::Unhealthy {
                device.health = DeviceHealth::Unhealthy;
                debug!(class = %entry.name, "Device marked unhealthy");
                entry.push();
            }
        }
        found
    }

    /// Stop offering `address` in `class` at all.
    #[instrument(skip(self))]
    pub async fn remove(&self, class: &str, address: &str) -> Result<()> {
        let mut classes = self.classes.lock().await;
        let entry = classes
            .get_mut(class)
            .ok_or_else(|| PciDevError::ResourceClassNotFound { class: class.to_string() })?;

        let before = entry.devices.len();
        entry.devices.retain(|d| d.address != address);
        if entry.devices.len() == before {
            return Err(PciDevError::DeviceNotRegistered {
                class: class.to_string(),
                address: address.to_string(),
            });
        }

        info!("Device removed from resource class");
        entry.push();
        Ok(())
    }

    /// Device listing for `class`.
    pub async fn devices(&self, class: &str) -> Result<Vec<AllocatableDevice>> {
        self.find(class).await.map(|snapshot| snapshot.devices)
    }

    /// Complete the allocation protocol handshake for `class`.
    ///
    /// Returns the current listing and starts forwarding later changes to
    /// `sink`. Attaching again replaces the previous stream.
    #[instrument(skip(self, sink))]
    pub async fn attach(
        &self,
        class: &str,
        sink: Arc<dyn HealthSink>,
    ) -> Result<Vec<AllocatableDevice>> {
        let mut classes = self.classes.lock().await;
        let entry = classes
            .get_mut(class)
            .ok_or_else(|| PciDevError::ResourceClassNotFound { class: class.to_string() })?;

        let (tx, mut rx) = mpsc::channel::<HealthUpdate>(self.channel_capacity);
        entry.updates = Some(tx);

        let class_name = class.to_string();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Err(e) = sink.send(update).await {
                    warn!(class = %class_name, error = %e, "Health stream failed");
                    break;
                }
            }
            debug!(class = %class_name, "Health stream consumer stopped");
        });

        info!(devices = entry.devices.len(), "Allocation protocol attached");
        Ok(entry.devices.clone())
    }
}
