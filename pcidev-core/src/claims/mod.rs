//! Claim lifecycle controller.
//!
//! Drives each claim targeting this node through its lifecycle:
//!
//! ```text
//! Unbound --enable--> Enabling --bind ok--> Enabled --delete--> Disabling --> (gone)
//!                        |
//!                        +--bind failed--> Unbound (retried on resync)
//! ```
//!
//! Only `passthroughEnabled` and the deletion mark are persisted; `Enabling`
//! exists only while a handler runs.
//!
//! Before handling events the controller loads the passthrough modules,
//! replays enable for claims whose binding was lost across a reboot, and
//! releases devices left bound to the passthrough driver without a claim.

use crate::allocation::AllocationRegistry;
use crate::error::{PciDevError, Result};
use crate::events::ClaimEvent;
use crate::host::{DriverBinder, NetworkTopology};
use crate::observability::health::{HealthChecker, HealthStatus, CLAIMS_SUBSYSTEM};
use crate::observability::metrics::{record_claim_transition, record_orphans_unbound};
use crate::store::{LabelSelector, Store};
use crate::types::{PciDevice, PciDeviceClaim};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of the reboot recovery pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Claims whose device had to be bound again
    pub rebound: usize,
    /// Claims whose device was still bound
    pub already_bound: usize,
}

/// Reacts to claim changes and keeps device bindings and allocation health in step.
pub struct ClaimController {
    node_name: String,
    store: Arc<dyn Store>,
    binder: DriverBinder,
    network: Arc<dyn NetworkTopology>,
    registry: Arc<AllocationRegistry>,
    resync_interval: Duration,
    health: Option<HealthChecker>,
}

impl ClaimController {
    pub fn new(
        node_name: impl Into<String>,
        store: Arc<dyn Store>,
        binder: DriverBinder,
        network: Arc<dyn NetworkTopology>,
        registry: Arc<AllocationRegistry>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            store,
            binder,
            network,
            registry,
            resync_interval,
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthChecker) -> Self {
        self.health = Some(health);
        self
    }

    pub fn registry(&self) -> &Arc<AllocationRegistry> {
        &self.registry
    }

    /// Device record the claim belongs to.
    async fn resolve_device(&self, claim: &PciDeviceClaim) -> Result<PciDevice> {
        let missing = || PciDevError::MissingOwner { claim: claim.name.clone() };
        let owner = claim.owner.as_deref().ok_or_else(missing)?;
        match self.store.get_device(owner).await {
            Ok(device) => Ok(device),
            Err(e) if e.is_not_found() => Err(missing()),
            Err(e) => Err(e),
        }
    }

    /// Driver bound to the device right now, ignoring the passthrough driver.
    fn host_driver(&self, device: &PciDevice) -> Option<String> {
        self.binder
            .current_driver(&device.status.address)
            .or_else(|| device.status.kernel_driver_in_use.clone())
            .filter(|d| !d.trim().is_empty() && d != self.binder.passthrough_driver())
    }

    /// Offer the device as healthy in its resource class, creating the class if needed.
    async fn register_healthy(&self, device: &PciDevice) -> Result<()> {
        let class = &device.status.resource_name;
        let address = &device.status.address;

        match self.registry.find(class).await {
            Ok(_) => return self.registry.mark_healthy(class, address).await,
            Err(PciDevError::ResourceClassNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let seeds: Vec<String> = self
            .store
            .list_devices(&LabelSelector::node(&self.node_name))
            .await?
            .into_iter()
            .filter(|d| &d.status.resource_name == class)
            .map(|d| d.status.address)
            .collect();

        match self.registry.create(class, &seeds, address).await {
            Ok(_) => Ok(()),
            // Another handler created it first
            Err(PciDevError::AlreadyExists { .. }) => {
                self.registry.mark_healthy(class, address).await
            }
            Err(e) => Err(e),
        }
    }

    /// Bind the claimed device to the passthrough driver and offer it for allocation.
    ///
    /// A device already bound to the passthrough driver gets no driver
    /// writes at all. If binding fails the claim is persisted with
    /// passthrough disabled and the error is returned.
    #[instrument(skip(self, claim), fields(claim = %claim.name, address = %claim.spec.address))]
    pub async fn enable_passthrough(&self, claim: PciDeviceClaim) -> Result<PciDeviceClaim> {
        let device = self.resolve_device(&claim).await?;
        let address = device.status.address.clone();
        info!(from = %claim.phase(), to = "enabling", "Claim transition");

        let mut updated = claim.clone();

        if self.binder.is_passthrough_bound(&address) {
            debug!("Device already bound to passthrough driver");
            if updated.status.kernel_driver_to_unbind.is_none() {
                updated.status.kernel_driver_to_unbind = self.host_driver(&device);
            }
        } else {
            let current = self.host_driver(&device);
            if current.is_some() {
                updated.status.kernel_driver_to_unbind = current.clone();
            }

            if device.is_network() {
                if let Some(iface) = self.network.interface_for_address(&address).await {
                    match self.network.link_state(&iface).await {
                        Ok(state) => updated.status.state_before_passthrough = Some(state),
                        Err(e) => debug!(interface = %iface, error = %e, "Cannot read link state"),
                    }
                }
            }

            if let Some(driver) = &current {
                // Some drivers release lazily; the bind below decides
                if let Err(e) = self.binder.unbind(&address, driver) {
                    warn!(driver = %driver, error = %e, "Unbind failed, attempting bind anyway");
                }
            }

            if let Err(e) = self.binder.bind_passthrough(
                &address,
                &device.status.vendor_id,
                &device.status.device_id,
            ) {
                error!(error = %e, "Failed to bind device to passthrough driver");
                record_claim_transition("enable", false);
                self.registry.mark_unhealthy(&address).await;

                updated.status.passthrough_enabled = false;
                match self.store.update_claim_status(&updated).await {
                    Ok(_) => {}
                    // Someone else wrote the claim; the resync picks it up again
                    Err(persist) if persist.is_conflict() => {
                        debug!(error = %persist, "Claim changed while enabling")
                    }
                    Err(persist) => warn!(error = %persist, "Failed to persist claim status"),
                }
                return Err(e);
            }
        }

        self.register_healthy(&device).await?;

        updated.status.passthrough_enabled = true;
        let stored = self.store.update_claim_status(&updated).await?;

        record_claim_transition("enable", true);
        info!(
            to = %stored.phase(),
            driver = ?stored.status.kernel_driver_to_unbind,
            "Passthrough enabled"
        );
        Ok(stored)
    }

    /// Release the claimed device and drop the claim record.
    ///
    /// If unbinding fails the claim keeps `passthroughEnabled` and stays in
    /// the registry so the next attempt can retry. Restoring the original
    /// driver and link state is best effort.
    #[instrument(skip(self, claim), fields(claim = %claim.name, address = %claim.spec.address))]
    pub async fn disable_passthrough(&self, claim: PciDeviceClaim) -> Result<()> {
        info!(from = %claim.phase(), to = "deleted", "Claim transition");

        let device = match self.resolve_device(&claim).await {
            Ok(device) => Some(device),
            Err(PciDevError::MissingOwner { .. }) => {
                warn!("Owning device record is gone, releasing by address");
                None
            }
            Err(e) => return Err(e),
        };
        let address = device
            .as_ref()
            .map(|d| d.status.address.clone())
            .unwrap_or_else(|| claim.spec.address.clone());
        let passthrough = self.binder.passthrough_driver().to_string();

        if self.binder.is_passthrough_bound(&address) {
            if let Err(e) = self.binder.unbind(&address, &passthrough) {
                error!(error = %e, "Failed to unbind device from passthrough driver");
                record_claim_transition("disable", false);
                return Err(e);
            }
        }

        match &device {
            Some(device) => {
                match self.registry.remove(&device.status.resource_name, &address).await {
                    Ok(()) => {}
                    Err(
                        e @ (PciDevError::ResourceClassNotFound { .. }
                        | PciDevError::DeviceNotRegistered { .. }),
                    ) => debug!(error = %e, "Device was not offered for allocation"),
                    Err(e) => return Err(e),
                }
            }
            None => {
                self.registry.mark_unhealthy(&address).await;
            }
        }

        if let Some(driver) = claim.status.kernel_driver_to_unbind.as_deref() {
            if driver != passthrough {
                match self.binder.bind(&address, driver) {
                    Ok(()) => info!(driver = %driver, "Original driver restored"),
                    Err(e) => {
                        warn!(driver = %driver, error = %e, "Failed to restore original driver")
                    }
                }
            }
        }

        if claim.status.state_before_passthrough.as_deref() == Some("up") {
            match self.network.interface_for_address(&address).await {
                Some(iface) => {
                    if let Err(e) = self.network.set_link_up(&iface).await {
                        warn!(interface = %iface, error = %e, "Failed to restore link state");
                    }
                }
                None => debug!("No interface after rebind, link state not restored"),
            }
        }

        match self.store.finalize_claim_deletion(&claim.name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        record_claim_transition("disable", true);
        info!("Passthrough disabled");
        Ok(())
    }

    /// React to a claim being created or changed.
    #[instrument(skip(self))]
    pub async fn handle_change(&self, name: &str) -> Result<()> {
        let claim = match self.store.get_claim(name).await {
            Ok(claim) => claim,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        if !claim.targets(&self.node_name) {
            debug!(node = %claim.spec.node_name, "Claim belongs to another node");
            return Ok(());
        }
        if claim.deletion_requested {
            return self.disable_passthrough(claim).await;
        }
        if claim.status.passthrough_enabled {
            return Ok(());
        }

        self.enable_passthrough(claim).await.map(|_| ())
    }

    /// React to deletion being requested for a claim.
    #[instrument(skip(self))]
    pub async fn handle_remove(&self, name: &str) -> Result<()> {
        let claim = match self.store.get_claim(name).await {
            Ok(claim) => claim,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        if !claim.deletion_requested || !claim.targets(&self.node_name) {
            return Ok(());
        }

        self.disable_passthrough(claim).await
    }

    /// Replay enable for claims whose device lost its binding, e.g. after a reboot.
    ///
    /// Every claim on this node is attempted; failures are collected into a
    /// single `Recovery` error.
    #[instrument(skip(self), fields(node = %self.node_name))]
    pub async fn recover_after_reboot(&self) -> Result<RecoveryReport> {
        info!("Rebinding claimed devices after reboot");
        let claims = self.store.list_claims().await?;

        let mut report = RecoveryReport::default();
        let mut failures = Vec::new();

        for mut claim in claims
            .into_iter()
            .filter(|c| c.targets(&self.node_name) && !c.deletion_requested)
        {
            let device = match self.resolve_device(&claim).await {
                Ok(device) => device,
                Err(e) => {
                    warn!(claim = %claim.name, error = %e, "Cannot resolve claim's device");
                    failures.push(format!("{}: {}", claim.name, e));
                    continue;
                }
            };

            if self.binder.is_passthrough_bound(&device.status.address) {
                info!(device = %device.name, "Device still bound to passthrough driver");
                let result = async {
                    self.register_healthy(&device).await?;
                    if !claim.status.passthrough_enabled {
                        claim.status.passthrough_enabled = true;
                        self.store.update_claim_status(&claim).await?;
                    }
                    Ok::<_, PciDevError>(())
                }
                .await;

                match result {
                    Ok(()) => report.already_bound += 1,
                    Err(e) => failures.push(format!("{}: {}", claim.name, e)),
                }
                continue;
            }

            let name = claim.name.clone();
            match self.enable_passthrough(claim).await {
                Ok(_) => {
                    record_claim_transition("recover", true);
                    report.rebound += 1;
                }
                Err(e) => {
                    record_claim_transition("recover", false);
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }

        info!(
            rebound = report.rebound,
            already_bound = report.already_bound,
            failed = failures.len(),
            "Reboot recovery finished"
        );
        if failures.is_empty() {
            Ok(report)
        } else {
            Err(PciDevError::Recovery { failures })
        }
    }

    /// Unbind devices held by the passthrough driver that no claim owns.
    ///
    /// Unbind failures are logged and skipped. Returns how many devices were released.
    #[instrument(skip(self), fields(node = %self.node_name))]
    pub async fn cleanup_orphans(&self) -> Result<usize> {
        let devices = self.store.list_devices(&LabelSelector::node(&self.node_name)).await?;
        let claims = self.store.list_claims().await?;

        let orphans = find_orphans(
            &self.node_name,
            self.binder.passthrough_driver(),
            &devices,
            &claims,
            |address| self.binder.is_passthrough_bound(address),
        );

        let mut released = 0;
        for device in orphans {
            info!(
                device = %device.name,
                address = %device.status.address,
                "Found orphaned passthrough device"
            );
            match self.binder.unbind(&device.status.address, self.binder.passthrough_driver()) {
                Ok(()) => released += 1,
                Err(e) => {
                    warn!(device = %device.name, error = %e, "Failed to unbind orphaned device")
                }
            }
        }

        if released > 0 {
            info!("Released {} orphaned passthrough devices", released);
        }
        record_orphans_unbound(released);
        Ok(released)
    }

    /// One-time startup sequence: load modules, recover bindings, release orphans.
    ///
    /// Nothing here is fatal; failures are logged and left to the resync.
    pub async fn startup(&self) {
        if let Some(health) = &self.health {
            health.register_subsystem(CLAIMS_SUBSYSTEM).await;
        }

        let binder = self.binder.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || binder.load_modules()).await {
            error!(error = %e, "Module loading task failed");
        }

        match self.recover_after_reboot().await {
            Ok(report) => debug!(?report, "Recovery complete"),
            Err(e) => {
                error!(error = %e, "Reboot recovery incomplete");
                self.set_health(HealthStatus::Degraded, Some(e.to_string())).await;
            }
        }

        if let Err(e) = self.cleanup_orphans().await {
            warn!(error = %e, "Orphan cleanup failed");
        }
    }

    /// Re-evaluate every claim on this node.
    async fn resync(&self) {
        let claims = match self.store.list_claims().await {
            Ok(claims) => claims,
            Err(e) => {
                error!(error = %e, "Failed to list claims for resync");
                self.set_health(HealthStatus::Degraded, Some(e.to_string())).await;
                return;
            }
        };

        let mut failed = 0;
        for claim in claims.iter().filter(|c| c.targets(&self.node_name)) {
            let pending = claim.deletion_requested || !claim.status.passthrough_enabled;
            if !pending {
                continue;
            }
            if let Err(e) = self.handle_change(&claim.name).await {
                warn!(claim = %claim.name, error = %e, "Claim resync failed");
                failed += 1;
            }
        }

        if failed == 0 {
            self.set_health(HealthStatus::Healthy, None).await;
        } else {
            self.set_health(HealthStatus::Degraded, Some(format!("{} claim(s) pending", failed)))
                .await;
        }
    }

    async fn dispatch(&self, event: ClaimEvent) {
        let result = match &event {
            ClaimEvent::Changed(claim) => self.handle_change(&claim.name).await,
            ClaimEvent::Removing(claim) => self.handle_remove(&claim.name).await,
            ClaimEvent::Resync => {
                self.resync().await;
                Ok(())
            }
        };

        if let Err(e) = result {
            // Retried by the next resync
            warn!(
                event = event.kind(),
                claim = ?event.claim_name(),
                error = %e,
                "Claim handler failed"
            );
        }
    }

    /// Handle claim events until shutdown.
    ///
    /// Waits for `ready` (the startup sequence) before handling anything.
    /// Events arriving meanwhile are buffered.
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut ready: watch::Receiver<bool>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut events = self.store.subscribe_claims();

        tokio::select! {
            started = async { ready.wait_for(|done| *done).await.map(|_| ()) } => {
                if started.is_err() {
                    return Err(PciDevError::Internal(
                        "claim startup sequence did not complete".into(),
                    ));
                }
            }
            _ = shutdown.recv() => return Ok(()),
        }

        info!(node = %self.node_name, "Claim controller started");
        self.resync().await;

        let mut ticker = tokio::time::interval(self.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => return Err(PciDevError::Internal("claim event bus closed".into())),
                },
                _ = ticker.tick() => self.resync().await,
                _ = shutdown.recv() => {
                    info!("Claim controller stopped");
                    return Ok(());
                }
            }
        }
    }

    async fn set_health(&self, status: HealthStatus, message: Option<String>) {
        if let Some(health) = &self.health {
            health.update_subsystem(CLAIMS_SUBSYSTEM, status, message).await;
        }
    }
}

/// Devices on `node_name` bound to the passthrough driver that no claim owns.
///
/// A device counts as bound when its record says so or `is_bound` reports it.
pub fn find_orphans<'a>(
    node_name: &str,
    passthrough_driver: &str,
    devices: &'a [PciDevice],
    claims: &[PciDeviceClaim],
    is_bound: impl Fn(&str) -> bool,
) -> Vec<&'a PciDevice> {
    devices
        .iter()
        .filter(|d| d.status.node_name == node_name)
        .filter(|d| d.driver_is(passthrough_driver) || is_bound(&d.status.address))
        .filter(|d| !claims.iter().any(|c| c.is_owned_by(&d.name)))
        .collect()
}
