//! Device inventory reconciliation.
//!
//! Every cycle scans the host PCI bus, drops the functions that must never
//! be offered for passthrough (management NICs and PCI bridges), makes sure
//! each remaining function has an up to date device record, and deletes the
//! records of this node whose address was not seen.

use crate::error::{PciDevError, Result};
use crate::host::{IommuGroupIndex, HostPaths, NetworkTopology, PciBus};
use crate::observability::health::{HealthChecker, HealthStatus, INVENTORY_SUBSYSTEM};
use crate::store::{DeviceStore, LabelSelector};
use crate::types::PciDevice;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one reconciliation cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Functions reported by the host bus
    pub discovered: usize,
    /// Functions left out (management NICs, bridges)
    pub excluded: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub pruned: usize,
    /// Devices whose record could not be written this cycle
    pub failed: usize,
}

/// Keeps this node's device records in line with the host PCI bus.
pub struct InventoryReconciler {
    node_name: String,
    paths: HostPaths,
    bus: Arc<dyn PciBus>,
    network: Arc<dyn NetworkTopology>,
    store: Arc<dyn DeviceStore>,
    interval: Duration,
    health: Option<HealthChecker>,
}

impl InventoryReconciler {
    pub fn new(
        node_name: impl Into<String>,
        paths: HostPaths,
        bus: Arc<dyn PciBus>,
        network: Arc<dyn NetworkTopology>,
        store: Arc<dyn DeviceStore>,
        interval: Duration,
    ) -> Self {
        Self { node_name: node_name.into(), paths, bus, network, store, interval, health: None }
    }

    /// Report cycle outcomes to `health`.
    pub fn with_health(mut self, health: HealthChecker) -> Self {
        self.health = Some(health);
        self
    }

    /// Run one reconciliation cycle.
    ///
    /// A failed record lookup aborts the cycle before anything is pruned. A
    /// failed create, update or delete only skips that device; the first
    /// such error is returned once the cycle has finished.
    #[instrument(skip(self), fields(node = %self.node_name))]
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let functions = self.bus.functions()?;
        let mut report = ReconcileReport { discovered: functions.len(), ..Default::default() };

        let mut excluded: HashSet<String> =
            self.network.management_nic_addresses(&self.node_name).await?.into_iter().collect();
        excluded.extend(functions.iter().filter(|f| f.is_bridge()).map(|f| f.address.clone()));

        let groups = IommuGroupIndex::scan(&self.paths);
        debug!(groups = groups.len(), excluded = excluded.len(), "Host scan complete");

        let mut seen = HashSet::new();
        let mut first_error: Option<PciDevError> = None;

        for function in &functions {
            if excluded.contains(&function.address) {
                report.excluded += 1;
                continue;
            }
            seen.insert(function.address.clone());

            let group = groups.group_of(&function.address);
            let desired = PciDevice::for_node(function, &self.node_name, group);

            match self.store.get_device(&desired.name).await {
                Ok(mut existing) => {
                    let before = existing.status.clone();
                    existing.status.refresh(function, &self.node_name, group);
                    if existing.status == before {
                        report.unchanged += 1;
                        continue;
                    }
                    match self.store.update_device_status(&existing).await {
                        Ok(_) => report.updated += 1,
                        Err(e) => {
                            warn!(
                                device = %existing.name,
                                error = %e,
                                "Failed to update device status"
                            );
                            report.failed += 1;
                            first_error.get_or_insert(e);
                        }
                    }
                }
                Err(e) if e.is_not_found() => match self.store.create_device(&desired).await {
                    Ok(_) => {
                        info!(
                            device = %desired.name,
                            address = %function.address,
                            "Device record created"
                        );
                        report.created += 1;
                    }
                    Err(e) => {
                        warn!(device = %desired.name, error = %e, "Failed to create device record");
                        report.failed += 1;
                        first_error.get_or_insert(e);
                    }
                },
                Err(e) => {
                    error!(device = %desired.name, error = %e, "Device lookup failed");
                    return Err(e);
                }
            }
        }

        let recorded = self.store.list_devices(&LabelSelector::node(&self.node_name)).await?;
        for device in recorded.iter().filter(|d| !seen.contains(&d.status.address)) {
            match self.store.delete_device(&device.name).await {
                Ok(()) => {
                    info!(
                        device = %device.name,
                        address = %device.status.address,
                        "Device record pruned"
                    );
                    report.pruned += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(device = %device.name, error = %e, "Failed to prune device record");
                    report.failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        debug!(?report, "Reconciliation cycle finished");
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Reconcile on every tick until shutdown.
    ///
    /// Cycle failures are logged and retried on the next tick.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!(node = %self.node_name, interval = ?self.interval, "Starting inventory reconciler");

        if let Some(health) = &self.health {
            health.register_subsystem(INVENTORY_SUBSYSTEM).await;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_cycle().await,
                _ = shutdown.recv() => {
                    info!("Inventory reconciler stopped");
                    return Ok(());
                }
            }
        }
    }

    async fn run_cycle(&self) {
        let start = Instant::now();
        let result = self.reconcile_once().await;

        metrics::counter!("pcidev_inventory_reconcile_total").increment(1);
        metrics::histogram!("pcidev_inventory_reconcile_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(report) => {
                metrics::gauge!("pcidev_devices_discovered").set(report.discovered as f64);
                metrics::counter!("pcidev_devices_pruned_total").increment(report.pruned as u64);
                if report.created + report.pruned > 0 {
                    info!(
                        created = report.created,
                        updated = report.updated,
                        pruned = report.pruned,
                        "Inventory changed"
                    );
                }
                self.set_health(HealthStatus::Healthy, None).await;
            }
            Err(e) => {
                metrics::counter!("pcidev_inventory_reconcile_failures_total").increment(1);
                error!(error = %e, "Inventory reconciliation failed");
                self.set_health(HealthStatus::Degraded, Some(e.to_string())).await;
            }
        }
    }

    async fn set_health(&self, status: HealthStatus, message: Option<String>) {
        if let Some(health) = &self.health {
            health.update_subsystem(INVENTORY_SUBSYSTEM, status, message).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::{PciFunction, NODE_LABEL};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StaticBus {
        functions: Mutex<Vec<PciFunction>>,
    }

    impl PciBus for StaticBus {
        fn functions(&self) -> Result<Vec<PciFunction>> {
            Ok(self.functions.lock().unwrap().clone())
        }
    }

    struct StaticNetwork {
        management: Vec<String>,
        fail: bool,
    }

    #[async_trait]
    impl NetworkTopology for StaticNetwork {
        async fn management_nic_addresses(&self, _node_name: &str) -> Result<Vec<String>> {
            if self.fail {
                return Err(PciDevError::Internal("network query failed".into()));
            }
            Ok(self.management.clone())
        }

        async fn interface_for_address(&self, _address: &str) -> Option<String> {
            None
        }

        async fn link_state(&self, _interface: &str) -> Result<String> {
            Ok("up".into())
        }

        async fn set_link_up(&self, _interface: &str) -> Result<()> {
            Ok(())
        }
    }

    fn function(address: &str, class: &str, subclass: &str, driver: Option<&str>) -> PciFunction {
        PciFunction {
            address: address.into(),
            vendor_id: "10de".into(),
            device_id: "2204".into(),
            class_id: class.into(),
            subclass_id: subclass.into(),
            driver: driver.map(String::from),
        }
    }

    fn scan() -> Vec<PciFunction> {
        vec![
            function("0000:00:1c.0", "06", "04", Some("pcieport")),
            function("0000:02:00.0", "02", "00", Some("ixgbe")),
            function("0000:01:00.0", "03", "00", Some("nvidia")),
        ]
    }

    async fn setup(
        functions: Vec<PciFunction>,
        fail_network: bool,
    ) -> (InventoryReconciler, Arc<StaticBus>, Arc<SqliteStore>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let bus = Arc::new(StaticBus { functions: Mutex::new(functions) });
        let network = Arc::new(StaticNetwork {
            management: vec!["0000:02:00.0".to_string()],
            fail: fail_network,
        });
        let store = Arc::new(SqliteStore::new_in_memory().await.unwrap());
        let reconciler = InventoryReconciler::new(
            "node1",
            HostPaths::new(tmp.path()),
            bus.clone(),
            network,
            store.clone(),
            Duration::from_secs(20),
        );
        (reconciler, bus, store, tmp)
    }

    #[tokio::test]
    async fn test_only_plain_devices_recorded() {
        let (reconciler, _bus, store, _tmp) = setup(scan(), false).await;

        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.discovered, 3);
        assert_eq!(report.excluded, 2);
        assert_eq!(report.created, 1);

        let devices = store.list_devices(&LabelSelector::everything()).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "node1-000001000");
        assert_eq!(devices[0].status.iommu_group, crate::types::UNKNOWN_IOMMU_GROUP);
        assert_eq!(devices[0].labels.get(NODE_LABEL).map(String::as_str), Some("node1"));
    }

    #[tokio::test]
    async fn test_second_cycle_is_unchanged_then_tracks_driver() {
        let (reconciler, bus, store, _tmp) = setup(scan(), false).await;
        reconciler.reconcile_once().await.unwrap();

        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.created, 0);

        bus.functions.lock().unwrap()[2].driver = Some("vfio-pci".into());
        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.updated, 1);
        assert!(store.get_device("node1-000001000").await.unwrap().driver_is("vfio-pci"));
    }

    #[tokio::test]
    async fn test_unplugged_device_pruned() {
        let (reconciler, bus, store, _tmp) = setup(scan(), false).await;
        reconciler.reconcile_once().await.unwrap();

        // Other nodes' records are left alone
        let other = PciDevice::for_node(&function("0000:01:00.0", "03", "00", None), "node2", 3);
        store.create_device(&other).await.unwrap();

        bus.functions.lock().unwrap().pop();
        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.pruned, 1);

        let remaining = store.list_devices(&LabelSelector::everything()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "node2-000001000");
    }

    #[tokio::test]
    async fn test_network_failure_aborts_cycle() {
        let (reconciler, _bus, store, _tmp) = setup(scan(), true).await;
        assert!(reconciler.reconcile_once().await.is_err());
        assert!(store.list_devices(&LabelSelector::everything()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_cycle_degrades_health() {
        let (reconciler, _bus, _store, _tmp) = setup(scan(), true).await;
        let health = HealthChecker::new();
        health.register_subsystem(INVENTORY_SUBSYSTEM).await;
        let reconciler = reconciler.with_health(health.clone());

        reconciler.run_cycle().await;
        assert_eq!(health.get_health().await.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (reconciler, _bus, store, _tmp) = setup(scan(), false).await;
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(Arc::new(reconciler).run(rx));
        // First tick fires immediately
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).unwrap();

        handle.await.unwrap().unwrap();
        assert_eq!(store.list_devices(&LabelSelector::everything()).await.unwrap().len(), 1);
    }
}
