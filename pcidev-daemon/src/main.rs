use pcidev_core::host::{iommu, DriverBinder, HostPaths, SysfsNetwork, SysfsPciBus};
use pcidev_core::observability::health::{HealthStatus, STORE_SUBSYSTEM};
use pcidev_core::{
    init_observability, shutdown_observability, AllocationRegistry, ClaimController, Config,
    HealthChecker, InventoryReconciler, SqliteStore,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod shutdown;
mod supervisor;

use supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    config.validate()?;

    // Initialize observability FIRST
    init_observability(&config)?;

    info!(node = %config.node_name, "PCI device agent starting");

    // The store is the only dependency the agent cannot start without
    let store = match SqliteStore::new(&config.db_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open record store: {}", e);
            shutdown_observability();
            return Err(e.into());
        }
    };

    let health_checker = HealthChecker::new();
    health_checker.register_subsystem(STORE_SUBSYSTEM).await;

    let paths = HostPaths::new(&config.sysfs_root);
    if !iommu::is_iommu_enabled(&paths) {
        warn!("IOMMU is not enabled on this host, devices will have unknown groups");
    }

    let network = Arc::new(SysfsNetwork::new(
        paths.clone(),
        config.management_interfaces.clone(),
        config.uplinks.clone(),
    ));
    let registry = Arc::new(AllocationRegistry::new(config.health_channel_capacity));

    let reconciler = Arc::new(
        InventoryReconciler::new(
            &config.node_name,
            paths.clone(),
            Arc::new(SysfsPciBus::new(paths.clone())),
            network.clone(),
            store.clone(),
            config.inventory_interval(),
        )
        .with_health(health_checker.clone()),
    );

    let controller = Arc::new(
        ClaimController::new(
            &config.node_name,
            store.clone(),
            DriverBinder::new(
                paths,
                config.passthrough_driver.clone(),
                config.passthrough_modules.clone(),
            ),
            network,
            registry,
            config.claim_resync_interval(),
        )
        .with_health(health_checker.clone()),
    );

    let shutdown_tx = shutdown::shutdown_signal();
    let (ready_tx, ready_rx) = watch::channel(false);
    let mut supervisor = Supervisor::new(shutdown_tx.clone());

    supervisor.spawn("inventory", reconciler.run(shutdown_tx.subscribe()));

    let startup = controller.clone();
    supervisor.spawn("claim-startup", async move {
        startup.startup().await;
        let _ = ready_tx.send(true);
        Ok(())
    });

    supervisor.spawn("claim-events", controller.run_event_loop(ready_rx, shutdown_tx.subscribe()));

    info!("PCI device agent ready");
    let result = supervisor.wait().await;

    let health = health_checker.get_health().await;
    for subsystem in health.subsystems.iter().filter(|s| s.status != HealthStatus::Healthy) {
        warn!(
            subsystem = %subsystem.name,
            status = ?subsystem.status,
            message = ?subsystem.message,
            "Subsystem unhealthy at shutdown"
        );
    }
    info!(status = ?health.status, "PCI device agent shutting down");
    shutdown_observability();
    result.map_err(Into::into)
}
