//! Shared fixtures: a fake sysfs tree and a wired-up controller stack.

#![allow(dead_code)]

use async_trait::async_trait;
use pcidev_core::host::{DriverBinder, HostPaths, NetworkTopology, SysfsNetwork, SysfsPciBus};
use pcidev_core::{
    AllocationRegistry, ClaimController, ClaimStore, InventoryReconciler, PciDeviceClaim, Result,
    SqliteStore,
};
use std::fs;
use std::future::Future;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const NODE: &str = "node1";
pub const GPU: &str = "0000:01:00.0";
pub const GPU_RECORD: &str = "node1-000001000";
pub const GPU_CLASS: &str = "nvidia.com/10de-2204";

/// A sysfs tree in a temporary directory.
///
/// Writes to control files are recorded in the files; the kernel side
/// (actually moving a device between drivers) is simulated with [`FakeHost::bind`].
pub struct FakeHost {
    dir: TempDir,
}

impl FakeHost {
    pub fn new() -> Self {
        Self { dir: tempfile::tempdir().unwrap() }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> HostPaths {
        HostPaths::new(self.root())
    }

    fn drivers(&self) -> PathBuf {
        self.root().join("bus/pci/drivers")
    }

    /// Create a driver directory with empty control files.
    pub fn add_driver(&self, driver: &str) {
        let dir = self.drivers().join(driver);
        fs::create_dir_all(&dir).unwrap();
        for file in ["bind", "unbind", "new_id"] {
            let path = dir.join(file);
            if !path.exists() {
                fs::write(path, "").unwrap();
            }
        }
    }

    /// Add a PCI function; `class` is the raw 6-digit class code.
    pub fn add_function(
        &self,
        address: &str,
        vendor: &str,
        device: &str,
        class: &str,
        driver: Option<&str>,
    ) {
        let dir = self.root().join("bus/pci/devices").join(address);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("0x{}\n", vendor)).unwrap();
        fs::write(dir.join("device"), format!("0x{}\n", device)).unwrap();
        fs::write(dir.join("class"), format!("0x{}\n", class)).unwrap();
        if let Some(driver) = driver {
            self.bind(address, driver);
        }
    }

    /// Simulate the kernel binding `address` to `driver`.
    pub fn bind(&self, address: &str, driver: &str) {
        self.release(address);
        self.add_driver(driver);
        fs::create_dir_all(self.drivers().join(driver).join(address)).unwrap();
        symlink(
            format!("../../../bus/pci/drivers/{}", driver),
            self.root().join("bus/pci/devices").join(address).join("driver"),
        )
        .unwrap();
    }

    /// Simulate the kernel detaching `address` from whatever driver holds it.
    pub fn release(&self, address: &str) {
        let link = self.root().join("bus/pci/devices").join(address).join("driver");
        let _ = fs::remove_file(link);
        if let Ok(drivers) = fs::read_dir(self.drivers()) {
            for driver in drivers.flatten() {
                let _ = fs::remove_dir(driver.path().join(address));
            }
        }
    }

    /// Contents of a driver control file ("" if never written).
    pub fn control(&self, driver: &str, file: &str) -> String {
        fs::read_to_string(self.drivers().join(driver).join(file)).unwrap_or_default()
    }

    pub fn add_iommu(&self, group: u32, address: &str) {
        let dir = self.root().join("kernel/iommu_groups").join(group.to_string()).join("devices");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(address), "").unwrap();
    }

    pub fn add_nic(&self, iface: &str, address: Option<&str>, master: Option<&str>, state: &str) {
        let dir = self.root().join("class/net").join(iface);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("operstate"), format!("{}\n", state)).unwrap();
        if let Some(address) = address {
            symlink(format!("../../../bus/pci/devices/{}", address), dir.join("device")).unwrap();
        }
        if let Some(master) = master {
            symlink(format!("../{}", master), dir.join("master")).unwrap();
        }
    }

    /// A node with one NVIDIA GPU on the `nvidia` driver and an empty passthrough driver.
    pub fn with_gpu() -> Self {
        let host = Self::new();
        host.add_function(GPU, "10de", "2204", "030000", Some("nvidia"));
        host.add_iommu(27, GPU);
        host.add_driver("vfio-pci");
        host
    }
}

/// `SysfsNetwork` that records link changes instead of running `ip`.
pub struct RecordingNetwork {
    inner: SysfsNetwork,
    pub links_up: Mutex<Vec<String>>,
}

#[async_trait]
impl NetworkTopology for RecordingNetwork {
    async fn management_nic_addresses(&self, node_name: &str) -> Result<Vec<String>> {
        self.inner.management_nic_addresses(node_name).await
    }

    async fn interface_for_address(&self, address: &str) -> Option<String> {
        self.inner.interface_for_address(address).await
    }

    async fn link_state(&self, interface: &str) -> Result<String> {
        self.inner.link_state(interface).await
    }

    async fn set_link_up(&self, interface: &str) -> Result<()> {
        self.links_up.lock().unwrap().push(interface.to_string());
        Ok(())
    }
}

/// Store, registry, reconciler and controller over one fake host.
pub struct Harness {
    pub host: FakeHost,
    pub store: Arc<SqliteStore>,
    pub registry: Arc<AllocationRegistry>,
    pub network: Arc<RecordingNetwork>,
    pub reconciler: InventoryReconciler,
    pub controller: Arc<ClaimController>,
}

impl Harness {
    pub async fn new(host: FakeHost) -> Self {
        let paths = host.paths();
        let store = Arc::new(SqliteStore::new_in_memory().await.unwrap());
        let registry = Arc::new(AllocationRegistry::new(16));
        let network = Arc::new(RecordingNetwork {
            inner: SysfsNetwork::new(
                paths.clone(),
                vec!["mgmt-br".to_string(), "mgmt-bo".to_string()],
                Vec::new(),
            ),
            links_up: Mutex::new(Vec::new()),
        });

        let reconciler = InventoryReconciler::new(
            NODE,
            paths.clone(),
            Arc::new(SysfsPciBus::new(paths.clone())),
            network.clone(),
            store.clone(),
            Duration::from_secs(20),
        );
        let controller = Arc::new(ClaimController::new(
            NODE,
            store.clone(),
            DriverBinder::vfio(paths),
            network.clone(),
            registry.clone(),
            Duration::from_secs(60),
        ));

        Self { host, store, registry, network, reconciler, controller }
    }

    /// Harness with the inventory already reconciled once.
    pub async fn reconciled(host: FakeHost) -> Self {
        let harness = Self::new(host).await;
        harness.reconciler.reconcile_once().await.unwrap();
        harness
    }

    pub async fn create_claim(&self, name: &str, owner: &str, address: &str) -> PciDeviceClaim {
        self.store
            .create_claim(&PciDeviceClaim::new(name, owner, address, NODE, "admin"))
            .await
            .unwrap()
    }

    pub async fn claim(&self, name: &str) -> PciDeviceClaim {
        self.store.get_claim(name).await.unwrap()
    }
}

/// Poll `check` until it returns true or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
