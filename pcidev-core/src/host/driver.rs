//! Kernel driver binding for PCI passthrough.
//!
//! Binding and unbinding are single writes to driver control files:
//!
//! - `drivers/<driver>/unbind` takes a PCI address
//! - `drivers/<passthrough>/new_id` takes a `"<vendor> <device>"` pair and
//!   makes the passthrough driver claim every unbound function with that id
//! - `drivers/<driver>/bind` takes a PCI address
//!
//! A device is bound to a driver when `drivers/<driver>/<address>` exists.
//! Each function is bound on its own; keeping IOMMU groups consistent is up
//! to the caller.

use crate::error::{PciDevError, Result};
use crate::host::{read_link_name, HostPaths};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Binds PCI functions to and from kernel drivers.
#[derive(Debug, Clone)]
pub struct DriverBinder {
    paths: HostPaths,
    passthrough_driver: String,
    modules: Vec<String>,
}

impl DriverBinder {
    /// Create a binder for `passthrough_driver`, loading `modules` on startup.
    pub fn new(
        paths: HostPaths,
        passthrough_driver: impl Into<String>,
        modules: Vec<String>,
    ) -> Self {
        Self { paths, passthrough_driver: passthrough_driver.into(), modules }
    }

    /// Binder for the default `vfio-pci` setup.
    pub fn vfio(paths: HostPaths) -> Self {
        Self::new(
            paths,
            "vfio-pci",
            vec!["vfio-pci".to_string(), "vfio_iommu_type1".to_string()],
        )
    }

    pub fn passthrough_driver(&self) -> &str {
        &self.passthrough_driver
    }

    /// Check whether `address` is bound to `driver`.
    pub fn is_bound(&self, address: &str, driver: &str) -> bool {
        self.paths.driver_dir(driver).join(address).exists()
    }

    /// Check whether `address` is bound to the passthrough driver.
    pub fn is_passthrough_bound(&self, address: &str) -> bool {
        self.is_bound(address, &self.passthrough_driver)
    }

    /// Driver the host currently has bound to `address`.
    pub fn current_driver(&self, address: &str) -> Option<String> {
        read_link_name(&self.paths.pci_devices().join(address).join("driver"))
    }

    /// Unbind `address` from `driver`.
    ///
    /// Succeeds without writing anything when the device is not bound to
    /// `driver`.
    pub fn unbind(&self, address: &str, driver: &str) -> Result<()> {
        if !self.is_bound(address, driver) {
            debug!(address = %address, driver = %driver, "Device not bound to driver");
            return Ok(());
        }

        let unbind_path = self.paths.driver_dir(driver).join("unbind");
        debug!(address = %address, driver = %driver, "Unbinding from driver");
        write_control_file(&unbind_path, address)?;

        info!(address = %address, driver = %driver, "Device unbound");
        Ok(())
    }

    /// Bind a device to the passthrough driver by registering its id pair.
    ///
    /// An id pair the driver already knows is not an error. If registering
    /// did not make the driver pick the device up, the address is written
    /// to the driver's `bind` file as well.
    pub fn bind_passthrough(&self, address: &str, vendor_id: &str, device_id: &str) -> Result<()> {
        let driver_dir = self.paths.driver_dir(&self.passthrough_driver);
        let new_id_path = driver_dir.join("new_id");
        let id_string = format!("{} {}", vendor_id, device_id);

        info!(
            address = %address,
            id = %id_string,
            driver = %self.passthrough_driver,
            "Binding device"
        );

        match write_control_file(&new_id_path, &id_string) {
            Ok(()) => {}
            Err(PciDevError::HostIo { source, .. })
                if source.kind() == std::io::ErrorKind::AlreadyExists =>
            {
                debug!(id = %id_string, "Device ID already registered");
            }
            Err(e) => {
                error!(path = %new_id_path.display(), error = %e, "Error writing new_id");
                return Err(e);
            }
        }

        if self.is_passthrough_bound(address) {
            return Ok(());
        }

        match write_control_file(&driver_dir.join("bind"), address) {
            Ok(()) => Ok(()),
            Err(_) if self.is_passthrough_bound(address) => {
                debug!(address = %address, "Device auto-bound after new_id");
                Ok(())
            }
            Err(e) => Err(PciDevError::DriverBind {
                address: address.to_string(),
                driver: self.passthrough_driver.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Bind `address` to `driver` through its `bind` file.
    ///
    /// Used to hand a device back to its original driver.
    pub fn bind(&self, address: &str, driver: &str) -> Result<()> {
        if self.is_bound(address, driver) {
            return Ok(());
        }
        let bind_path = self.paths.driver_dir(driver).join("bind");
        write_control_file(&bind_path, address).map_err(|e| PciDevError::DriverBind {
            address: address.to_string(),
            driver: driver.to_string(),
            reason: e.to_string(),
        })
    }

    /// Load the passthrough kernel modules.
    ///
    /// Failures are logged; the modules may already be resident.
    pub fn load_modules(&self) {
        for module in &self.modules {
            info!(module = %module, "Loading driver");
            match std::process::Command::new("modprobe").arg(module).status() {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    warn!(module = %module, %status, "modprobe returned non-zero")
                }
                Err(e) => error!(module = %module, error = %e, "Failed to run modprobe"),
            }
        }

        if !self.paths.driver_dir(&self.passthrough_driver).exists() {
            warn!(
                driver = %self.passthrough_driver,
                "Passthrough driver not available after module load"
            );
        }
    }
}

/// Write `value` to an existing control file.
///
/// Control files are never created; a missing file is an error.
fn write_control_file(path: &Path, value: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| PciDevError::host_io(path, e))?;
    file.write_all(value.as_bytes()).map_err(|e| PciDevError::host_io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn setup_driver(root: &Path, driver: &str, files: &[&str]) {
        let dir = root.join("bus/pci/drivers").join(driver);
        fs::create_dir_all(&dir).unwrap();
        for file in files {
            fs::write(dir.join(file), "").unwrap();
        }
    }

    #[test]
    fn test_unbind_not_bound_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        setup_driver(tmp.path(), "nvidia", &["unbind"]);
        let binder = DriverBinder::vfio(HostPaths::new(tmp.path()));

        binder.unbind("0000:01:00.0", "nvidia").unwrap();
        let written = fs::read_to_string(tmp.path().join("bus/pci/drivers/nvidia/unbind")).unwrap();
        assert!(written.is_empty());

        // driver directory missing entirely is also a no-op
        binder.unbind("0000:01:00.0", "ixgbe").unwrap();
    }

    #[test]
    fn test_unbind_writes_address() {
        let tmp = tempfile::tempdir().unwrap();
        setup_driver(tmp.path(), "nvidia", &["unbind"]);
        fs::create_dir_all(tmp.path().join("bus/pci/drivers/nvidia/0000:01:00.0")).unwrap();
        let binder = DriverBinder::vfio(HostPaths::new(tmp.path()));

        assert!(binder.is_bound("0000:01:00.0", "nvidia"));
        binder.unbind("0000:01:00.0", "nvidia").unwrap();
        let written = fs::read_to_string(tmp.path().join("bus/pci/drivers/nvidia/unbind")).unwrap();
        assert_eq!(written, "0000:01:00.0");
    }

    #[test]
    fn test_unbind_missing_control_file_errors() {
        let tmp = tempfile::tempdir().unwrap();
        setup_driver(tmp.path(), "nvidia", &[]);
        fs::create_dir_all(tmp.path().join("bus/pci/drivers/nvidia/0000:01:00.0")).unwrap();
        let binder = DriverBinder::vfio(HostPaths::new(tmp.path()));

        let err = binder.unbind("0000:01:00.0", "nvidia").unwrap_err();
        assert!(matches!(err, PciDevError::HostIo { .. }));
    }

    #[test]
    fn test_bind_passthrough_writes_id_pair() {
        let tmp = tempfile::tempdir().unwrap();
        setup_driver(tmp.path(), "vfio-pci", &["new_id", "bind"]);
        let binder = DriverBinder::vfio(HostPaths::new(tmp.path()));

        binder.bind_passthrough("0000:01:00.0", "10de", "2204").unwrap();
        let drivers = tmp.path().join("bus/pci/drivers/vfio-pci");
        assert_eq!(fs::read_to_string(drivers.join("new_id")).unwrap(), "10de 2204");
        assert_eq!(fs::read_to_string(drivers.join("bind")).unwrap(), "0000:01:00.0");
    }

    #[test]
    fn test_bind_passthrough_skips_bind_when_picked_up() {
        let tmp = tempfile::tempdir().unwrap();
        setup_driver(tmp.path(), "vfio-pci", &["new_id", "bind"]);
        fs::create_dir_all(tmp.path().join("bus/pci/drivers/vfio-pci/0000:01:00.0")).unwrap();
        let binder = DriverBinder::vfio(HostPaths::new(tmp.path()));

        binder.bind_passthrough("0000:01:00.0", "10de", "2204").unwrap();
        let bind = fs::read_to_string(tmp.path().join("bus/pci/drivers/vfio-pci/bind")).unwrap();
        assert!(bind.is_empty());
    }

    #[test]
    fn test_bind_passthrough_without_driver_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let binder = DriverBinder::vfio(HostPaths::new(tmp.path()));
        let err = binder.bind_passthrough("0000:01:00.0", "10de", "2204").unwrap_err();
        assert!(matches!(err, PciDevError::HostIo { .. }));
    }

    #[test]
    fn test_current_driver_reads_link() {
        let tmp = tempfile::tempdir().unwrap();
        let dev = tmp.path().join("bus/pci/devices/0000:01:00.0");
        fs::create_dir_all(&dev).unwrap();
        let binder = DriverBinder::vfio(HostPaths::new(tmp.path()));
        assert_eq!(binder.current_driver("0000:01:00.0"), None);

        std::os::unix::fs::symlink("../../../bus/pci/drivers/nvidia", dev.join("driver")).unwrap();
        assert_eq!(binder.current_driver("0000:01:00.0").as_deref(), Some("nvidia"));
    }

    #[test]
    fn test_bind_restores_original_driver() {
        let tmp = tempfile::tempdir().unwrap();
        setup_driver(tmp.path(), "ixgbe", &["bind"]);
        let binder = DriverBinder::vfio(HostPaths::new(tmp.path()));

        binder.bind("0000:02:00.0", "ixgbe").unwrap();
        let bind = fs::read_to_string(tmp.path().join("bus/pci/drivers/ixgbe/bind")).unwrap();
        assert_eq!(bind, "0000:02:00.0");

        assert!(matches!(
            binder.bind("0000:02:00.0", "missing"),
            Err(PciDevError::DriverBind { .. })
        ));
    }
}
