//! Host PCI bus enumeration.
//!
//! Scans `bus/pci/devices` and reports every function with its identity
//! and the driver currently bound to it.

use crate::error::{PciDevError, Result};
use crate::host::{is_valid_pci_address, read_link_name, HostPaths};
use crate::types::PciFunction;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Source of the host's PCI functions.
pub trait PciBus: Send + Sync {
    /// Enumerate all PCI functions, sorted by address.
    fn functions(&self) -> Result<Vec<PciFunction>>;
}

/// `PciBus` backed by sysfs.
#[derive(Debug, Clone)]
pub struct SysfsPciBus {
    paths: HostPaths,
}

impl SysfsPciBus {
    pub fn new(paths: HostPaths) -> Self {
        Self { paths }
    }

    /// Read one function's identity from its sysfs directory.
    pub fn read_function(&self, address: &str) -> Result<PciFunction> {
        if !is_valid_pci_address(address) {
            return Err(PciDevError::InvalidPciAddress { address: address.to_string() });
        }

        let sysfs_path = self.paths.pci_devices().join(address);
        let vendor_id = normalize_id(&read_sysfs_value(&sysfs_path.join("vendor"))?);
        let device_id = normalize_id(&read_sysfs_value(&sysfs_path.join("device"))?);
        let class = normalize_id(&read_sysfs_value(&sysfs_path.join("class"))?);
        let driver = read_link_name(&sysfs_path.join("driver"));

        let class_id = class.get(0..2).unwrap_or_default().to_string();
        let subclass_id = class.get(2..4).unwrap_or_default().to_string();

        debug!(
            address = %address,
            vendor = %vendor_id,
            device = %device_id,
            class = %class,
            driver = ?driver,
            "Read PCI device info"
        );

        Ok(PciFunction {
            address: address.to_string(),
            vendor_id,
            device_id,
            class_id,
            subclass_id,
            driver,
        })
    }
}

impl PciBus for SysfsPciBus {
    fn functions(&self) -> Result<Vec<PciFunction>> {
        let pci_path = self.paths.pci_devices();
        let entries = fs::read_dir(&pci_path).map_err(|e| PciDevError::host_io(&pci_path, e))?;

        let mut functions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PciDevError::host_io(&pci_path, e))?;
            let address = entry.file_name().to_string_lossy().to_string();

            match self.read_function(&address) {
                Ok(function) => functions.push(function),
                Err(e) => debug!(address = %address, error = %e, "Skipping PCI entry"),
            }
        }

        functions.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(functions)
    }
}

/// Read a value from a sysfs file.
fn read_sysfs_value(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| PciDevError::host_io(path, e))
}

/// "0x10DE" -> "10de"
fn normalize_id(raw: &str) -> String {
    raw.trim_start_matches("0x").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn write_function(root: &Path, address: &str, vendor: &str, device: &str, class: &str) {
        let dir = root.join("bus/pci/devices").join(address);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("0x{}\n", vendor)).unwrap();
        fs::write(dir.join("device"), format!("0x{}\n", device)).unwrap();
        fs::write(dir.join("class"), format!("0x{}\n", class)).unwrap();
    }

    #[test]
    fn test_enumerates_functions_with_driver() {
        let tmp = tempfile::tempdir().unwrap();
        write_function(tmp.path(), "0000:01:00.0", "10DE", "2204", "030000");
        write_function(tmp.path(), "0000:00:1c.0", "8086", "a110", "060400");
        symlink(
            "../../../bus/pci/drivers/nvidia",
            tmp.path().join("bus/pci/devices/0000:01:00.0/driver"),
        )
        .unwrap();

        let bus = SysfsPciBus::new(HostPaths::new(tmp.path()));
        let functions = bus.functions().unwrap();

        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].address, "0000:00:1c.0");
        assert!(functions[0].is_bridge());
        assert_eq!(functions[0].driver, None);

        assert_eq!(functions[1].vendor_id, "10de");
        assert_eq!(functions[1].class_id, "03");
        assert_eq!(functions[1].subclass_id, "00");
        assert_eq!(functions[1].driver.as_deref(), Some("nvidia"));
    }

    #[test]
    fn test_skips_malformed_entries() {
        let tmp = tempfile::tempdir().unwrap();
        write_function(tmp.path(), "0000:01:00.0", "10de", "2204", "030000");
        fs::create_dir_all(tmp.path().join("bus/pci/devices/not-a-device")).unwrap();
        // valid address, missing identity files
        fs::create_dir_all(tmp.path().join("bus/pci/devices/0000:02:00.0")).unwrap();

        let bus = SysfsPciBus::new(HostPaths::new(tmp.path()));
        let functions = bus.functions().unwrap();
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].address, "0000:01:00.0");
    }

    #[test]
    fn test_missing_bus_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = SysfsPciBus::new(HostPaths::new(tmp.path()));
        assert!(matches!(bus.functions(), Err(PciDevError::HostIo { .. })));
    }
}
