//! Host access through sysfs.
//!
//! Everything the agent knows about the machine comes from, or is written
//! to, a sysfs tree:
//!
//! ```text
//! <root>/bus/pci/devices/<addr>/{vendor,device,class,driver}
//! <root>/bus/pci/drivers/<driver>/{<addr>,bind,unbind,new_id}
//! <root>/kernel/iommu_groups/<group>/devices/<addr>
//! <root>/class/net/<iface>/{device,master,operstate}
//! ```
//!
//! The root is `/sys` in production and a temporary directory in tests.

pub mod driver;
pub mod iommu;
pub mod network;
pub mod pci;

pub use driver::DriverBinder;
pub use iommu::IommuGroupIndex;
pub use network::{NetworkTopology, SysfsNetwork};
pub use pci::{PciBus, SysfsPciBus};

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Regular expression to validate PCI address format: 0000:01:00.0
static PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("Invalid PCI address regex")
});

/// Validate PCI address format.
pub fn is_valid_pci_address(address: &str) -> bool {
    PCI_ADDRESS_REGEX.is_match(address)
}

/// Locations of the sysfs trees the agent reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    root: PathBuf,
}

impl HostPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pci_devices(&self) -> PathBuf {
        self.root.join("bus/pci/devices")
    }

    pub fn pci_drivers(&self) -> PathBuf {
        self.root.join("bus/pci/drivers")
    }

    pub fn driver_dir(&self, driver: &str) -> PathBuf {
        self.pci_drivers().join(driver)
    }

    pub fn iommu_groups(&self) -> PathBuf {
        self.root.join("kernel/iommu_groups")
    }

    pub fn net_class(&self) -> PathBuf {
        self.root.join("class/net")
    }
}

impl Default for HostPaths {
    fn default() -> Self {
        Self::new(crate::paths::DEFAULT_SYSFS_ROOT)
    }
}

/// Last path component of the symlink at `link`, if it is one.
///
/// sysfs expresses relations (`driver`, `iommu_group`, `master`, `device`)
/// as symlinks whose target's file name is the related object.
pub(crate) fn read_link_name(link: &Path) -> Option<String> {
    std::fs::read_link(link)
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pci_address_validation() {
        assert!(is_valid_pci_address("0000:01:00.0"));
        assert!(is_valid_pci_address("0000:ff:1f.7"));
        assert!(is_valid_pci_address("ABCD:12:34.5"));

        assert!(!is_valid_pci_address("01:00.0")); // Missing domain
        assert!(!is_valid_pci_address("0000:01:00")); // Missing function
        assert!(!is_valid_pci_address("0000:01:00.8")); // Invalid function (max 7)
        assert!(!is_valid_pci_address("invalid"));
    }

    #[test]
    fn test_host_paths() {
        let paths = HostPaths::new("/tmp/sys");
        assert_eq!(paths.pci_devices(), PathBuf::from("/tmp/sys/bus/pci/devices"));
        assert_eq!(
            paths.driver_dir("vfio-pci"),
            PathBuf::from("/tmp/sys/bus/pci/drivers/vfio-pci")
        );
        assert_eq!(paths.iommu_groups(), PathBuf::from("/tmp/sys/kernel/iommu_groups"));
        assert_eq!(HostPaths::default().root(), Path::new("/sys"));
    }
}
