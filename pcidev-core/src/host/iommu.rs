//! IOMMU group index.
//!
//! IOMMU groups are the smallest unit of device isolation: every function in
//! a group shares one DMA domain. The index records which group each PCI
//! address belongs to so device records can show it; no group-wide binding
//! decisions are made here.
//!
//! The index is a point-in-time computation over the group symlink tree
//! (`kernel/iommu_groups/<group>/devices/<address>`) and is rebuilt on every
//! inventory cycle.

use crate::host::HostPaths;
use crate::types::UNKNOWN_IOMMU_GROUP;
use std::collections::HashMap;
use std::fs;
use tracing::{debug, warn};

/// Mapping from PCI address to IOMMU group number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IommuGroupIndex {
    groups: HashMap<String, i32>,
}

impl IommuGroupIndex {
    /// Scan the host and build the index.
    ///
    /// A host without an IOMMU group directory yields an empty index.
    pub fn scan(paths: &HostPaths) -> Self {
        Self::from_group_paths(&group_paths(paths))
    }

    /// Build the index from `<...>/<group>/devices/<address>` paths.
    ///
    /// Paths whose group segment does not parse map their address to
    /// [`UNKNOWN_IOMMU_GROUP`]; paths without an address are ignored.
    pub fn from_group_paths(group_paths: &[String]) -> Self {
        let mut groups = HashMap::new();
        for path in group_paths {
            if let Some((address, group)) = parse_group_path(path) {
                groups.insert(address, group);
            }
        }
        Self { groups }
    }

    /// Group of `address`, or [`UNKNOWN_IOMMU_GROUP`].
    pub fn group_of(&self, address: &str) -> i32 {
        self.groups.get(address).copied().unwrap_or(UNKNOWN_IOMMU_GROUP)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Split a group path into (address, group).
fn parse_group_path(path: &str) -> Option<(String, i32)> {
    let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();
    let address = segments.last().filter(|s| !s.is_empty())?.to_string();

    let group = match segments.len().checked_sub(3).map(|i| (segments[i], segments[i + 1])) {
        Some((group, "devices")) => group.parse().unwrap_or_else(|_| {
            warn!(path = %path, "Unparseable IOMMU group");
            UNKNOWN_IOMMU_GROUP
        }),
        _ => UNKNOWN_IOMMU_GROUP,
    };

    Some((address, group))
}

/// List all `<iommu_groups>/<group>/devices/<address>` paths on the host.
pub fn group_paths(paths: &HostPaths) -> Vec<String> {
    let root = paths.iommu_groups();
    let groups = match fs::read_dir(&root) {
        Ok(groups) => groups,
        Err(e) => {
            debug!(path = %root.display(), error = %e, "No IOMMU groups (IOMMU disabled?)");
            return Vec::new();
        }
    };

    let mut result = Vec::new();
    for group in groups.flatten() {
        let devices_path = group.path().join("devices");
        let devices = match fs::read_dir(&devices_path) {
            Ok(devices) => devices,
            Err(e) => {
                warn!(path = %devices_path.display(), error = %e, "Cannot read IOMMU group");
                continue;
            }
        };
        for device in devices.flatten() {
            result.push(devices_path.join(device.file_name()).to_string_lossy().to_string());
        }
    }

    result
}

/// Check if IOMMU is enabled on the system.
pub fn is_iommu_enabled(paths: &HostPaths) -> bool {
    paths.iommu_groups().exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_paths() -> Vec<String> {
        vec![
            "/sys/kernel/iommu_groups/9/devices/0000:00:1c.0".to_string(),
            "/sys/kernel/iommu_groups/9/devices/0000:00:1c.5".to_string(),
            "/sys/kernel/iommu_groups/9/devices/0000:06:00.0".to_string(),
            "/sys/kernel/iommu_groups/27/devices/0000:3e:04.2".to_string(),
            "/sys/kernel/iommu_groups/27/devices/0000:3e:04.0".to_string(),
        ]
    }

    #[test]
    fn test_group_map_from_paths() {
        let index = IommuGroupIndex::from_group_paths(&sample_paths());
        assert_eq!(index.len(), 5);
        assert_eq!(index.group_of("0000:00:1c.0"), 9);
        assert_eq!(index.group_of("0000:3e:04.2"), 27);
        assert_eq!(index.group_of("0000:ff:00.0"), UNKNOWN_IOMMU_GROUP);
    }

    #[test]
    fn test_unparseable_group_is_sentinel() {
        let index = IommuGroupIndex::from_group_paths(&[
            "/sys/kernel/iommu_groups/abc/devices/0000:01:00.0".to_string(),
            "0000:02:00.0".to_string(),
        ]);
        assert_eq!(index.group_of("0000:01:00.0"), UNKNOWN_IOMMU_GROUP);
        assert_eq!(index.group_of("0000:02:00.0"), UNKNOWN_IOMMU_GROUP);
    }

    #[test]
    fn test_scan_reads_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = HostPaths::new(tmp.path());
        for (group, address) in [("9", "0000:00:1c.0"), ("27", "0000:3e:04.2")] {
            let dir = paths.iommu_groups().join(group).join("devices");
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(address), "").unwrap();
        }

        assert!(is_iommu_enabled(&paths));
        let index = IommuGroupIndex::scan(&paths);
        assert_eq!(index.len(), 2);
        assert_eq!(index.group_of("0000:00:1c.0"), 9);
        assert_eq!(index.group_of("0000:3e:04.2"), 27);
    }

    #[test]
    fn test_missing_iommu_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = HostPaths::new(tmp.path());
        assert!(!is_iommu_enabled(&paths));
        assert!(IommuGroupIndex::scan(&paths).is_empty());
    }
}
