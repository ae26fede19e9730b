//! Centralized path configuration for the PCI device agent.
//!
//! Data paths go through this module so the daemon and the tests agree on
//! where state lives, whether running as a system service or a user.

use std::path::PathBuf;

/// Get the agent data directory.
///
/// Resolution order:
/// 1. `PCIDEV_DATA_DIR` environment variable
/// 2. `/var/lib/pcidevices` if it exists (system install)
/// 3. `~/.pcidevices` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PCIDEV_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/pcidevices");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".pcidevices")).unwrap_or(system_dir)
}

/// Get the configuration directory.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PCIDEV_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    data_dir()
}

/// Get the record store database path.
pub fn db_path() -> PathBuf {
    data_dir().join("pcidevices.db")
}

/// Default sysfs mount point.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";
