//! PCI device claim types.

use serde::{Deserialize, Serialize};

/// A user's intent to reserve one device for passthrough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PciDeviceClaim {
    pub name: String,
    /// Name of the device record this claim belongs to
    pub owner: Option<String>,
    pub spec: ClaimSpec,
    #[serde(default)]
    pub status: ClaimStatus,
    /// Optimistic concurrency token maintained by the store
    #[serde(default)]
    pub resource_version: i64,
    /// Set once deletion was requested; the record stays until passthrough is disabled
    #[serde(default)]
    pub deletion_requested: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSpec {
    pub address: String,
    pub node_name: String,
    pub user_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimStatus {
    /// Driver in use before passthrough was enabled, restored on disable
    pub kernel_driver_to_unbind: Option<String>,
    pub passthrough_enabled: bool,
    /// Device-specific state captured before enabling (link state for NICs)
    #[serde(rename = "stateBeforePassthroughEnabled")]
    pub state_before_passthrough: Option<String>,
}

/// Lifecycle phase of a claim, derived from its persisted fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimPhase {
    /// Passthrough not enabled (never enabled, or enabling failed)
    Unbound,
    /// Device bound to the passthrough driver and offered for allocation
    Enabled,
    /// Deletion requested; waiting for the device to be released
    Disabling,
}

impl std::fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unbound => write!(f, "unbound"),
            Self::Enabled => write!(f, "enabled"),
            Self::Disabling => write!(f, "disabling"),
        }
    }
}

impl PciDeviceClaim {
    /// Create a claim for `address` on `node_name`, owned by device record `owner`.
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        address: impl Into<String>,
        node_name: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            owner: Some(owner.into()),
            spec: ClaimSpec {
                address: address.into(),
                node_name: node_name.into(),
                user_name: user_name.into(),
            },
            status: ClaimStatus::default(),
            resource_version: 0,
            deletion_requested: false,
        }
    }

    /// Check if this claim is meant for `node_name`.
    pub fn targets(&self, node_name: &str) -> bool {
        self.spec.node_name == node_name
    }

    /// Check if this claim names `device_name` as its owner.
    pub fn is_owned_by(&self, device_name: &str) -> bool {
        self.owner.as_deref() == Some(device_name)
    }

    pub fn phase(&self) -> ClaimPhase {
        if self.deletion_requested {
            ClaimPhase::Disabling
        } else if self.status.passthrough_enabled {
            ClaimPhase::Enabled
        } else {
            ClaimPhase::Unbound
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase() {
        let mut claim = PciDeviceClaim::new("c", "node1-000001000", "0000:01:00.0", "node1", "u");
        assert_eq!(claim.phase(), ClaimPhase::Unbound);

        claim.status.passthrough_enabled = true;
        assert_eq!(claim.phase(), ClaimPhase::Enabled);

        claim.deletion_requested = true;
        assert_eq!(claim.phase(), ClaimPhase::Disabling);
        assert_eq!(claim.phase().to_string(), "disabling");
    }

    #[test]
    fn test_status_wire_names() {
        let status = ClaimStatus {
            kernel_driver_to_unbind: Some("ixgbe".into()),
            passthrough_enabled: true,
            state_before_passthrough: Some("up".into()),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["kernelDriverToUnbind"], "ixgbe");
        assert_eq!(json["passthroughEnabled"], true);
        assert_eq!(json["stateBeforePassthroughEnabled"], "up");
    }

    #[test]
    fn test_ownership() {
        let claim = PciDeviceClaim::new("c", "node1-000001000", "0000:01:00.0", "node1", "u");
        assert!(claim.is_owned_by("node1-000001000"));
        assert!(!claim.is_owned_by("node1-000002000"));
        assert!(claim.targets("node1"));
        assert!(!claim.targets("node2"));
    }
}
