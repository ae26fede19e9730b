//! Error types for the PCI device agent.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pcidev operations.
pub type Result<T> = std::result::Result<T, PciDevError>;

/// Main error type for the PCI device agent.
#[derive(Error, Debug)]
pub enum PciDevError {
    // Record store errors
    #[error("PCI device record not found: {name}")]
    DeviceNotFound { name: String },

    #[error("PCI device claim not found: {name}")]
    ClaimNotFound { name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} {name} was modified concurrently (expected version {expected})")]
    Conflict { kind: &'static str, name: String, expected: i64 },

    #[error("Cannot find PCI device that owns claim {claim}")]
    MissingOwner { claim: String },

    // Host errors
    #[error("Invalid PCI address format: {address} (expected: 0000:01:00.0)")]
    InvalidPciAddress { address: String },

    #[error("I/O error at {path:?}: {source}")]
    HostIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to bind {address} to {driver}: {reason}")]
    DriverBind { address: String, driver: String, reason: String },

    // Allocation registry errors
    #[error("No allocation registry for resource class {class}")]
    ResourceClassNotFound { class: String },

    #[error("Device {address} is not registered for resource class {class}")]
    DeviceNotRegistered { class: String, address: String },

    // Database errors
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Database migration failed: {reason}")]
    MigrationFailed { reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Reboot recovery failed for {} claim(s): {}", failures.len(), failures.join("; "))]
    Recovery { failures: Vec<String> },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PciDevError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Wrap an I/O error with the host path it happened on.
    pub fn host_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::HostIo { path: path.into(), source }
    }

    /// True for lookups of records that do not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::DeviceNotFound { .. } | Self::ClaimNotFound { .. })
    }

    /// True when an optimistic-concurrency check failed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(PciDevError::DeviceNotFound { name: "n1-000001000".into() }.is_not_found());
        assert!(PciDevError::ClaimNotFound { name: "claim".into() }.is_not_found());
        assert!(!PciDevError::Internal("boom".into()).is_not_found());

        let conflict = PciDevError::Conflict { kind: "claim", name: "c".into(), expected: 3 };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_not_found());
    }

    #[test]
    fn test_recovery_message_lists_failures() {
        let err = PciDevError::Recovery {
            failures: vec!["claim-a: boom".to_string(), "claim-b: bust".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 claim(s)"));
        assert!(msg.contains("claim-a: boom; claim-b: bust"));
    }
}
