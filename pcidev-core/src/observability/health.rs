//! Subsystem health tracking.
//!
//! Each long-running part of the agent reports its own status here. Every
//! change is mirrored to the `pcidev_subsystem_health{subsystem}` gauge
//! (1 healthy, 0.5 degraded, 0 unhealthy).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

pub const STORE_SUBSYSTEM: &str = "store";
pub const INVENTORY_SUBSYSTEM: &str = "inventory";
pub const CLAIMS_SUBSYSTEM: &str = "claims";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Value exported on the health gauge.
    pub fn gauge_value(self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 0.5,
            Self::Unhealthy => 0.0,
        }
    }
}

/// Snapshot of all subsystems plus the worst status among them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub subsystems: Vec<SubsystemHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

/// Shared, cloneable registry of subsystem health.
#[derive(Clone, Default)]
pub struct HealthChecker {
    subsystems: Arc<RwLock<Vec<SubsystemHealth>>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `name` as healthy. Registering twice is a no-op.
    pub async fn register_subsystem(&self, name: &str) {
        let mut subsystems = self.subsystems.write().await;
        if subsystems.iter().any(|s| s.name == name) {
            return;
        }
        subsystems.push(SubsystemHealth {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            message: None,
        });
        export(name, HealthStatus::Healthy);
    }

    /// Record a new status for `name`; unknown subsystems are ignored.
    pub async fn update_subsystem(
        &self,
        name: &str,
        status: HealthStatus,
        message: Option<String>,
    ) {
        let mut subsystems = self.subsystems.write().await;
        let Some(subsystem) = subsystems.iter_mut().find(|s| s.name == name) else {
            return;
        };

        if status != HealthStatus::Healthy && subsystem.status == HealthStatus::Healthy {
            warn!(subsystem = name, ?status, message = ?message, "Subsystem no longer healthy");
        }
        subsystem.status = status;
        subsystem.message = message;
        export(name, status);
    }

    /// Current status of every subsystem.
    ///
    /// The overall status is the worst subsystem status.
    pub async fn get_health(&self) -> HealthCheck {
        let subsystems = self.subsystems.read().await.clone();

        let status = if subsystems.iter().any(|s| s.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if subsystems.iter().any(|s| s.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthCheck { status, subsystems }
    }
}

fn export(name: &str, status: HealthStatus) {
    metrics::gauge!("pcidev_subsystem_health", "subsystem" => name.to_string())
        .set(status.gauge_value());
}
