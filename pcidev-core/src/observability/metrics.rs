//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use metrics::{counter, describe_counter, describe_gauge, describe_histogram};

/// Register all core metrics with descriptions.
///
/// This ensures metrics appear in `/metrics` with proper metadata.
pub fn register_core_metrics() {
    // Inventory metrics
    describe_counter!("pcidev_inventory_reconcile_total", "Total inventory reconciliation cycles");
    describe_counter!(
        "pcidev_inventory_reconcile_failures_total",
        "Total inventory reconciliation cycles that ended in an error"
    );
    describe_histogram!(
        "pcidev_inventory_reconcile_duration_seconds",
        "Duration of one inventory reconciliation cycle"
    );
    describe_gauge!("pcidev_devices_discovered", "PCI functions reported by the host bus");
    describe_counter!("pcidev_devices_pruned_total", "Device records deleted after disappearing");

    // Claim metrics
    describe_counter!(
        "pcidev_claim_transitions_total",
        "Claim state transitions (by transition: enable, disable, recover; result: ok, error)"
    );
    describe_counter!(
        "pcidev_orphans_unbound_total",
        "Devices released from the passthrough driver without a claim"
    );

    // Allocation metrics
    describe_counter!(
        "pcidev_health_updates_dropped_total",
        "Health updates dropped because the allocation stream queue was full"
    );

    // Health
    describe_gauge!(
        "pcidev_subsystem_health",
        "Subsystem health (1 healthy, 0.5 degraded, 0 unhealthy) by subsystem"
    );

    // Database metrics
    describe_counter!("pcidev_store_errors_total", "Record store failures (by operation)");
}

/// Count one claim transition attempt.
pub fn record_claim_transition(transition: &'static str, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!("pcidev_claim_transitions_total", "transition" => transition, "result" => result)
        .increment(1);
}

pub fn record_orphans_unbound(count: usize) {
    counter!("pcidev_orphans_unbound_total").increment(count as u64);
}
