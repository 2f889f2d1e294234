// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation.
//!
//! Uses the `metrics` crate facade; the host process installs the exporter.
//!
//! # Metric Naming Convention
//! - `crate_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `backend`: local, sql, fallback
//! - `operation`: get_cooldown, consume_key, acquire_lock, ...
//! - `status`: success, error, unavailable

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record the outcome of a storage operation
pub fn record_operation(backend: &str, operation: &str, status: &str) {
    counter!(
        "crate_sync_storage_operations_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record storage operation latency
pub fn record_latency(backend: &str, operation: &str, duration: Duration) {
    histogram!(
        "crate_sync_storage_operation_seconds",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A caller waited the full checkout timeout without getting a connection
pub fn record_pool_timeout() {
    counter!("crate_sync_pool_timeouts_total").increment(1);
}

/// Primary storage tier was abandoned for the secondary
pub fn record_fallback_transition(primary: &str, operation: &str) {
    counter!(
        "crate_sync_fallback_transitions_total",
        "primary" => primary.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
    gauge!("crate_sync_storage_degraded").set(1.0);
}

/// Outcome of an outbound sync event
pub fn record_publish(target: &str, outcome: &str) {
    counter!(
        "crate_sync_publish_total",
        "target" => target.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Inbound event dropped because it originated here
pub fn record_echo_suppressed() {
    counter!("crate_sync_echoes_suppressed_total").increment(1);
}

/// Inbound event handed to the local handler
pub fn record_inbound_applied(kind: &str) {
    counter!(
        "crate_sync_inbound_applied_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Result of a health probe against the bus or ledger
pub fn record_health_probe(component: &str, healthy: bool) {
    counter!(
        "crate_sync_health_probes_total",
        "component" => component.to_string(),
        "healthy" => if healthy { "true" } else { "false" }
    )
    .increment(1);
}

/// Coordinator degraded flag (0 = healthy, 1 = degraded)
pub fn set_sync_degraded(degraded: bool) {
    gauge!("crate_sync_sync_degraded").set(if degraded { 1.0 } else { 0.0 });
}

/// Rows moved by a migration run
pub fn record_migration(category: &str, source: usize, target: usize) {
    gauge!(
        "crate_sync_migration_source_rows",
        "category" => category.to_string()
    )
    .set(source as f64);
    gauge!(
        "crate_sync_migration_target_rows",
        "category" => category.to_string()
    )
    .set(target as f64);
}

/// Times an operation and records its latency on drop.
pub struct LatencyTimer {
    backend: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(backend: &'static str, operation: &'static str) -> Self {
        Self {
            backend,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.backend, self.operation, self.start.elapsed());
    }
}
