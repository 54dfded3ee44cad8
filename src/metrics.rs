// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the dual-write sync service.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `dual_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `lane`: real_time, near_real_time, batch, recovery, and strong for synchronous writes
//! - `operation`: create, update, delete, bulk_insert, bulk_update, bulk_delete
//! - `outcome`: completed, retrying, failed, compensated
//!
//! [`SyncMetrics`] is the in-process aggregate reported by `get_sync_status()`;
//! it is independent of whichever recorder is installed.

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use serde::Serialize;

use crate::resilience::circuit_breaker::CircuitState;

/// Record the outcome of one operation attempt
pub fn record_operation(lane: &str, operation: &str, outcome: &str) {
    counter!(
        "dual_sync_operations_total",
        "lane" => lane.to_string(),
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record dual-write latency
pub fn record_latency(lane: &str, operation: &str, duration: Duration) {
    histogram!(
        "dual_sync_operation_seconds",
        "lane" => lane.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record batch size processed by a lane
pub fn record_batch_size(lane: &str, count: usize) {
    histogram!(
        "dual_sync_batch_size",
        "lane" => lane.to_string()
    )
    .record(count as f64);
}

/// Set queue depth for a lane
pub fn set_queue_depth(lane: &str, depth: usize) {
    gauge!(
        "dual_sync_queue_depth",
        "lane" => lane.to_string()
    )
    .set(depth as f64);
}

/// Record an enqueue rejected because the lane was full or closed
pub fn record_queue_rejection(lane: &str) {
    counter!(
        "dual_sync_queue_rejections_total",
        "lane" => lane.to_string()
    )
    .increment(1);
}

pub fn set_dead_letter_depth(depth: usize) {
    gauge!("dual_sync_dead_letter_depth").set(depth as f64);
}

pub fn record_dead_letter() {
    counter!("dual_sync_dead_letters_total").increment(1);
}

/// Record entries dropped from a bounded structure ("dead_letter", "history", "history_live")
pub fn record_eviction(structure: &str, count: usize) {
    counter!(
        "dual_sync_evictions_total",
        "structure" => structure.to_string()
    )
    .increment(count as u64);
}

pub fn record_retry(lane: &str) {
    counter!(
        "dual_sync_retries_total",
        "lane" => lane.to_string()
    )
    .increment(1);
}

/// Record a compensation attempt ("applied", "failed", "skipped")
pub fn record_compensation(operation: &str, result: &str) {
    counter!(
        "dual_sync_compensations_total",
        "operation" => operation.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_backfill(table: &str, records: usize, errors: usize) {
    counter!(
        "dual_sync_backfill_records_total",
        "table" => table.to_string()
    )
    .increment(records as u64);
    counter!(
        "dual_sync_backfill_errors_total",
        "table" => table.to_string()
    )
    .increment(errors as u64);
}

/// Record a consistency check result ("consistent", "inconsistent", "not_found")
pub fn record_consistency_check(status: &str) {
    counter!(
        "dual_sync_consistency_checks_total",
        "status" => status.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER - Resilience metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Set circuit breaker state (0 = closed, 1 = half-open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: CircuitState) {
    gauge!(
        "dual_sync_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as u8 as f64);
}

/// Record circuit breaker call outcome
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "dual_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "dual_sync_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Track engine state transitions
pub fn set_engine_state(state: &str) {
    counter!(
        "dual_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    lane: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(lane: &'static str, operation: &'static str) -> Self {
        Self {
            lane,
            operation,
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.lane, self.operation, self.start.elapsed());
    }
}

/// Process-lifetime aggregate of finished operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncMetrics {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    /// Running mean over every finished operation
    pub average_latency_ms: f64,
    /// Sum of all lane depths at the last sample
    pub queue_depth: usize,
    /// Epoch millis of the last successful dual-write
    pub last_sync_at: Option<i64>,
}

impl SyncMetrics {
    pub fn record_success(&mut self, latency: Duration, at_millis: i64) {
        self.successful_operations += 1;
        self.last_sync_at = Some(at_millis);
        self.observe(latency);
    }

    pub fn record_failure(&mut self, latency: Duration) {
        self.failed_operations += 1;
        self.observe(latency);
    }

    fn observe(&mut self, latency: Duration) {
        self.total_operations += 1;
        let sample = latency.as_secs_f64() * 1000.0;
        self.average_latency_ms += (sample - self.average_latency_ms) / self.total_operations as f64;
    }

    /// Successful share of finished operations, as a percentage. 100 before any finish.
    #[must_use]
    pub fn consistency_score(&self) -> f64 {
        if self.total_operations == 0 {
            return 100.0;
        }
        self.successful_operations as f64 / self.total_operations as f64 * 100.0
    }
}
