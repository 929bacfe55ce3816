// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the query cache.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding service is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `kv_query_cache_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: local, remote, metadata, database
//! - `operation`: get, put, delete, get_many, put_many, delete_many
//! - `result`: hit, miss, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a tier lookup outcome
pub fn record_lookup(tier: &str, result: &str) {
    counter!(
        "kv_query_cache_lookups_total",
        "tier" => tier.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "kv_query_cache_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a request rejected before touching any tier
pub fn record_rejected(operation: &str) {
    counter!(
        "kv_query_cache_rejected_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record batch size
pub fn record_batch_size(operation: &str, count: usize) {
    histogram!(
        "kv_query_cache_batch_size",
        "operation" => operation.to_string()
    )
    .record(count as f64);
}

/// Set current local cache entry count
pub fn set_local_cache_items(count: usize) {
    gauge!("kv_query_cache_local_items").set(count as f64);
}

/// Record local entries dropped by the recycling sweep
pub fn record_local_evictions(count: usize) {
    counter!("kv_query_cache_local_evictions_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// WRITE-BEHIND
// ═══════════════════════════════════════════════════════════════════════════

/// Record a finished write-behind task
pub fn record_write_behind(task: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "kv_query_cache_write_behind_total",
        "task" => task.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Set in-flight write-behind tasks
pub fn set_write_behind_in_flight(count: usize) {
    gauge!("kv_query_cache_write_behind_in_flight").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// EXPIRATION
// ═══════════════════════════════════════════════════════════════════════════

/// Record a TTL-proxy arming decision (`armed`, `skipped`, `cleared`)
pub fn record_proxy_arm(outcome: &str) {
    counter!(
        "kv_query_cache_proxy_arms_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a handled expiration notification (`evicted`, `flush_failed`, `ignored`)
pub fn record_expiration(outcome: &str) {
    counter!(
        "kv_query_cache_expirations_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ERRORS & LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a retried backend call
pub fn record_retry(operation: &str) {
    counter!(
        "kv_query_cache_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record an error with category for alerting
pub fn record_error(tier: &str, operation: &str, error_type: &str) {
    counter!(
        "kv_query_cache_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a connection/backend error
pub fn record_connection_error(backend: &str) {
    counter!(
        "kv_query_cache_connection_errors_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Set backend health status
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "kv_query_cache_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Record current engine state as a labelled gauge
pub fn set_engine_state(state: &str) {
    gauge!(
        "kv_query_cache_engine_state",
        "state" => state.to_string()
    )
    .set(1.0);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_recorders_do_not_panic_without_exporter() {
        record_lookup("local", "hit");
        record_latency("get", Duration::from_micros(100));
        record_rejected("put");
        record_batch_size("get_many", 10);
        set_local_cache_items(5);
        record_local_evictions(2);
        record_write_behind("db_save", false);
        set_write_behind_in_flight(3);
        record_proxy_arm("armed");
        record_expiration("evicted");
        record_error("database", "save", "backend");
        record_connection_error("redis");
        record_retry("sql_select");
        set_backend_healthy("mysql", true);
        set_engine_state("Running");
    }

    #[test]
    fn test_lookup_counter_is_labelled() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_lookup("remote", "miss");
            record_lookup("remote", "miss");
        });

        let counted = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find(|(key, _, _, _)| key.key().name() == "kv_query_cache_lookups_total")
            .map(|(key, _, _, value)| (key, value));
        let (key, value) = counted.unwrap();
        assert!(key
            .key()
            .labels()
            .any(|l| l.key() == "tier" && l.value() == "remote"));
        assert!(matches!(value, DebugValue::Counter(2)));
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("get");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }
}
