//! Lightweight metrics for pipeline observability.
//!
//! Atomic counters and gauges, snapshot-logged on the heartbeat. No
//! external metrics backend; the structured log line is the export surface.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Registry shared across workers.
#[derive(Debug, Default)]
pub struct Metrics {
    pub ingest_runs: Counter,
    pub markets_cached: Gauge,
    pub scans_completed: Counter,
    pub opportunities_detected: Counter,
    pub opportunities_admitted: Counter,
    pub opportunities_rejected: Counter,
    pub opportunities_expired: Counter,
    pub executions_filled: Counter,
    pub executions_partial: Counter,
    pub executions_failed: Counter,
    pub fills_applied: Counter,
    pub discovery_runs: Counter,
    pub relationships_active: Gauge,
    pub relationships_invalidated: Counter,
    pub exchange_errors: Counter,
    pub llm_errors: Counter,
    pub kill_switch_trips: Counter,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Emit the whole registry as one structured heartbeat line.
    pub fn log_snapshot(&self) {
        info!(
            event = "metrics_snapshot",
            ingest_runs = self.ingest_runs.get(),
            markets_cached = self.markets_cached.get(),
            scans_completed = self.scans_completed.get(),
            opportunities_detected = self.opportunities_detected.get(),
            opportunities_admitted = self.opportunities_admitted.get(),
            opportunities_rejected = self.opportunities_rejected.get(),
            opportunities_expired = self.opportunities_expired.get(),
            executions_filled = self.executions_filled.get(),
            executions_partial = self.executions_partial.get(),
            executions_failed = self.executions_failed.get(),
            fills_applied = self.fills_applied.get(),
            discovery_runs = self.discovery_runs.get(),
            relationships_active = self.relationships_active.get(),
            relationships_invalidated = self.relationships_invalidated.get(),
            exchange_errors = self.exchange_errors.get(),
            llm_errors = self.llm_errors.get(),
            kill_switch_trips = self.kill_switch_trips.get(),
            "Metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_gauges_overwrite() {
        let metrics = Metrics::new();
        metrics.opportunities_detected.inc();
        metrics.opportunities_detected.add(4);
        assert_eq!(metrics.opportunities_detected.get(), 5);

        metrics.markets_cached.set(120);
        metrics.markets_cached.set(80);
        assert_eq!(metrics.markets_cached.get(), 80);
    }
}
