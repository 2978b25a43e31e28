//! Pipeline counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::CircuitState;

/// Counters shared by the service, queue workers and batch processor.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    processed_batches: AtomicU64,
    processed_entries: AtomicU64,
    failed_batches: AtomicU64,
    failed_entries: AtomicU64,
    critical_writes: AtomicU64,
    critical_fallbacks: AtomicU64,
    errors: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// An entry refused at admission.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self, entries: usize) {
        self.processed_batches.fetch_add(1, Ordering::Relaxed);
        self.processed_entries.fetch_add(entries as u64, Ordering::Relaxed);
    }

    /// A batch abandoned after its retries; its entries are lost.
    pub fn record_failed_batch(&self, entries: usize) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
        self.failed_entries.fetch_add(entries as u64, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_critical_write(&self) {
        self.critical_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_critical_fallback(&self) {
        self.critical_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn processed_entries(&self) -> u64 {
        self.processed_entries.load(Ordering::Relaxed)
    }

    /// Combine the counters with gauges owned by other components.
    pub fn snapshot(&self, gauges: Gauges) -> MetricsSnapshot {
        MetricsSnapshot {
            queued: gauges.queued,
            buffered: gauges.buffered,
            circuit_state: gauges.circuit_state,
            failure_count: gauges.failure_count,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            processed_batches: self.processed_batches.load(Ordering::Relaxed),
            processed_entries: self.processed_entries.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            failed_entries: self.failed_entries.load(Ordering::Relaxed),
            critical_writes: self.critical_writes.load(Ordering::Relaxed),
            critical_fallbacks: self.critical_fallbacks.load(Ordering::Relaxed),
            sanitized_fields: gauges.sanitized_fields,
            errors: self.errors.load(Ordering::Relaxed) + gauges.sanitize_errors,
        }
    }
}

/// Point-in-time values read from the queue, buffer and redactor.
#[derive(Debug, Clone, Copy)]
pub struct Gauges {
    pub queued: usize,
    pub buffered: usize,
    pub circuit_state: CircuitState,
    pub failure_count: i64,
    pub sanitized_fields: u64,
    pub sanitize_errors: u64,
}

/// Everything the service reports about its pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub queued: usize,
    pub buffered: usize,
    pub circuit_state: CircuitState,
    pub failure_count: i64,
    pub enqueued: u64,
    pub dropped: u64,
    pub processed_batches: u64,
    pub processed_entries: u64,
    pub failed_batches: u64,
    pub failed_entries: u64,
    pub critical_writes: u64,
    pub critical_fallbacks: u64,
    pub sanitized_fields: u64,
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_combines_gauges() {
        let metrics = PipelineMetrics::new();
        metrics.record_enqueued();
        metrics.record_enqueued();
        metrics.record_dropped();
        metrics.record_batch(2);
        metrics.record_failed_batch(5);

        let snapshot = metrics.snapshot(Gauges {
            queued: 3,
            buffered: 1,
            circuit_state: CircuitState::Closed,
            failure_count: 1,
            sanitized_fields: 7,
            sanitize_errors: 2,
        });

        assert_eq!(snapshot.queued, 3);
        assert_eq!(snapshot.enqueued, 2);
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.processed_batches, 1);
        assert_eq!(snapshot.processed_entries, 2);
        assert_eq!(snapshot.failed_entries, 5);
        assert_eq!(snapshot.sanitized_fields, 7);
        assert_eq!(snapshot.errors, 3);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["circuit_state"], "closed");
    }
}
