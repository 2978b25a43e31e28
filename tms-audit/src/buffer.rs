//! Bounded audit buffer with a circuit breaker
//!
//! The buffer stages entries that could not be admitted to the queue and is
//! drained by the scheduled flush. Durable-insert outcomes drive a
//! three-state breaker:
//!
//! - `Closed` → `Open` after `threshold` consecutive failures
//! - `Open` → `HalfOpen` once the cooldown since the last failure has elapsed
//! - `HalfOpen` → `Closed` on the next success, → `Open` on the next failure
//!
//! While `HalfOpen` exactly one admission (the trial request) is allowed.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::entry::Entry;

const CLOSED: i32 = 0;
const OPEN: i32 = 1;
const HALF_OPEN: i32 = 2;

/// Breaker state, exposed in metrics and status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_raw(raw: i32) -> Self {
        match raw {
            OPEN => Self::Open,
            HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thread-safe, capacity-bounded entry staging area.
#[derive(Debug)]
pub struct AuditBuffer {
    entries: Mutex<Vec<Entry>>,
    capacity: usize,
    state: AtomicI32,
    failures: AtomicI64,
    last_failure: Mutex<Option<Instant>>,
    trial_taken: AtomicBool,
    threshold: i64,
    cooldown: Duration,
}

impl AuditBuffer {
    pub fn new(capacity: usize, threshold: u32, cooldown: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(capacity.min(1024))),
            capacity,
            state: AtomicI32::new(CLOSED),
            failures: AtomicI64::new(0),
            last_failure: Mutex::new(None),
            trial_taken: AtomicBool::new(false),
            threshold: i64::from(threshold.max(1)),
            cooldown,
        }
    }

    /// Stage an entry. Returns `false` when the breaker refuses it or the
    /// buffer is full.
    pub fn add(&self, entry: Entry) -> bool {
        let probing = match self.admission_state() {
            CircuitState::Closed => false,
            CircuitState::Open => return false,
            CircuitState::HalfOpen => {
                if self
                    .trial_taken
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return false;
                }
                true
            }
        };

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.capacity {
            if probing {
                self.trial_taken.store(false, Ordering::Release);
            }
            return false;
        }
        entries.push(entry);
        true
    }

    /// Current state, moving `Open` to `HalfOpen` once the cooldown has passed.
    fn admission_state(&self) -> CircuitState {
        let state = CircuitState::from_raw(self.state.load(Ordering::Acquire));
        if state != CircuitState::Open {
            return state;
        }

        let cooled = self
            .last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none_or(|at| at.elapsed() > self.cooldown);
        if !cooled {
            return CircuitState::Open;
        }

        if self
            .state
            .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.trial_taken.store(false, Ordering::Release);
            tracing::info!("Audit circuit breaker half-open, allowing a trial request");
        }
        CircuitState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Count a failed durable insert.
    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        *self.last_failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        let previous = self.state.load(Ordering::Acquire);
        let should_open = previous == HALF_OPEN || (previous == CLOSED && failures >= self.threshold);
        if should_open && self.state.swap(OPEN, Ordering::AcqRel) != OPEN {
            self.trial_taken.store(false, Ordering::Release);
            tracing::warn!(
                consecutive_failures = failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Audit circuit breaker opened"
            );
        }
    }

    /// Count a successful durable insert; closes the breaker.
    pub fn reset_failures(&self) {
        let previous = self.state.swap(CLOSED, Ordering::AcqRel);
        self.failures.store(0, Ordering::Release);
        self.trial_taken.store(false, Ordering::Release);
        *self.last_failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
        if previous != CLOSED {
            tracing::info!("Audit circuit breaker closed");
        }
    }

    /// Take every staged entry, leaving the buffer empty.
    pub fn flush_and_reset(&self) -> Vec<Entry> {
        std::mem::take(&mut *self.entries.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fraction of capacity in use, 0.0 to 1.0
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.len() as f64 / self.capacity as f64
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> i64 {
        self.failures.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Operation, Resource};

    fn entry() -> Entry {
        Entry::new(Resource::Shipment, "shp_1", Operation::Create, "usr_1", "org_1", "bu_1")
    }

    #[test]
    fn test_capacity_is_enforced() {
        let buffer = AuditBuffer::new(2, 3, Duration::from_secs(30));
        assert!(buffer.add(entry()));
        assert!(buffer.add(entry()));
        assert!(!buffer.add(entry()));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.utilization(), 1.0);
    }

    #[test]
    fn test_flush_and_reset_empties() {
        let buffer = AuditBuffer::new(4, 3, Duration::from_secs(30));
        buffer.add(entry());
        buffer.add(entry());
        let drained = buffer.flush_and_reset();
        assert_eq!(drained.len(), 2);
        assert!(buffer.is_empty());
        assert!(buffer.add(entry()));
    }

    #[test]
    fn test_opens_after_threshold() {
        let buffer = AuditBuffer::new(10, 3, Duration::from_secs(30));
        buffer.record_failure();
        buffer.record_failure();
        assert_eq!(buffer.state(), CircuitState::Closed);
        assert!(buffer.add(entry()));

        buffer.record_failure();
        assert_eq!(buffer.state(), CircuitState::Open);
        assert_eq!(buffer.failure_count(), 3);
        assert!(!buffer.add(entry()));
    }

    #[test]
    fn test_half_open_allows_single_trial() {
        let buffer = AuditBuffer::new(10, 3, Duration::from_millis(20));
        for _ in 0..3 {
            buffer.record_failure();
        }
        assert!(!buffer.add(entry()));

        std::thread::sleep(Duration::from_millis(40));
        assert!(buffer.add(entry()));
        assert_eq!(buffer.state(), CircuitState::HalfOpen);
        assert!(!buffer.add(entry()));

        buffer.reset_failures();
        assert_eq!(buffer.state(), CircuitState::Closed);
        assert_eq!(buffer.failure_count(), 0);
        assert!(buffer.add(entry()));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let buffer = AuditBuffer::new(10, 3, Duration::from_millis(20));
        for _ in 0..3 {
            buffer.record_failure();
        }
        std::thread::sleep(Duration::from_millis(40));
        assert!(buffer.add(entry()));

        buffer.record_failure();
        assert_eq!(buffer.state(), CircuitState::Open);
        assert!(!buffer.add(entry()));
    }

    #[test]
    fn test_success_resets_counter_before_threshold() {
        let buffer = AuditBuffer::new(10, 3, Duration::from_secs(30));
        buffer.record_failure();
        buffer.record_failure();
        buffer.reset_failures();
        buffer.record_failure();
        assert_eq!(buffer.state(), CircuitState::Closed);
    }
}
