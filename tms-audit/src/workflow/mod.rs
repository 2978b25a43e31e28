//! In-process workflow engine
//!
//! Runs activities under a start-to-close deadline, a heartbeat watchdog and
//! a retry policy, and drives timer-based schedules. The audit pipeline uses
//! it for the scheduled buffer flush and the retention pruner.
//!
//! Activity-level retries are independent of the batch processor's own
//! retries. Error kinds listed as non-retryable stop both.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, Result};

pub mod engine;
pub mod flush;

pub use engine::{ScheduleHandle, WorkflowEngine};
pub use flush::{
    BasePayload, BatchOutcome, FlushHandle, ProcessAuditBatchActivity, ProcessAuditBatchPayload, ScheduledFlush,
};

/// Retry behaviour for one activity
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    /// Total attempts including the first one
    pub maximum_attempts: u32,
    pub maximum_interval: Duration,
    pub non_retryable: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_attempts: 3,
            maximum_interval: Duration::from_secs(30),
            non_retryable: vec![ErrorKind::InvalidInput, ErrorKind::DataIntegrity],
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        if !secs.is_finite() || secs >= self.maximum_interval.as_secs_f64() {
            return self.maximum_interval;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Whether a failure of `kind` on attempt `attempt` (1-based) is retried.
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool {
        attempt < self.maximum_attempts && kind.is_retryable() && !self.non_retryable.contains(&kind)
    }
}

/// Deadlines and retry policy for one activity execution
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    pub start_to_close_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            start_to_close_timeout: Duration::from_secs(120),
            heartbeat_timeout: Duration::from_secs(10),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Handle given to a running activity attempt.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    activity: &'static str,
    attempt: u32,
    last_heartbeat: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
}

impl ActivityContext {
    pub(crate) fn new(activity: &'static str, attempt: u32, cancel: CancellationToken) -> Self {
        Self {
            activity,
            attempt,
            last_heartbeat: Arc::new(Mutex::new(Instant::now())),
            cancel,
        }
    }

    /// Report progress; an attempt that stops heartbeating is cancelled.
    pub fn heartbeat(&self, progress: &str) {
        *self.last_heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        tracing::trace!(activity = self.activity, attempt = self.attempt, progress, "Activity heartbeat");
    }

    pub(crate) fn since_heartbeat(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn activity(&self) -> &'static str {
        self.activity
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Cancelled when the attempt times out or the engine shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A unit of retryable work executed by the [`WorkflowEngine`].
#[async_trait]
pub trait Activity: Send + Sync {
    type Input: Send + Sync;
    type Output: Send;

    /// Stable name used in logs
    const NAME: &'static str;

    async fn execute(&self, ctx: &ActivityContext, input: &Self::Input) -> Result<Self::Output>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(ErrorKind::Retryable, 1));
        assert!(policy.should_retry(ErrorKind::Retryable, 2));
        assert!(!policy.should_retry(ErrorKind::Retryable, 3));
        assert!(!policy.should_retry(ErrorKind::InvalidInput, 1));
        assert!(!policy.should_retry(ErrorKind::DataIntegrity, 1));
        assert!(!policy.should_retry(ErrorKind::Permanent, 1));
    }

    #[test]
    fn test_default_activity_options() {
        let options = ActivityOptions::default();
        assert_eq!(options.start_to_close_timeout, Duration::from_secs(120));
        assert_eq!(options.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(options.retry_policy.maximum_attempts, 3);
    }
}
