//! Scheduled buffer flush
//!
//! [`ScheduledFlush`] drains the audit buffer on every tick and persists the
//! staged entries through [`ProcessAuditBatchActivity`]. When the buffer
//! stays empty the tick interval backs off, and returns to the base interval
//! as soon as there is work again.
//!
//! Entries taken from the buffer stay in the flush's in-flight list until
//! their batch resolves. If the engine shuts down mid-tick, or the tick is
//! aborted, [`FlushHandle::take_in_flight`] hands them to the final drain.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{Activity, ActivityContext, ActivityOptions, WorkflowEngine};
use crate::buffer::AuditBuffer;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::ids::BatchId;
use crate::processor::BatchProcessor;

/// Consecutive empty ticks tolerated before the interval starts doubling
pub const EMPTY_TICKS_BEFORE_BACKOFF: u32 = 3;

/// Longest interval the adaptive flush backs off to
pub const MAX_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// User recorded on payloads built by the scheduler itself
pub const SYSTEM_USER: &str = "system";

/// Fields common to every workflow payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasePayload {
    pub timestamp: i64,
    pub organization_id: String,
    pub business_unit_id: String,
    pub user_id: String,
}

/// Input of [`ProcessAuditBatchActivity`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessAuditBatchPayload {
    #[serde(flatten)]
    pub base: BasePayload,
    pub entries: Vec<Entry>,
    pub batch_id: BatchId,
}

impl ProcessAuditBatchPayload {
    /// Build a payload for entries staged by the scheduler.
    ///
    /// The tenant fields come from the first entry; a batch may span tenants.
    pub fn for_entries(entries: Vec<Entry>) -> Self {
        let (organization_id, business_unit_id) = entries
            .first()
            .map(|e| (e.organization_id.clone(), e.business_unit_id.clone()))
            .unwrap_or_default();
        Self {
            base: BasePayload {
                timestamp: chrono::Utc::now().timestamp(),
                organization_id,
                business_unit_id,
                user_id: SYSTEM_USER.to_string(),
            },
            entries,
            batch_id: BatchId::new(),
        }
    }
}

/// Result of one processed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub batch_id: BatchId,
    pub processed: usize,
}

/// Validates a staged batch and persists it through the batch processor.
pub struct ProcessAuditBatchActivity {
    processor: Arc<BatchProcessor>,
}

impl ProcessAuditBatchActivity {
    pub fn new(processor: Arc<BatchProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl Activity for ProcessAuditBatchActivity {
    type Input = ProcessAuditBatchPayload;
    type Output = BatchOutcome;
    const NAME: &'static str = "process_audit_batch";

    async fn execute(&self, ctx: &ActivityContext, input: &ProcessAuditBatchPayload) -> Result<BatchOutcome> {
        ctx.heartbeat("validating batch");
        if input.entries.is_empty() {
            return Ok(BatchOutcome {
                batch_id: input.batch_id.clone(),
                processed: 0,
            });
        }
        for entry in &input.entries {
            entry.validate().map_err(|e| {
                Error::InvalidInput(format!("batch {} entry {}: {}", input.batch_id, entry.id, e))
            })?;
        }

        ctx.heartbeat("inserting batch");
        self.processor
            .process_batch(input.entries.clone(), ctx.cancellation())
            .await?;

        ctx.heartbeat("batch stored");
        tracing::debug!(
            batch_id = %input.batch_id,
            entries = input.entries.len(),
            organization_id = %input.base.organization_id,
            "Processed audit batch"
        );
        Ok(BatchOutcome {
            batch_id: input.batch_id.clone(),
            processed: input.entries.len(),
        })
    }
}

/// Timer-driven drain of the audit buffer with adaptive backoff.
pub struct ScheduledFlush {
    buffer: Arc<AuditBuffer>,
    engine: Arc<WorkflowEngine>,
    activity: ProcessAuditBatchActivity,
    options: ActivityOptions,
    batch_size: usize,
    base_interval: Duration,
    interval: Duration,
    empty_ticks: u32,
    /// Taken from the buffer, batch not yet resolved
    in_flight: Vec<Entry>,
}

/// Access to a spawned [`ScheduledFlush`]
#[derive(Clone)]
pub struct FlushHandle {
    flush: Arc<tokio::sync::Mutex<ScheduledFlush>>,
}

impl FlushHandle {
    /// Take entries the flush took from the buffer but did not resolve.
    ///
    /// Waits for a running tick; call after the engine has shut down.
    pub async fn take_in_flight(&self) -> Vec<Entry> {
        std::mem::take(&mut self.flush.lock().await.in_flight)
    }
}

impl ScheduledFlush {
    pub fn new(
        buffer: Arc<AuditBuffer>,
        engine: Arc<WorkflowEngine>,
        processor: Arc<BatchProcessor>,
        batch_size: usize,
        base_interval: Duration,
    ) -> Self {
        Self {
            buffer,
            engine,
            activity: ProcessAuditBatchActivity::new(processor),
            options: ActivityOptions::default(),
            batch_size: batch_size.max(1),
            base_interval,
            interval: base_interval,
            empty_ticks: 0,
            in_flight: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ActivityOptions) -> Self {
        self.options = options;
        self
    }

    /// Current tick interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Entries taken from the buffer whose batch has not resolved
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Drain the buffer once and return the delay before the next tick.
    pub async fn tick(&mut self) -> Duration {
        let staged = self.buffer.flush_and_reset();
        if staged.is_empty() {
            self.empty_ticks = self.empty_ticks.saturating_add(1);
            if self.empty_ticks > EMPTY_TICKS_BEFORE_BACKOFF {
                let ceiling = MAX_FLUSH_INTERVAL.max(self.base_interval);
                let next = self.interval.saturating_mul(2).min(ceiling);
                if next != self.interval {
                    tracing::debug!(interval_secs = next.as_secs(), "Audit buffer idle, slowing scheduled flush");
                }
                self.interval = next;
            }
            return self.interval;
        }

        self.empty_ticks = 0;
        self.interval = self.base_interval;

        let total = staged.len();
        self.in_flight.extend(staged);
        let mut stored = 0;
        let mut failed = 0;
        while !self.in_flight.is_empty() {
            if self.engine.is_shut_down() {
                tracing::info!(
                    entries = self.in_flight.len(),
                    "Scheduled audit flush interrupted by shutdown"
                );
                break;
            }

            let take = self.batch_size.min(self.in_flight.len());
            let payload = ProcessAuditBatchPayload::for_entries(self.in_flight[..take].to_vec());
            let outcome = self
                .engine
                .execute_activity(&self.activity, &payload, &self.options)
                .await;
            match outcome {
                Ok(outcome) => stored += outcome.processed,
                Err(e) if self.engine.is_shut_down() => {
                    tracing::warn!(
                        batch_id = %payload.batch_id,
                        entries = take,
                        error = %e,
                        "Scheduled audit batch interrupted, keeping it for the final drain"
                    );
                    break;
                }
                Err(e) => {
                    failed += take;
                    tracing::error!(
                        batch_id = %payload.batch_id,
                        entries = take,
                        error = %e,
                        "Scheduled audit flush failed"
                    );
                }
            }
            self.in_flight.drain(..take);
        }

        tracing::info!(
            staged = total,
            stored,
            failed,
            in_flight = self.in_flight.len(),
            "Scheduled audit flush completed"
        );
        self.interval
    }

    /// Register this flush on the engine under `name`.
    pub fn spawn(self, name: &str) -> FlushHandle {
        let engine = self.engine.clone();
        let first = self.interval;
        let handle = FlushHandle {
            flush: Arc::new(tokio::sync::Mutex::new(self)),
        };
        let flush = handle.flush.clone();
        engine.schedule(name, first, move || {
            let flush = flush.clone();
            async move {
                let next = flush.lock().await.tick().await;
                next
            }
        });
        handle
    }
}
