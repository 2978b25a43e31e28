//! Batch processor
//!
//! Persists one batch through the repository, retrying retryable failures
//! with exponential backoff. The outcome of every batch is reported to the
//! audit buffer's circuit breaker.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::buffer::AuditBuffer;
use crate::config::AuditConfig;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::ids::BatchId;
use crate::metrics::PipelineMetrics;
use crate::repository::AuditRepository;

/// Backoff settings for batch inserts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    pub fn from_config(config: &AuditConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// `base * 2^attempt`, capped at `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Retry-wrapped durable insert of one batch.
pub struct BatchProcessor {
    repository: Arc<dyn AuditRepository>,
    buffer: Arc<AuditBuffer>,
    metrics: Arc<PipelineMetrics>,
    retry: RetryConfig,
}

impl BatchProcessor {
    pub fn new(
        repository: Arc<dyn AuditRepository>,
        buffer: Arc<AuditBuffer>,
        metrics: Arc<PipelineMetrics>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            repository,
            buffer,
            metrics,
            retry,
        }
    }

    pub fn repository(&self) -> &Arc<dyn AuditRepository> {
        &self.repository
    }

    /// Insert `entries`, retrying retryable failures.
    ///
    /// Cancelling `cancel` abandons the remaining retries. A batch that is not
    /// stored is counted as failed and is not requeued.
    pub async fn process_batch(&self, entries: Vec<Entry>, cancel: &CancellationToken) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let batch_id = BatchId::new();
        let count = entries.len();
        let mut attempt: u32 = 0;

        loop {
            let err = match self.repository.insert_audit_entries(&entries).await {
                Ok(()) => {
                    self.buffer.reset_failures();
                    self.metrics.record_batch(count);
                    tracing::debug!(batch_id = %batch_id, entries = count, attempt, "Audit batch stored");
                    return Ok(());
                }
                Err(e) => Error::from(e),
            };

            if !err.is_retryable() {
                tracing::error!(
                    batch_id = %batch_id,
                    entries = count,
                    error = %err,
                    kind = %err.kind(),
                    "Audit batch rejected"
                );
                return Err(self.fail(count, err));
            }

            if attempt >= self.retry.max_retries {
                tracing::error!(
                    batch_id = %batch_id,
                    entries = count,
                    attempts = attempt + 1,
                    error = %err,
                    "Audit batch retries exhausted"
                );
                return Err(self.fail(
                    count,
                    Error::MaxRetriesExceeded {
                        attempts: attempt + 1,
                        source: Box::new(err),
                    },
                ));
            }

            let delay = self.retry.backoff(attempt);
            tracing::warn!(
                batch_id = %batch_id,
                entries = count,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Audit batch insert failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::warn!(batch_id = %batch_id, entries = count, "Audit batch retry cancelled");
                    return Err(self.fail(
                        count,
                        Error::DeadlineExceeded(format!("batch {} abandoned after {} attempts", batch_id, attempt + 1)),
                    ));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    fn fail(&self, count: usize, err: Error) -> Error {
        self.buffer.record_failure();
        self.metrics.record_failed_batch(count);
        err
    }
}
