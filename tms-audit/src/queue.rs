//! Entry queue and worker pool
//!
//! A bounded mpsc channel feeds a fixed number of workers. Each worker keeps
//! a local batch and hands it to the [`BatchProcessor`] when the batch is
//! full, when its flush ticker fires, or when the queue is stopped.
//!
//! Stopping is two-phase: workers are signalled and flush what they hold,
//! then whatever is still in the channel is drained in `batch_size` chunks.
//! Batches resolved after the stop signal are reported in the
//! [`DrainReport`]. If the stop deadline passes, in-flight retries are
//! abandoned, workers are aborted, and every entry still in a worker batch
//! or in the channel is counted as dropped.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::AuditConfig;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::metrics::PipelineMetrics;
use crate::processor::BatchProcessor;

/// Queue sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Channel capacity
    pub capacity: usize,
    /// Largest batch handed to the processor
    pub batch_size: usize,
    /// Worker flush ticker period
    pub flush_interval: Duration,
    pub workers: usize,
}

impl QueueConfig {
    pub fn from_config(config: &AuditConfig) -> Self {
        Self {
            capacity: config.buffer_size.max(1),
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval(),
            workers: config.workers.max(1),
        }
    }
}

/// Outcome of [`EntryQueue::stop`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries stored by the final drain
    pub stored: u64,
    /// Entries whose final batch failed
    pub failed: u64,
    /// Entries abandoned at the deadline
    pub dropped: u64,
    /// True if the deadline elapsed before the drain finished
    pub timed_out: bool,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.dropped == 0 && !self.timed_out
    }

    /// Add another report's counts into this one.
    pub fn merge(&mut self, other: DrainReport) {
        self.stored += other.stored;
        self.failed += other.failed;
        self.dropped += other.dropped;
        self.timed_out |= other.timed_out;
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Entry>>>;

/// Bounded entry queue with its worker pool.
pub struct EntryQueue {
    sender: mpsc::Sender<Entry>,
    receiver: SharedReceiver,
    processor: Arc<BatchProcessor>,
    metrics: Arc<PipelineMetrics>,
    config: QueueConfig,
    closed: AtomicBool,
    /// Entries taken off the channel by the final drain but not yet processed
    draining: AtomicU64,
    /// Entries sitting in worker batches
    held: Arc<AtomicU64>,
    shutdown: CancellationToken,
    abort: CancellationToken,
    workers: Mutex<Vec<JoinHandle<DrainReport>>>,
}

impl EntryQueue {
    pub fn new(config: QueueConfig, processor: Arc<BatchProcessor>, metrics: Arc<PipelineMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            processor,
            metrics,
            config,
            closed: AtomicBool::new(false),
            draining: AtomicU64::new(0),
            held: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool. Calling it again while workers run is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() || self.closed.load(Ordering::Acquire) {
            return;
        }

        for id in 0..self.config.workers {
            let worker = Worker {
                id,
                receiver: self.receiver.clone(),
                processor: self.processor.clone(),
                batch_size: self.config.batch_size,
                flush_interval: self.config.flush_interval,
                held: self.held.clone(),
                shutdown: self.shutdown.child_token(),
                abort: self.abort.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        tracing::info!(
            workers = self.config.workers,
            capacity = self.config.capacity,
            batch_size = self.config.batch_size,
            "Audit queue workers started"
        );
    }

    /// Non-blocking admission; a full queue drops the entry.
    pub fn enqueue(&self, entry: Entry) -> Result<()> {
        self.offer(entry).map_err(|(err, _)| {
            self.metrics.record_dropped();
            err
        })
    }

    /// Admission that waits up to `timeout` for room.
    pub async fn enqueue_with_timeout(&self, entry: Entry, timeout: Duration) -> Result<()> {
        self.offer_within(entry, timeout).await.map_err(|(err, _)| {
            self.metrics.record_dropped();
            err
        })
    }

    /// Like [`enqueue`](Self::enqueue) but hands a refused entry back without
    /// counting it as dropped.
    pub(crate) fn offer(&self, entry: Entry) -> std::result::Result<(), (Error, Entry)> {
        if self.closed.load(Ordering::Acquire) {
            return Err((stopped(), entry));
        }
        match self.sender.try_send(entry) {
            Ok(()) => {
                self.metrics.record_enqueued();
                Ok(())
            }
            Err(TrySendError::Full(entry)) => {
                tracing::warn!(
                    entry_id = %entry.id,
                    resource = %entry.resource,
                    "Audit queue full, entry refused"
                );
                Err((Error::QueueFull, entry))
            }
            Err(TrySendError::Closed(entry)) => Err((stopped(), entry)),
        }
    }

    pub(crate) async fn offer_within(
        &self,
        entry: Entry,
        timeout: Duration,
    ) -> std::result::Result<(), (Error, Entry)> {
        if self.closed.load(Ordering::Acquire) {
            return Err((stopped(), entry));
        }
        match self.sender.send_timeout(entry, timeout).await {
            Ok(()) => {
                self.metrics.record_enqueued();
                Ok(())
            }
            Err(SendTimeoutError::Timeout(entry)) => {
                tracing::warn!(
                    entry_id = %entry.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for audit queue capacity"
                );
                Err((Error::QueueTimeout(timeout), entry))
            }
            Err(SendTimeoutError::Closed(entry)) => Err((stopped(), entry)),
        }
    }

    /// Entries waiting in the channel
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop admissions, flush the workers and drain the channel.
    ///
    /// Only the first call does any work; later calls return an empty report.
    pub async fn stop(&self, timeout: Duration) -> DrainReport {
        if self.closed.swap(true, Ordering::AcqRel) {
            return DrainReport::default();
        }

        let handles: Vec<JoinHandle<DrainReport>> =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let aborts: Vec<AbortHandle> = handles.iter().map(JoinHandle::abort_handle).collect();
        tracing::info!(workers = handles.len(), queued = self.queued(), "Stopping audit queue");
        self.shutdown.cancel();

        let deadline = Instant::now() + timeout;
        let drained = tokio::time::timeout_at(deadline, async {
            let mut report = DrainReport::default();
            for (id, joined) in join_all(handles).await.into_iter().enumerate() {
                match joined {
                    Ok(worker_report) => report.merge(worker_report),
                    Err(e) => {
                        tracing::warn!(worker = id, error = %e, "Audit worker panicked during shutdown");
                    }
                }
            }
            report.merge(self.drain().await);
            report
        })
        .await;

        match drained {
            Ok(report) => {
                tracing::info!(
                    stored = report.stored,
                    failed = report.failed,
                    "Audit queue drained"
                );
                report
            }
            Err(_) => {
                self.abort.cancel();
                for abort in &aborts {
                    abort.abort();
                }
                let unprocessed = self.draining.swap(0, Ordering::AcqRel) + self.held.swap(0, Ordering::AcqRel);
                for _ in 0..unprocessed {
                    self.metrics.record_dropped();
                }
                let dropped = self.discard_remaining().await + unprocessed;
                tracing::error!(
                    timeout_secs = timeout.as_secs(),
                    dropped,
                    "Audit queue drain timed out"
                );
                DrainReport {
                    dropped,
                    timed_out: true,
                    ..DrainReport::default()
                }
            }
        }
    }

    async fn drain(&self) -> DrainReport {
        let remaining = {
            let mut receiver = self.receiver.lock().await;
            receiver.close();
            let mut remaining = Vec::new();
            while let Ok(entry) = receiver.try_recv() {
                remaining.push(entry);
            }
            remaining
        };

        let mut report = DrainReport::default();
        if remaining.is_empty() {
            return report;
        }

        tracing::debug!(entries = remaining.len(), "Draining audit queue");
        self.draining.store(remaining.len() as u64, Ordering::Release);
        let mut remaining = remaining.into_iter().peekable();
        while remaining.peek().is_some() {
            let batch: Vec<Entry> = remaining.by_ref().take(self.config.batch_size).collect();
            let count = batch.len() as u64;
            let outcome = self.processor.process_batch(batch, &self.abort).await;
            self.draining.fetch_sub(count, Ordering::AcqRel);
            match outcome {
                Ok(()) => report.stored += count,
                Err(e) => {
                    tracing::error!(entries = count, error = %e, "Final audit drain batch failed");
                    report.failed += count;
                }
            }
        }
        report
    }

    async fn discard_remaining(&self) -> u64 {
        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut dropped = 0;
        while receiver.try_recv().is_ok() {
            self.metrics.record_dropped();
            dropped += 1;
        }
        dropped
    }
}

fn stopped() -> Error {
    Error::ServiceStopped("audit queue is closed".into())
}

struct Worker {
    id: usize,
    receiver: SharedReceiver,
    processor: Arc<BatchProcessor>,
    batch_size: usize,
    flush_interval: Duration,
    held: Arc<AtomicU64>,
    shutdown: CancellationToken,
    abort: CancellationToken,
}

impl Worker {
    /// Returns the outcome of batches resolved after the stop signal.
    async fn run(self) -> DrainReport {
        let mut batch: Vec<Entry> = Vec::with_capacity(self.batch_size);
        let mut report = DrainReport::default();
        let mut ticker = tokio::time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(worker = self.id, "Audit worker started");

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    self.flush(&mut batch, &mut report).await;
                    break;
                }
                _ = ticker.tick() => {
                    self.flush(&mut batch, &mut report).await;
                }
                received = async { self.receiver.lock().await.recv().await } => {
                    match received {
                        Some(entry) => {
                            batch.push(entry);
                            self.held.fetch_add(1, Ordering::AcqRel);
                            if batch.len() >= self.batch_size {
                                self.flush(&mut batch, &mut report).await;
                            }
                        }
                        None => {
                            self.flush(&mut batch, &mut report).await;
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!(worker = self.id, stored = report.stored, failed = report.failed, "Audit worker stopped");
        report
    }

    async fn flush(&self, batch: &mut Vec<Entry>, report: &mut DrainReport) {
        if batch.is_empty() {
            return;
        }
        let entries = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        let count = entries.len() as u64;
        let outcome = self.processor.process_batch(entries, &self.abort).await;
        let _ = self
            .held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| Some(held.saturating_sub(count)));

        let stopping = self.shutdown.is_cancelled();
        match outcome {
            Ok(()) if stopping => report.stored += count,
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(worker = self.id, entries = count, error = %e, "Audit batch dropped by worker");
                if stopping {
                    report.failed += count;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AuditBuffer;
    use crate::entry::{Operation, Resource};
    use crate::error::ErrorKind;
    use crate::processor::RetryConfig;
    use crate::repository::{MemoryAuditRepository, RepositoryErrorKind};

    fn entry(i: usize) -> Entry {
        Entry::new(Resource::Shipment, format!("shp_{i}"), Operation::Create, "usr_1", "org_1", "bu_1")
    }

    fn queue(repo: Arc<MemoryAuditRepository>, config: QueueConfig) -> (EntryQueue, Arc<PipelineMetrics>) {
        let metrics = Arc::new(PipelineMetrics::new());
        let buffer = Arc::new(AuditBuffer::new(config.capacity, 3, Duration::from_secs(30)));
        let processor = Arc::new(BatchProcessor::new(
            repo,
            buffer,
            metrics.clone(),
            RetryConfig {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        ));
        (EntryQueue::new(config, processor, metrics.clone()), metrics)
    }

    fn config(capacity: usize, batch_size: usize, workers: usize) -> QueueConfig {
        QueueConfig {
            capacity,
            batch_size,
            flush_interval: Duration::from_secs(10),
            workers,
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let (queue, metrics) = queue(repo, config(2, 2, 1));

        queue.enqueue(entry(1)).unwrap();
        queue.enqueue(entry(2)).unwrap();
        assert_eq!(queue.queued(), 2);

        let err = queue.enqueue(entry(3)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueFull);
        assert_eq!(metrics.dropped(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_with_timeout_expires() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let (queue, metrics) = queue(repo, config(1, 1, 1));
        queue.enqueue(entry(1)).unwrap();

        let err = queue
            .enqueue_with_timeout(entry(2), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueTimeout);
        assert_eq!(metrics.dropped(), 1);
    }

    #[tokio::test]
    async fn test_full_batches_are_written_by_workers() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let (queue, _) = queue(repo.clone(), config(16, 2, 2));
        queue.start();

        for i in 0..4 {
            queue.enqueue(entry(i)).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while repo.len() < 4 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(repo.len(), 4);
        assert!(queue.stop(Duration::from_secs(1)).await.is_clean());
    }

    #[tokio::test]
    async fn test_stop_flushes_partial_batches_and_drains() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let (queue, _) = queue(repo.clone(), config(16, 10, 1));
        queue.start();

        for i in 0..3 {
            queue.enqueue(entry(i)).unwrap();
        }

        let report = queue.stop(Duration::from_secs(5)).await;
        assert!(report.is_clean());
        assert_eq!(repo.len(), 3);

        let err = queue.enqueue(entry(9)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceStopped);
        assert_eq!(queue.stop(Duration::from_secs(1)).await, DrainReport::default());
    }

    #[tokio::test]
    async fn test_stop_without_workers_drains_channel_in_batches() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let (queue, metrics) = queue(repo.clone(), config(8, 2, 1));

        for i in 0..5 {
            queue.enqueue(entry(i)).unwrap();
        }
        let report = queue.stop(Duration::from_secs(5)).await;
        assert_eq!(report.stored, 5);
        assert_eq!(repo.len(), 5);
        assert_eq!(repo.insert_calls(), 3);
        assert_eq!(metrics.processed_entries(), 5);
    }

    #[tokio::test]
    async fn test_worker_flush_failure_during_stop_is_reported() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let (queue, _) = queue(repo.clone(), config(16, 10, 1));
        queue.start();

        queue.enqueue(entry(1)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.queued() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        repo.fail_next_inserts(1, RepositoryErrorKind::DataIntegrity);

        let report = queue.stop(Duration::from_secs(5)).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.stored, 0);
        assert!(!report.is_clean());
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_stop_deadline_counts_entries_held_by_workers() {
        let repo = Arc::new(MemoryAuditRepository::new());
        repo.set_insert_latency(Duration::from_secs(60));
        let (queue, metrics) = queue(repo.clone(), config(8, 10, 1));
        queue.start();

        for i in 0..2 {
            queue.enqueue(entry(i)).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.queued() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let report = queue.stop(Duration::from_millis(50)).await;
        assert!(report.timed_out);
        assert_eq!(report.dropped, 2);
        assert_eq!(metrics.dropped(), 2);
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_stop_deadline_abandons_remaining() {
        let repo = Arc::new(MemoryAuditRepository::new());
        repo.set_insert_latency(Duration::from_secs(60));
        let (queue, metrics) = queue(repo.clone(), config(8, 1, 1));

        for i in 0..3 {
            queue.enqueue(entry(i)).unwrap();
        }
        let report = queue.stop(Duration::from_millis(50)).await;
        assert!(report.timed_out);
        assert_eq!(report.dropped, 3);
        assert!(repo.is_empty());
        assert!(!report.is_clean());
        assert_eq!(metrics.dropped(), 3);
    }
}
