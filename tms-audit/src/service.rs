//! Audit service facade
//!
//! [`AuditService`] owns the whole pipeline: it builds entries from
//! [`LogActionParams`] and options, validates and sanitizes them, and
//! dispatches them either through the batching queue or, for critical
//! entries, straight to the repository. It also supervises the worker pool,
//! the scheduled buffer flush, the health monitor and retention runs.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tms_audit::prelude::*;
//!
//! # async fn run() -> tms_audit::error::Result<()> {
//! let service = AuditService::new(AuditConfig::load()?, Arc::new(MemoryAuditRepository::new()))?;
//! service.start()?;
//!
//! let params = LogActionParams::new(Resource::Shipment, "shp_123", Operation::Update, "usr_1", "org_1", "bu_1");
//! service
//!     .log_action(params, vec![options::comment("Rerouted"), options::diff(&json!({"city": "Austin"}), &json!({"city": "Dallas"}))])
//!     .await?;
//!
//! service.stop().await?;
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::buffer::{AuditBuffer, CircuitState};
use crate::config::AuditConfig;
use crate::entry::{DataMap, Entry, Operation, Resource};
use crate::error::{Error, Result};
use crate::metrics::{Gauges, MetricsSnapshot, PipelineMetrics};
use crate::options::{self, LogOption};
use crate::processor::{BatchProcessor, RetryConfig};
use crate::queue::{DrainReport, EntryQueue, QueueConfig};
use crate::repository::{
    AuditRepository, GetByIdRequest, ListByResourceRequest, ListOptions, ListResult, RecentEntriesRequest,
    ResourceOperationRequest,
};
use crate::retention::{DeleteAuditEntriesActivity, RetentionReport, RetentionRun, RetentionStore};
use crate::sensitive::{MaskStrategy, SanitizeMetrics, SensitiveDataManager, SensitiveField};
use crate::workflow::{ActivityOptions, FlushHandle, ScheduledFlush, WorkflowEngine};

/// Version tag written into every entry's metadata
pub const AUDIT_VERSION: &str = "v1";

/// Errors above this count with an open circuit degrade the service
pub const DEGRADED_ERROR_THRESHOLD: u64 = 5;

/// Buffer utilisation (percent) that the health monitor warns about
pub const HIGH_UTILIZATION_PCT: f64 = 80.0;

const FLUSH_SCHEDULE: &str = "audit-scheduled-flush";
const HEALTH_SCHEDULE: &str = "audit-health-monitor";
const RETENTION_SCHEDULE: &str = "audit-retention";
const SCHEDULE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const STABLE_HEALTH_INTERVAL: Duration = Duration::from_secs(60);
const STABLE_HEALTH_CHECKS: u32 = 5;

/// Lifecycle state of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Initializing,
    Running,
    Stopping,
    Stopped,
    Degraded,
}

impl ServiceState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::Running => 1,
            Self::Stopping => 2,
            Self::Stopped => 3,
            Self::Degraded => 4,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Stopped,
            4 => Self::Degraded,
            _ => Self::Initializing,
        }
    }

    /// Lowercase name, as reported by [`AuditService::status`]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Degraded => "degraded",
        }
    }

    /// Whether `log_action` accepts writes in this state.
    ///
    /// `Degraded` accepts writes only while the service has not been
    /// stopped; a stop is terminal whatever state it ends in.
    pub fn accepts_writes(&self) -> bool {
        matches!(self, Self::Running | Self::Degraded)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ServiceState) -> Self {
        Self(AtomicU8::new(state.to_u8()))
    }

    fn load(&self) -> ServiceState {
        ServiceState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: ServiceState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }

    fn transition(&self, from: ServiceState, to: ServiceState) -> bool {
        self.0
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// What a caller reports for one audited action
#[derive(Debug, Clone, PartialEq)]
pub struct LogActionParams {
    pub resource: Resource,
    pub resource_id: String,
    pub operation: Operation,
    pub user_id: String,
    pub organization_id: String,
    pub business_unit_id: String,
    pub previous_state: DataMap,
    pub current_state: DataMap,
    /// Same as passing [`options::critical`]
    pub critical: bool,
}

impl LogActionParams {
    /// Params with empty state maps for a non-critical entry.
    pub fn new(
        resource: Resource,
        resource_id: impl Into<String>,
        operation: Operation,
        user_id: impl Into<String>,
        organization_id: impl Into<String>,
        business_unit_id: impl Into<String>,
    ) -> Self {
        Self {
            resource,
            resource_id: resource_id.into(),
            operation,
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            business_unit_id: business_unit_id.into(),
            previous_state: DataMap::new(),
            current_state: DataMap::new(),
            critical: false,
        }
    }

    /// State of the resource before the action
    #[must_use]
    pub fn with_previous_state(mut self, state: DataMap) -> Self {
        self.previous_state = state;
        self
    }

    /// State of the resource after the action
    #[must_use]
    pub fn with_current_state(mut self, state: DataMap) -> Self {
        self.current_state = state;
        self
    }

    /// Write the entry synchronously.
    #[must_use]
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

/// The audit pipeline facade.
pub struct AuditService {
    config: AuditConfig,
    state: Arc<StateCell>,
    /// Set by the first `stop`; never cleared
    stopped: AtomicBool,
    sdm: Arc<SensitiveDataManager>,
    repository: Arc<dyn AuditRepository>,
    buffer: Arc<AuditBuffer>,
    processor: Arc<BatchProcessor>,
    queue: EntryQueue,
    engine: Arc<WorkflowEngine>,
    metrics: Arc<PipelineMetrics>,
    flush: Mutex<Option<FlushHandle>>,
    default_fields: RwLock<DataMap>,
    retention: Mutex<Option<(Arc<dyn RetentionStore>, Duration)>>,
}

impl AuditService {
    /// Build a stopped service; call [`start`](Self::start) to accept writes.
    pub fn new(config: AuditConfig, repository: Arc<dyn AuditRepository>) -> Result<Self> {
        let config = config.normalized();
        let sdm = Arc::new(SensitiveDataManager::from_config(&config)?);
        let metrics = Arc::new(PipelineMetrics::new());
        let buffer = Arc::new(AuditBuffer::new(
            config.buffer_size,
            config.circuit_failure_threshold,
            config.circuit_cooldown(),
        ));
        let processor = Arc::new(BatchProcessor::new(
            repository.clone(),
            buffer.clone(),
            metrics.clone(),
            RetryConfig::from_config(&config),
        ));
        let queue = EntryQueue::new(QueueConfig::from_config(&config), processor.clone(), metrics.clone());

        let mut default_fields = DataMap::new();
        default_fields.insert("auditVersion".to_string(), Value::String(AUDIT_VERSION.to_string()));
        default_fields.insert("environment".to_string(), Value::String(config.environment.clone()));

        tracing::info!(
            service = %config.service_name,
            buffer_size = config.buffer_size,
            batch_size = config.batch_size,
            workers = config.workers,
            flush_interval_secs = config.flush_interval_secs,
            "Audit service created"
        );

        Ok(Self {
            config,
            state: Arc::new(StateCell::new(ServiceState::Initializing)),
            stopped: AtomicBool::new(false),
            sdm,
            repository,
            buffer,
            processor,
            queue,
            engine: Arc::new(WorkflowEngine::new()),
            metrics,
            flush: Mutex::new(None),
            default_fields: RwLock::new(default_fields),
            retention: Mutex::new(None),
        })
    }

    /// Connect to Postgres, create the schema and build the service.
    #[cfg(feature = "database")]
    pub async fn connect(config: AuditConfig) -> Result<Self> {
        let database = config
            .database
            .clone()
            .ok_or_else(|| Error::InvalidInput("database configuration is required".into()))?;
        let repository = crate::repository::pg::PgAuditRepository::connect(&database).await?;
        repository.initialize().await?;
        Self::new(config, Arc::new(repository))
    }

    /// Prune entries on a schedule once the service starts.
    ///
    /// Has no effect on an already running service.
    pub fn with_retention(self, store: Arc<dyn RetentionStore>, interval: Duration) -> Self {
        *self.retention.lock().unwrap_or_else(PoisonError::into_inner) = Some((store, interval));
        self
    }

    /// Launch the workers, scheduled flush, health monitor and retention schedule.
    ///
    /// Must be called inside a Tokio runtime. Starting a running service is a
    /// no-op; a stopped service cannot be restarted.
    pub fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            let state = self.state.load();
            tracing::warn!(state = %state, "Audit service cannot be restarted after stop");
            return Err(Error::ServiceStopped(state.to_string()));
        }
        if !self.state.transition(ServiceState::Initializing, ServiceState::Running) {
            let state = self.state.load();
            if state.accepts_writes() {
                tracing::warn!("Audit service is already running");
                return Ok(());
            }
            return Err(Error::ServiceStopped(state.to_string()));
        }

        self.queue.start();

        let flush = ScheduledFlush::new(
            self.buffer.clone(),
            self.engine.clone(),
            self.processor.clone(),
            self.config.batch_size,
            self.config.flush_interval(),
        )
        .spawn(FLUSH_SCHEDULE);
        *self.flush.lock().unwrap_or_else(PoisonError::into_inner) = Some(flush);

        self.spawn_health_monitor();

        let retention = self.retention.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some((store, interval)) = retention {
            let activity = Arc::new(DeleteAuditEntriesActivity::new(store, self.repository.clone()));
            let engine = self.engine.clone();
            self.engine.schedule_periodic(RETENTION_SCHEDULE, interval, move || {
                let activity = activity.clone();
                let engine = engine.clone();
                async move {
                    if let Err(e) = engine
                        .execute_activity(activity.as_ref(), &RetentionRun::default(), &ActivityOptions::default())
                        .await
                    {
                        tracing::error!(error = %e, "Scheduled retention run failed");
                    }
                }
            });
        }

        tracing::info!(
            workers = self.config.workers,
            flush_interval_secs = self.config.flush_interval_secs,
            "Audit service started"
        );
        Ok(())
    }

    fn spawn_health_monitor(&self) {
        let state = self.state.clone();
        let buffer = self.buffer.clone();
        let metrics = self.metrics.clone();
        let sdm = self.sdm.clone();
        let base = self.config.health_check_interval();
        let healthy_streak = Arc::new(AtomicU32::new(0));

        self.engine.schedule(HEALTH_SCHEDULE, base, move || {
            let healthy = check_health(&state, &buffer, &metrics, &sdm);
            let streak = if healthy {
                healthy_streak.fetch_add(1, Ordering::Relaxed) + 1
            } else {
                healthy_streak.store(0, Ordering::Relaxed);
                0
            };
            let next = if streak > STABLE_HEALTH_CHECKS {
                STABLE_HEALTH_INTERVAL.max(base)
            } else {
                base
            };
            async move { next }
        });
    }

    /// Stop accepting writes and drain the pipeline.
    ///
    /// Ends `Stopped` on a clean drain and `Degraded` otherwise; either way
    /// the service rejects writes from then on and cannot be restarted.
    /// Fails only when the drain lost entries and stored none.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.state.transition(ServiceState::Initializing, ServiceState::Stopped) {
            tracing::info!("Audit service stopped before start");
            return Ok(());
        }
        self.state.store(ServiceState::Stopping);

        tracing::info!(queued = self.queue.queued(), buffered = self.buffer.len(), "Stopping audit service");
        let timeout = self.config.stop_timeout();
        let deadline = Instant::now() + timeout;

        self.engine.shutdown(SCHEDULE_SHUTDOWN_TIMEOUT.min(timeout)).await;
        let flush = self.flush.lock().unwrap_or_else(PoisonError::into_inner).take();
        let in_flight = match flush {
            Some(flush) => flush.take_in_flight().await,
            None => Vec::new(),
        };

        let queue_report = self.queue.stop(deadline.saturating_duration_since(Instant::now())).await;
        let buffer_report = self.drain_buffer(in_flight, deadline).await;

        let stored = queue_report.stored + buffer_report.stored;
        let lost = queue_report.failed + queue_report.dropped + buffer_report.failed + buffer_report.dropped;
        let clean = queue_report.is_clean() && buffer_report.is_clean();

        if clean {
            self.state.store(ServiceState::Stopped);
            tracing::info!(stored, "Audit service stopped");
            return Ok(());
        }

        self.state.store(ServiceState::Degraded);
        tracing::error!(stored, lost, "Audit service stopped with undrained entries");
        if stored == 0 && lost > 0 {
            return Err(Error::Internal(format!("final audit drain failed: {} entries not stored", lost)));
        }
        Ok(())
    }

    /// Persist staged entries, the scheduled flush's unresolved ones first.
    async fn drain_buffer(&self, in_flight: Vec<Entry>, deadline: Instant) -> DrainReport {
        let mut staged = in_flight;
        staged.extend(self.buffer.flush_and_reset());
        let mut report = DrainReport::default();
        if staged.is_empty() {
            return report;
        }

        let cancel = CancellationToken::new();
        let mut staged = staged.into_iter().peekable();
        while staged.peek().is_some() {
            let batch: Vec<Entry> = staged.by_ref().take(self.config.batch_size.max(1)).collect();
            let count = batch.len() as u64;
            match tokio::time::timeout_at(deadline, self.processor.process_batch(batch, &cancel)).await {
                Ok(Ok(())) => report.stored += count,
                Ok(Err(_)) => report.failed += count,
                Err(_) => {
                    report.timed_out = true;
                    report.dropped += count + staged.by_ref().count() as u64;
                }
            }
        }

        for _ in 0..report.dropped {
            self.metrics.record_dropped();
        }
        if !report.is_clean() {
            tracing::error!(
                stored = report.stored,
                failed = report.failed,
                dropped = report.dropped,
                "Audit buffer drain incomplete"
            );
        }
        report
    }

    /// Record one audited action.
    ///
    /// Options run in order after the default metadata is applied; the
    /// resulting entry is validated and sanitized before dispatch.
    pub async fn log_action(&self, params: LogActionParams, opts: impl IntoIterator<Item = LogOption>) -> Result<()> {
        let state = self.state.load();
        if self.stopped.load(Ordering::Acquire) || !state.accepts_writes() {
            tracing::warn!(state = %state, "Audit entry rejected, service not running");
            return Err(Error::ServiceStopped(state.to_string()));
        }

        let mut entry = self.build_entry(params);
        options::apply_all(&mut entry, opts)?;
        if let Err(e) = entry.validate() {
            tracing::error!(resource = %entry.resource, error = %e, "Invalid audit entry");
            return Err(e);
        }

        self.sdm.sanitize_entry(&mut entry).map_err(|e| match e {
            Error::SanitizationFailed(_) => e,
            other => Error::SanitizationFailed(other.to_string()),
        })?;

        if entry.critical {
            self.write_critical(entry).await
        } else {
            self.queue.enqueue(entry)
        }
    }

    fn build_entry(&self, params: LogActionParams) -> Entry {
        let mut entry = Entry::new(
            params.resource,
            params.resource_id,
            params.operation,
            params.user_id,
            params.organization_id,
            params.business_unit_id,
        );
        entry.previous_state = params.previous_state;
        entry.current_state = params.current_state;
        entry.critical = params.critical;
        entry.metadata = self.default_fields.read().unwrap_or_else(PoisonError::into_inner).clone();
        entry
    }

    /// Synchronous insert with a deadline, then staged fallbacks.
    ///
    /// A retryable failure moves the entry to the queue within the remaining
    /// deadline, then to the audit buffer. A deadline overrun is returned as
    /// is so the entry cannot be committed twice.
    async fn write_critical(&self, entry: Entry) -> Result<()> {
        let deadline = Instant::now() + self.config.critical_timeout();
        let insert = tokio::time::timeout_at(
            deadline,
            self.repository.insert_audit_entries(std::slice::from_ref(&entry)),
        )
        .await;

        let err = match insert {
            Ok(Ok(())) => {
                self.metrics.record_critical_write();
                tracing::debug!(entry_id = %entry.id, resource = %entry.resource, "Critical audit entry stored");
                return Ok(());
            }
            Ok(Err(e)) => Error::from(e),
            Err(_) => {
                self.metrics.record_error();
                tracing::error!(entry_id = %entry.id, "Critical audit insert timed out");
                return Err(Error::DeadlineExceeded(format!(
                    "critical insert of {} exceeded {:?}",
                    entry.id,
                    self.config.critical_timeout()
                )));
            }
        };

        if !err.is_retryable() {
            self.metrics.record_error();
            tracing::error!(entry_id = %entry.id, error = %err, "Critical audit insert failed");
            return Err(err);
        }

        self.metrics.record_critical_fallback();
        tracing::warn!(entry_id = %entry.id, error = %err, "Critical audit insert failed, falling back to queue");

        let remaining = deadline.saturating_duration_since(Instant::now());
        let wait = remaining.min(self.config.enqueue_timeout());
        let (queue_err, entry) = match self.queue.offer_within(entry, wait).await {
            Ok(()) => return Ok(()),
            Err((e @ (Error::QueueFull | Error::QueueTimeout(_)), entry)) => (e, entry),
            Err((e, _)) => {
                self.metrics.record_dropped();
                return Err(e);
            }
        };

        let entry_id = entry.id.clone();
        if self.buffer.add(entry) {
            tracing::warn!(entry_id = %entry_id, "Critical audit entry staged in buffer");
            return Ok(());
        }

        self.metrics.record_dropped();
        tracing::error!(
            entry_id = %entry_id,
            circuit_state = %self.buffer.state(),
            "Critical audit entry dropped, queue and buffer refused it"
        );
        Err(queue_err)
    }

    /// Tenant entries, newest first, one page at a time.
    pub async fn list(&self, options: &ListOptions) -> Result<ListResult> {
        self.repository.list(options).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to list audit entries");
            Error::from(e)
        })
    }

    /// History of one domain object, oldest first.
    pub async fn list_by_resource_id(&self, request: &ListByResourceRequest) -> Result<ListResult> {
        self.repository.list_by_resource_id(request).await.map_err(|e| {
            tracing::error!(resource_id = %request.resource_id, error = %e, "Failed to list audit entries by resource");
            Error::from(e)
        })
    }

    /// One entry of the caller's tenant; `NotFound` otherwise.
    pub async fn get_by_id(&self, request: &GetByIdRequest) -> Result<Entry> {
        self.repository.get_by_id(request).await.map_err(Error::from)
    }

    /// Entries recording `operation` on one object, optionally since a time.
    pub async fn get_by_resource_and_operation(&self, request: &ResourceOperationRequest) -> Result<Vec<Entry>> {
        self.repository
            .get_by_resource_and_operation(request)
            .await
            .map_err(Error::from)
    }

    /// Tenant entries at or after a timestamp, optionally narrowed.
    pub async fn get_recent_entries(&self, request: &RecentEntriesRequest) -> Result<Vec<Entry>> {
        self.repository.get_recent_entries(request).await.map_err(Error::from)
    }

    /// Run one retention pass now.
    pub async fn run_retention(&self, store: Arc<dyn RetentionStore>, run: RetentionRun) -> Result<RetentionReport> {
        let activity = DeleteAuditEntriesActivity::new(store, self.repository.clone());
        self.engine
            .execute_activity(&activity, &run, &ActivityOptions::default())
            .await
    }

    /// Install redaction rules for `resource`, merged with existing ones.
    pub fn register_sensitive_fields(&self, resource: Resource, fields: Vec<SensitiveField>) -> Result<()> {
        self.sdm.register_sensitive_fields(resource, fields)
    }

    /// Add or replace a metadata field written into every new entry.
    pub fn set_default_field(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.default_fields
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    /// Current lifecycle state
    pub fn status(&self) -> ServiceState {
        self.state.load()
    }

    /// Pipeline counters with current queue, buffer and breaker gauges.
    pub fn metrics(&self) -> MetricsSnapshot {
        let sanitize = self.sdm.metrics();
        self.metrics.snapshot(Gauges {
            queued: self.queue.queued(),
            buffered: self.buffer.len(),
            circuit_state: self.buffer.state(),
            failure_count: self.buffer.failure_count(),
            sanitized_fields: sanitize.sanitized,
            sanitize_errors: sanitize.errors,
        })
    }

    /// Redaction counters
    pub fn sanitize_metrics(&self) -> SanitizeMetrics {
        self.sdm.metrics()
    }

    /// Change how masked values are rendered from now on.
    pub fn set_mask_strategy(&self, strategy: MaskStrategy) {
        self.sdm.set_mask_strategy(strategy);
    }

    /// Toggle field-name and value-pattern detection.
    pub fn set_auto_detect(&self, enabled: bool) {
        self.sdm.set_auto_detect(enabled);
    }

    /// Drop compiled rule patterns; they are recompiled on next use.
    pub fn clear_pattern_cache(&self) {
        self.sdm.clear_pattern_cache();
    }

    /// The redactor used by [`log_action`](Self::log_action)
    pub fn sensitive_data_manager(&self) -> &Arc<SensitiveDataManager> {
        &self.sdm
    }

    /// Normalized configuration the service runs with
    pub fn config(&self) -> &AuditConfig {
        &self.config
    }
}

/// One health check; flips Running and Degraded. Returns true when healthy.
fn check_health(
    state: &StateCell,
    buffer: &AuditBuffer,
    metrics: &PipelineMetrics,
    sdm: &SensitiveDataManager,
) -> bool {
    let circuit = buffer.state();
    let errors = metrics.errors() + sdm.metrics().errors;
    let utilization = buffer.utilization() * 100.0;

    tracing::debug!(
        buffered = buffer.len(),
        utilization_pct = utilization,
        processed_entries = metrics.processed_entries(),
        errors,
        circuit_state = %circuit,
        state = %state.load(),
        "Audit service health check"
    );

    let mut healthy = true;
    if errors > DEGRADED_ERROR_THRESHOLD && circuit == CircuitState::Open {
        if state.transition(ServiceState::Running, ServiceState::Degraded) {
            tracing::warn!(errors, "Audit service entering degraded state");
        }
        healthy = false;
    } else if circuit == CircuitState::Closed && state.transition(ServiceState::Degraded, ServiceState::Running) {
        tracing::info!("Audit service recovered from degraded state");
    }

    if utilization > HIGH_UTILIZATION_PCT {
        tracing::warn!(utilization_pct = utilization, "Audit buffer utilization high");
        healthy = false;
    }
    healthy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::repository::{MemoryAuditRepository, RepositoryErrorKind, TenantScope};
    use serde_json::json;

    fn config() -> AuditConfig {
        AuditConfig {
            environment: "test".to_string(),
            workers: 1,
            stop_timeout_secs: 5,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            ..AuditConfig::default()
        }
    }

    fn service(repo: Arc<MemoryAuditRepository>) -> AuditService {
        AuditService::new(config(), repo).unwrap()
    }

    fn params() -> LogActionParams {
        LogActionParams::new(Resource::Shipment, "shp_1", Operation::Update, "usr_1", "org_1", "bu_1")
    }

    fn map(value: Value) -> DataMap {
        match value {
            Value::Object(map) => map,
            _ => DataMap::new(),
        }
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(ServiceState::Initializing.to_string(), "initializing");
        assert_eq!(ServiceState::Degraded.as_str(), "degraded");
        for state in [
            ServiceState::Initializing,
            ServiceState::Running,
            ServiceState::Stopping,
            ServiceState::Stopped,
            ServiceState::Degraded,
        ] {
            assert_eq!(ServiceState::from_u8(state.to_u8()), state);
        }
    }

    #[tokio::test]
    async fn test_log_before_start_is_rejected() {
        let svc = service(Arc::new(MemoryAuditRepository::new()));
        let err = svc.log_action(params(), Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceStopped);
    }

    #[tokio::test]
    async fn test_lifecycle_is_idempotent() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let svc = service(repo.clone());
        svc.start().unwrap();
        svc.start().unwrap();
        assert_eq!(svc.status(), ServiceState::Running);

        svc.log_action(params(), Vec::new()).await.unwrap();
        svc.stop().await.unwrap();
        svc.stop().await.unwrap();
        assert_eq!(svc.status(), ServiceState::Stopped);
        assert_eq!(repo.len(), 1);

        assert!(svc.start().is_err());
        let err = svc.log_action(params(), Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceStopped);
    }

    #[tokio::test]
    async fn test_default_metadata_and_options() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let svc = service(repo.clone());
        svc.set_default_field("region", "us-east");
        svc.start().unwrap();

        let mut extra = DataMap::new();
        extra.insert("environment".into(), json!("override"));
        svc.log_action(
            params().with_current_state(map(json!({"status": "InTransit"}))),
            vec![options::comment("moved"), options::metadata(extra)],
        )
        .await
        .unwrap();
        svc.stop().await.unwrap();

        let stored = repo.entries();
        assert_eq!(stored.len(), 1);
        let entry = &stored[0];
        assert_eq!(entry.metadata["auditVersion"], AUDIT_VERSION);
        assert_eq!(entry.metadata["region"], "us-east");
        assert_eq!(entry.metadata["environment"], "override");
        assert_eq!(entry.comment, "moved");
        assert_eq!(entry.current_state["status"], "InTransit");
    }

    #[tokio::test]
    async fn test_invalid_entry_is_rejected() {
        let svc = service(Arc::new(MemoryAuditRepository::new()));
        svc.start().unwrap();
        let mut p = params();
        p.organization_id.clear();
        let err = svc.log_action(p, Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(matches!(err, Error::InvalidEntry(_)));
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_option_error_aborts_the_call() {
        let svc = service(Arc::new(MemoryAuditRepository::new()));
        svc.start().unwrap();
        let err = svc
            .log_action(params(), vec![options::custom_correlation_id("  ")])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_critical_entry_is_written_synchronously() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let svc = service(repo.clone());
        svc.start().unwrap();

        svc.log_action(params().critical(), Vec::new()).await.unwrap();
        assert_eq!(repo.len(), 1);
        assert_eq!(svc.metrics().critical_writes, 1);
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_critical_retryable_failure_falls_back_to_queue() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let svc = service(repo.clone());
        svc.start().unwrap();
        repo.fail_next_inserts(1, RepositoryErrorKind::Retryable);

        svc.log_action(params(), vec![options::critical()]).await.unwrap();
        assert_eq!(svc.metrics().critical_fallbacks, 1);
        svc.stop().await.unwrap();
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_critical_permanent_failure_is_returned() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let svc = service(repo.clone());
        svc.start().unwrap();
        repo.fail_next_inserts(1, RepositoryErrorKind::DataIntegrity);

        let err = svc.log_action(params().critical(), Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataIntegrity);
        svc.stop().await.unwrap();
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_critical_insert_past_deadline_is_not_retried_elsewhere() {
        let repo = Arc::new(MemoryAuditRepository::new());
        repo.set_insert_latency(Duration::from_millis(500));
        let svc = AuditService::new(
            AuditConfig {
                critical_timeout_ms: 50,
                ..config()
            },
            repo.clone(),
        )
        .unwrap();
        svc.start().unwrap();

        let err = svc.log_action(params().critical(), Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded(_)));
        let metrics = svc.metrics();
        assert_eq!(metrics.critical_fallbacks, 0);
        assert_eq!(metrics.queued, 0);
        assert_eq!(metrics.buffered, 0);

        svc.stop().await.unwrap();
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_critical_falls_back_to_buffer_when_queue_is_full() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let svc = AuditService::new(
            AuditConfig {
                buffer_size: 50,
                batch_size: 1,
                enqueue_timeout_ms: 50,
                ..config()
            },
            repo.clone(),
        )
        .unwrap();
        svc.start().unwrap();

        // Keep the single worker busy in a slow insert.
        repo.set_insert_latency(Duration::from_millis(300));
        svc.log_action(params(), Vec::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        repo.set_insert_latency(Duration::ZERO);

        for _ in 0..50 {
            svc.log_action(params(), Vec::new()).await.unwrap();
        }
        assert_eq!(svc.metrics().queued, 50);

        repo.fail_next_inserts(1, RepositoryErrorKind::Retryable);
        svc.log_action(params().critical(), Vec::new()).await.unwrap();
        let metrics = svc.metrics();
        assert_eq!(metrics.critical_fallbacks, 1);
        assert_eq!(metrics.buffered, 1);
        assert_eq!(metrics.dropped, 0);

        svc.stop().await.unwrap();
        assert_eq!(svc.status(), ServiceState::Stopped);
        assert_eq!(repo.len(), 52);
        assert_eq!(repo.entries().iter().filter(|e| e.critical).count(), 1);
    }

    #[tokio::test]
    async fn test_stop_that_loses_entries_is_terminal() {
        let repo = Arc::new(MemoryAuditRepository::new());
        repo.set_insert_latency(Duration::from_secs(3));
        let svc = AuditService::new(
            AuditConfig {
                stop_timeout_secs: 1,
                ..config()
            },
            repo.clone(),
        )
        .unwrap();
        svc.start().unwrap();
        svc.log_action(params(), Vec::new()).await.unwrap();

        let err = svc.stop().await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(svc.status(), ServiceState::Degraded);
        assert_eq!(svc.metrics().dropped, 1);

        let err = svc.start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceStopped);

        repo.set_insert_latency(Duration::ZERO);
        let err = svc.log_action(params().critical(), Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceStopped);
        assert!(repo.is_empty());
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_final_flush_degrades_the_stop() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let svc = service(repo.clone());
        svc.start().unwrap();
        svc.log_action(params(), Vec::new()).await.unwrap();
        repo.fail_next_inserts(1, RepositoryErrorKind::DataIntegrity);

        assert!(svc.stop().await.is_err());
        assert_eq!(svc.status(), ServiceState::Degraded);
        assert!(repo.is_empty());
        assert_eq!(svc.metrics().failed_entries, 1);

        let err = svc.log_action(params(), Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceStopped);
    }

    #[tokio::test]
    async fn test_stop_drains_buffered_entries() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let svc = service(repo.clone());
        svc.start().unwrap();
        assert!(svc.buffer.add(Entry::new(Resource::Invoice, "inv_1", Operation::Create, "usr_1", "org_1", "bu_1")));

        svc.stop().await.unwrap();
        assert_eq!(svc.status(), ServiceState::Stopped);
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_queries_pass_through_with_tenant_scope() {
        let repo = Arc::new(MemoryAuditRepository::new());
        let svc = service(repo.clone());
        svc.start().unwrap();
        svc.log_action(params().critical(), Vec::new()).await.unwrap();

        let listed = svc
            .list(&ListOptions::new(TenantScope::new("org_1", "bu_1")))
            .await
            .unwrap();
        assert_eq!(listed.total, 1);

        let other = svc
            .list(&ListOptions::new(TenantScope::new("org_2", "bu_1")))
            .await
            .unwrap();
        assert_eq!(other.total, 0);

        let err = svc.list(&ListOptions::new(TenantScope::new("", ""))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_runtime_sdm_controls() {
        let svc = service(Arc::new(MemoryAuditRepository::new()));
        assert_eq!(svc.sensitive_data_manager().mask_strategy(), MaskStrategy::Partial);
        assert!(!svc.sensitive_data_manager().auto_detect());

        svc.set_mask_strategy(MaskStrategy::Strict);
        svc.set_auto_detect(true);
        svc.clear_pattern_cache();
        assert_eq!(svc.sensitive_data_manager().mask_strategy(), MaskStrategy::Strict);
        assert!(svc.sensitive_data_manager().auto_detect());
    }

    #[test]
    fn test_health_check_degrades_and_recovers() {
        let state = StateCell::new(ServiceState::Running);
        let buffer = AuditBuffer::new(100, 1, Duration::from_secs(60));
        let metrics = PipelineMetrics::new();
        let sdm = SensitiveDataManager::default();

        for _ in 0..6 {
            metrics.record_error();
        }
        assert!(check_health(&state, &buffer, &metrics, &sdm));
        assert_eq!(state.load(), ServiceState::Running);

        buffer.record_failure();
        assert_eq!(buffer.state(), CircuitState::Open);
        assert!(!check_health(&state, &buffer, &metrics, &sdm));
        assert_eq!(state.load(), ServiceState::Degraded);

        buffer.reset_failures();
        assert!(check_health(&state, &buffer, &metrics, &sdm));
        assert_eq!(state.load(), ServiceState::Running);
    }
}
