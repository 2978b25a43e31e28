//! # tms-audit
//!
//! Audit pipeline for a multi-tenant transportation-management platform.
//! Application services report change events; the pipeline redacts sensitive
//! values, buffers entries under bounded memory, batches them into durable
//! storage, and serves tenant-scoped history queries and retention pruning.
//!
//! ## Features
//!
//! - **Sensitive data**: per-resource rules, field-name heuristics and value
//!   patterns with mask, omit, hash (SHA-256) and encrypt (AES-256-GCM) actions
//! - **Back-pressure**: bounded queue with drop counting and a three-state
//!   circuit breaker guarding the staging buffer
//! - **Durability**: batching workers with exponential-backoff retries, a
//!   synchronous path for critical entries, and a graceful drain on stop
//! - **Workflows**: scheduled buffer flush and retention pruning as retried,
//!   heartbeating activities
//! - **Storage**: in-memory backend, PostgreSQL backend (`database` feature)
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tms_audit::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = AuditConfig::load()?;
//!     init_tracing(&config);
//!
//!     let service = AuditService::new(config, Arc::new(MemoryAuditRepository::new()))?;
//!     service.register_sensitive_fields(Resource::Customer, vec![SensitiveField::hash("creditLimit")])?;
//!     service.start()?;
//!
//!     let params = LogActionParams::new(Resource::Customer, "cus_42", Operation::Create, "usr_1", "org_1", "bu_1");
//!     service.log_action(params, vec![options::comment("Imported from CSV")]).await?;
//!
//!     service.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod diff;
pub mod entry;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod observability;
pub mod options;
pub mod processor;
pub mod queue;
pub mod repository;
pub mod retention;
pub mod sensitive;
pub mod service;
pub mod workflow;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::buffer::{AuditBuffer, CircuitState};
    pub use crate::config::{AuditConfig, DatabaseConfig};
    pub use crate::diff::{DiffOptions, Differ, JsonDiffer};
    pub use crate::entry::{Category, DataMap, Entry, Operation, Resource, UserSnapshot};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::ids::{BatchId, CorrelationId, EntryId};
    pub use crate::metrics::MetricsSnapshot;
    pub use crate::observability::init_tracing;
    pub use crate::options::{self, LogOption};
    pub use crate::repository::{
        AuditRepository, DeleteRequest, GetByIdRequest, ListByResourceRequest, ListFilter, ListOptions,
        ListResult, MemoryAuditRepository, Pagination, RecentEntriesRequest, RepositoryError,
        RepositoryErrorKind, ResourceOperationRequest, TenantScope,
    };
    pub use crate::retention::{
        DeleteAuditEntriesActivity, MemoryRetentionStore, RetentionPolicy, RetentionReport, RetentionRun,
        RetentionStore,
    };
    pub use crate::sensitive::{MaskStrategy, SensitiveDataManager, SensitiveField, SensitiveFieldAction};
    pub use crate::service::{AuditService, LogActionParams, ServiceState};
    pub use crate::workflow::{Activity, ActivityContext, ActivityOptions, RetryPolicy, WorkflowEngine};

    #[cfg(feature = "database")]
    pub use crate::repository::pg::PgAuditRepository;
}
