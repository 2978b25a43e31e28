//! Audit entry persistence
//!
//! The [`AuditRepository`] trait is the only way the pipeline touches storage.
//! Entries are append-only: the trait offers inserts, tenant-scoped reads and
//! the retention delete, but no update.
//!
//! # Available Backends
//!
//! - **In-memory** ([`MemoryAuditRepository`]): always available; used by tests
//!   and single-process deployments
//! - **PostgreSQL** (`database` feature): [`pg::PgAuditRepository`]

use async_trait::async_trait;

use crate::entry::Entry;

pub mod error;
pub mod memory;
pub mod query;

#[cfg(feature = "database")]
pub mod pg;

pub use error::{RepositoryError, RepositoryErrorKind, RepositoryOperation};
pub use memory::MemoryAuditRepository;
pub use query::{
    DeleteRequest, GetByIdRequest, ListByResourceRequest, ListFilter, ListOptions, ListResult,
    OrderDirection, Pagination, RecentEntriesRequest, ResourceOperationRequest, TenantScope,
};

/// Result type for repository operations
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// Storage backend for audit entries
///
/// Implementations must confine every read to the request's tenant and must
/// insert a batch atomically: either every entry is stored or none is.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Store a batch of sanitized entries
    async fn insert_audit_entries(&self, entries: &[Entry]) -> RepositoryResult<()>;

    /// Remove a tenant's entries older than the cutoff; returns rows deleted
    async fn delete_audit_entries(&self, request: &DeleteRequest) -> RepositoryResult<u64>;

    /// Tenant-wide listing, newest first, ties broken by ID
    async fn list(&self, options: &ListOptions) -> RepositoryResult<ListResult>;

    /// History of one object, oldest first
    async fn list_by_resource_id(&self, request: &ListByResourceRequest) -> RepositoryResult<ListResult>;

    /// Point lookup; `NotFound` when absent from the tenant
    async fn get_by_id(&self, request: &GetByIdRequest) -> RepositoryResult<Entry>;

    /// Entries recording one operation on one object, oldest first
    async fn get_by_resource_and_operation(
        &self,
        request: &ResourceOperationRequest,
    ) -> RepositoryResult<Vec<Entry>>;

    /// Entries at or after `since_timestamp`, oldest first
    async fn get_recent_entries(&self, request: &RecentEntriesRequest) -> RepositoryResult<Vec<Entry>>;
}
