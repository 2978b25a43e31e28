//! In-memory audit repository
//!
//! Keeps entries in a `Vec` behind a `std::sync::RwLock`. Locks are never
//! held across `.await`. Inserts can be slowed down or made to fail, which
//! the pipeline tests use to exercise retries and the circuit breaker.

use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use super::{
    AuditRepository, DeleteRequest, GetByIdRequest, ListByResourceRequest, ListOptions, ListResult,
    RecentEntriesRequest, RepositoryError, RepositoryErrorKind, RepositoryOperation,
    RepositoryResult, ResourceOperationRequest, TenantScope,
};
use crate::entry::Entry;

/// Vector-backed repository with failure and latency injection.
#[derive(Debug, Default)]
pub struct MemoryAuditRepository {
    entries: RwLock<Vec<Entry>>,
    injected_failures: Mutex<VecDeque<RepositoryErrorKind>>,
    insert_latency: Mutex<Duration>,
    insert_calls: AtomicU64,
}

impl MemoryAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` insert calls with the given kind.
    pub fn fail_next_inserts(&self, count: usize, kind: RepositoryErrorKind) {
        let mut failures = self.injected_failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.extend(std::iter::repeat_n(kind, count));
    }

    /// Delay every insert call by `latency`.
    pub fn set_insert_latency(&self, latency: Duration) {
        *self.insert_latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Number of insert calls, including failed ones.
    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::Relaxed)
    }

    /// Every stored entry, in insertion order.
    pub fn entries(&self) -> Vec<Entry> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn scoped(&self, tenant: &TenantScope, operation: RepositoryOperation) -> RepositoryResult<Vec<Entry>> {
        tenant
            .validate()
            .map_err(|e| RepositoryError::invalid_input(operation, e.to_string()))?;
        Ok(self
            .read()
            .iter()
            .filter(|e| tenant.contains(e))
            .cloned()
            .collect())
    }
}

fn page(entries: Vec<Entry>, offset: u64, limit: u64) -> Vec<Entry> {
    entries
        .into_iter()
        .skip(usize::try_from(offset).unwrap_or(usize::MAX))
        .take(usize::try_from(limit).unwrap_or(usize::MAX))
        .collect()
}

fn sort_ascending(entries: &mut [Entry]) {
    entries.sort_by(|a, b| (a.timestamp, a.id.as_str()).cmp(&(b.timestamp, b.id.as_str())));
}

#[async_trait]
impl AuditRepository for MemoryAuditRepository {
    async fn insert_audit_entries(&self, entries: &[Entry]) -> RepositoryResult<()> {
        self.insert_calls.fetch_add(1, Ordering::Relaxed);

        let latency = *self.insert_latency.lock().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let injected = self
            .injected_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(kind) = injected {
            return Err(RepositoryError::new(
                RepositoryOperation::Insert,
                kind,
                "injected insert failure",
            ));
        }

        let mut stored = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut seen: HashSet<&str> = stored.iter().map(|e| e.id.as_str()).collect();
        for entry in entries {
            if !seen.insert(entry.id.as_str()) {
                return Err(RepositoryError::data_integrity(
                    RepositoryOperation::Insert,
                    "duplicate audit entry id",
                )
                .with_context(entry.id.to_string()));
            }
        }
        drop(seen);
        stored.extend_from_slice(entries);
        Ok(())
    }

    async fn delete_audit_entries(&self, request: &DeleteRequest) -> RepositoryResult<u64> {
        if request.organization_id.is_empty() {
            return Err(RepositoryError::invalid_input(
                RepositoryOperation::Delete,
                "organization is required for retention deletes",
            ));
        }
        let mut stored = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = stored.len();
        stored.retain(|e| {
            let in_scope = e.organization_id == request.organization_id
                && request
                    .business_unit_id
                    .as_deref()
                    .is_none_or(|bu| e.business_unit_id == bu);
            !(in_scope && e.timestamp < request.cutoff)
        });
        Ok((before - stored.len()) as u64)
    }

    async fn list(&self, options: &ListOptions) -> RepositoryResult<ListResult> {
        let mut entries: Vec<Entry> = self
            .scoped(&options.tenant, RepositoryOperation::List)?
            .into_iter()
            .filter(|e| options.filter.matches(e))
            .collect();
        entries.sort_by(|a, b| {
            (Reverse(a.timestamp), Reverse(a.id.as_str())).cmp(&(Reverse(b.timestamp), Reverse(b.id.as_str())))
        });

        let total = entries.len() as u64;
        let pagination = options.pagination.normalized();
        Ok(ListResult {
            entries: page(entries, pagination.offset, pagination.limit),
            total,
        })
    }

    async fn list_by_resource_id(&self, request: &ListByResourceRequest) -> RepositoryResult<ListResult> {
        let mut entries: Vec<Entry> = self
            .scoped(&request.tenant, RepositoryOperation::ListByResource)?
            .into_iter()
            .filter(|e| e.resource_id == request.resource_id)
            .collect();
        sort_ascending(&mut entries);

        let total = entries.len() as u64;
        let pagination = request.pagination.normalized();
        Ok(ListResult {
            entries: page(entries, pagination.offset, pagination.limit),
            total,
        })
    }

    async fn get_by_id(&self, request: &GetByIdRequest) -> RepositoryResult<Entry> {
        self.scoped(&request.tenant, RepositoryOperation::GetById)?
            .into_iter()
            .find(|e| e.id == request.entry_id)
            .ok_or_else(|| RepositoryError::not_found(request.entry_id.as_str()))
    }

    async fn get_by_resource_and_operation(
        &self,
        request: &ResourceOperationRequest,
    ) -> RepositoryResult<Vec<Entry>> {
        let mut entries: Vec<Entry> = self
            .scoped(&request.tenant, RepositoryOperation::GetByResourceAndOperation)?
            .into_iter()
            .filter(|e| {
                e.resource == request.resource
                    && e.resource_id == request.resource_id
                    && e.operation == request.operation
                    && request.since.is_none_or(|s| e.timestamp >= s)
            })
            .collect();
        sort_ascending(&mut entries);
        Ok(page(entries, 0, request.limit))
    }

    async fn get_recent_entries(&self, request: &RecentEntriesRequest) -> RepositoryResult<Vec<Entry>> {
        let mut entries: Vec<Entry> = self
            .scoped(&request.tenant, RepositoryOperation::GetRecent)?
            .into_iter()
            .filter(|e| {
                e.timestamp >= request.since_timestamp
                    && request.operation.is_none_or(|o| e.operation == o)
                    && request.resource.is_none_or(|r| e.resource == r)
            })
            .collect();
        sort_ascending(&mut entries);
        Ok(page(entries, 0, request.limit))
    }
}
