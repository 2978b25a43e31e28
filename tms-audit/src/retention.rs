//! Retention pruning
//!
//! [`DeleteAuditEntriesActivity`] reads every tenant's retention setting and
//! deletes that tenant's entries older than the configured number of days.
//! Tenants are pruned independently; the run only fails when every tenant
//! failed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::Result;
use crate::repository::{AuditRepository, DeleteRequest, RepositoryError, RepositoryOperation};
use crate::workflow::{Activity, ActivityContext};

/// Seconds per retention day
pub const SECONDS_PER_DAY: i64 = 86_400;

/// One tenant's retention setting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub organization_id: String,
    /// Narrow the policy to one business unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_unit_id: Option<String>,
    /// Zero disables pruning for the tenant
    pub retention_days: u32,
}

impl RetentionPolicy {
    pub fn new(organization_id: impl Into<String>, retention_days: u32) -> Self {
        Self {
            organization_id: organization_id.into(),
            business_unit_id: None,
            retention_days,
        }
    }

    #[must_use]
    pub fn for_business_unit(mut self, business_unit_id: impl Into<String>) -> Self {
        self.business_unit_id = Some(business_unit_id.into());
        self
    }

    /// Entries with `timestamp < cutoff(now)` are expired.
    pub fn cutoff(&self, now: i64) -> i64 {
        now - i64::from(self.retention_days) * SECONDS_PER_DAY
    }
}

/// Source of per-tenant retention settings
#[async_trait]
pub trait RetentionStore: Send + Sync {
    async fn retention_policies(&self) -> Result<Vec<RetentionPolicy>>;
}

/// Retention settings held in memory
#[derive(Debug, Default)]
pub struct MemoryRetentionStore {
    policies: RwLock<Vec<RetentionPolicy>>,
}

impl MemoryRetentionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the policy for the policy's tenant.
    pub fn set_policy(&self, policy: RetentionPolicy) {
        let mut policies = self.policies.write().unwrap_or_else(PoisonError::into_inner);
        policies.retain(|p| {
            p.organization_id != policy.organization_id || p.business_unit_id != policy.business_unit_id
        });
        policies.push(policy);
    }
}

#[async_trait]
impl RetentionStore for MemoryRetentionStore {
    async fn retention_policies(&self) -> Result<Vec<RetentionPolicy>> {
        Ok(self.policies.read().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

/// Input of a retention run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionRun {
    /// Reference time in seconds; the current time when unset
    #[serde(default)]
    pub now: Option<i64>,
}

impl RetentionRun {
    pub fn at(now: i64) -> Self {
        Self { now: Some(now) }
    }
}

/// Per-tenant outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRetention {
    pub organization_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_unit_id: Option<String>,
    pub cutoff: i64,
    pub deleted: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate outcome of a retention run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub deleted: u64,
    pub succeeded: u32,
    pub failed: u32,
    pub tenants: Vec<TenantRetention>,
}

impl RetentionReport {
    /// Rows deleted for one organization across its policies
    pub fn deleted_for(&self, organization_id: &str) -> u64 {
        self.tenants
            .iter()
            .filter(|t| t.organization_id == organization_id)
            .map(|t| t.deleted)
            .sum()
    }
}

/// Deletes expired entries for every tenant with a positive retention.
pub struct DeleteAuditEntriesActivity {
    store: Arc<dyn RetentionStore>,
    repository: Arc<dyn AuditRepository>,
}

impl DeleteAuditEntriesActivity {
    pub fn new(store: Arc<dyn RetentionStore>, repository: Arc<dyn AuditRepository>) -> Self {
        Self { store, repository }
    }
}

#[async_trait]
impl Activity for DeleteAuditEntriesActivity {
    type Input = RetentionRun;
    type Output = RetentionReport;
    const NAME: &'static str = "delete_audit_entries";

    async fn execute(&self, ctx: &ActivityContext, input: &RetentionRun) -> Result<RetentionReport> {
        ctx.heartbeat("loading retention settings");
        let policies = self.store.retention_policies().await?;
        let now = input.now.unwrap_or_else(|| chrono::Utc::now().timestamp());

        let mut report = RetentionReport::default();
        for policy in policies.into_iter().filter(|p| p.retention_days > 0) {
            let cutoff = policy.cutoff(now);
            let request = DeleteRequest {
                organization_id: policy.organization_id.clone(),
                business_unit_id: policy.business_unit_id.clone(),
                cutoff,
            };

            ctx.heartbeat(&policy.organization_id);
            match self.repository.delete_audit_entries(&request).await {
                Ok(deleted) => {
                    tracing::info!(
                        organization_id = %policy.organization_id,
                        retention_days = policy.retention_days,
                        cutoff,
                        deleted,
                        "Pruned expired audit entries"
                    );
                    report.deleted += deleted;
                    report.succeeded += 1;
                    report.tenants.push(TenantRetention {
                        organization_id: policy.organization_id,
                        business_unit_id: policy.business_unit_id,
                        cutoff,
                        deleted,
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        organization_id = %policy.organization_id,
                        error = %e,
                        "Failed to prune audit entries"
                    );
                    report.failed += 1;
                    report.tenants.push(TenantRetention {
                        organization_id: policy.organization_id,
                        business_unit_id: policy.business_unit_id,
                        cutoff,
                        deleted: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if report.failed > 0 && report.succeeded == 0 {
            return Err(RepositoryError::retryable(
                RepositoryOperation::Delete,
                format!("retention failed for all {} tenants", report.failed),
            )
            .into());
        }

        tracing::info!(
            deleted = report.deleted,
            succeeded = report.succeeded,
            failed = report.failed,
            "Retention run completed"
        );
        Ok(report)
    }
}
