//! PostgreSQL audit repository
//!
//! Entries live in `audit_entries`; the four data maps and the user snapshot
//! are JSONB. Batches are inserted in a single transaction.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::time::Duration;

use super::{
    AuditRepository, DeleteRequest, GetByIdRequest, ListByResourceRequest, ListFilter, ListOptions,
    ListResult, RecentEntriesRequest, RepositoryError, RepositoryOperation, RepositoryResult,
    ResourceOperationRequest, TenantScope,
};
use crate::config::DatabaseConfig;
use crate::entry::{DataMap, Entry, UserSnapshot};
use crate::ids::{CorrelationId, EntryId};

/// PostgreSQL-backed audit repository
pub struct PgAuditRepository {
    pool: PgPool,
}

impl PgAuditRepository {
    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration
    pub async fn connect(config: &DatabaseConfig) -> RepositoryResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| RepositoryError::from_sqlx(RepositoryOperation::Connect, e))?;

        tracing::info!(
            max_connections = config.max_connections,
            "Audit database pool created"
        );
        Ok(Self::new(pool))
    }

    /// Create the `audit_entries` table and its indexes
    ///
    /// Should be called once during application startup.
    pub async fn initialize(&self) -> RepositoryResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS audit_entries (
                id TEXT PRIMARY KEY,
                resource_id TEXT NOT NULL,
                resource TEXT NOT NULL,
                operation TEXT NOT NULL,
                user_id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                business_unit_id TEXT NOT NULL,
                correlation_id TEXT,
                timestamp BIGINT NOT NULL CHECK (timestamp > 0),
                previous_state JSONB NOT NULL DEFAULT '{}'::jsonb,
                current_state JSONB NOT NULL DEFAULT '{}'::jsonb,
                changes JSONB NOT NULL DEFAULT '{}'::jsonb,
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                category TEXT NOT NULL,
                critical BOOLEAN NOT NULL DEFAULT FALSE,
                sensitive_data BOOLEAN NOT NULL DEFAULT FALSE,
                user_agent TEXT NOT NULL DEFAULT '',
                ip_address TEXT NOT NULL DEFAULT '',
                comment TEXT NOT NULL DEFAULT '',
                user_snapshot JSONB
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_audit_entries_tenant_ts ON audit_entries (organization_id, business_unit_id, timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS idx_audit_entries_resource ON audit_entries (organization_id, business_unit_id, resource_id, timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_audit_entries_correlation ON audit_entries (correlation_id) WHERE correlation_id IS NOT NULL",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    RepositoryError::from_sqlx(RepositoryOperation::Connect, e)
                        .with_context("initialize audit_entries")
                })?;
        }
        Ok(())
    }

    async fn fetch_entries(
        &self,
        mut qb: QueryBuilder<'_, Postgres>,
        operation: RepositoryOperation,
    ) -> RepositoryResult<Vec<Entry>> {
        let rows = qb
            .build_query_as::<AuditEntryRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryError::from_sqlx(operation, e))?;
        rows.into_iter()
            .map(|row| row.into_entry(operation))
            .collect()
    }

    async fn count(&self, mut qb: QueryBuilder<'_, Postgres>, operation: RepositoryOperation) -> RepositoryResult<u64> {
        let total: i64 = qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RepositoryError::from_sqlx(operation, e))?;
        Ok(u64::try_from(total).unwrap_or(0))
    }
}

fn scoped<'a>(select: &str, tenant: &TenantScope) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(select);
    qb.push(" FROM audit_entries WHERE organization_id = ")
        .push_bind(tenant.organization_id.clone())
        .push(" AND business_unit_id = ")
        .push_bind(tenant.business_unit_id.clone());
    qb
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &ListFilter) {
    if let Some(resource) = filter.resource {
        qb.push(" AND resource = ").push_bind(resource.as_str());
    }
    if let Some(operation) = filter.operation {
        qb.push(" AND operation = ").push_bind(operation.as_str());
    }
    if let Some(category) = filter.category {
        qb.push(" AND category = ").push_bind(category.as_str());
    }
    if let Some(user_id) = &filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id.clone());
    }
    if let Some(since) = filter.since {
        qb.push(" AND timestamp >= ").push_bind(since);
    }
    if let Some(until) = filter.until {
        qb.push(" AND timestamp < ").push_bind(until);
    }
}

fn limit_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn validate_tenant(tenant: &TenantScope, operation: RepositoryOperation) -> RepositoryResult<()> {
    tenant
        .validate()
        .map_err(|e| RepositoryError::invalid_input(operation, e.to_string()))
}

#[async_trait]
impl AuditRepository for PgAuditRepository {
    async fn insert_audit_entries(&self, entries: &[Entry]) -> RepositoryResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let op = RepositoryOperation::Insert;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepositoryError::from_sqlx(op, e))?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO audit_entries (
                    id, resource_id, resource, operation,
                    user_id, organization_id, business_unit_id, correlation_id,
                    timestamp, previous_state, current_state, changes, metadata,
                    category, critical, sensitive_data,
                    user_agent, ip_address, comment, user_snapshot
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
                "#,
            )
            .bind(entry.id.as_str())
            .bind(&entry.resource_id)
            .bind(entry.resource.as_str())
            .bind(entry.operation.as_str())
            .bind(&entry.user_id)
            .bind(&entry.organization_id)
            .bind(&entry.business_unit_id)
            .bind(entry.correlation_id.as_ref().map(|c| c.as_str()))
            .bind(entry.timestamp)
            .bind(Json(&entry.previous_state))
            .bind(Json(&entry.current_state))
            .bind(Json(&entry.changes))
            .bind(Json(&entry.metadata))
            .bind(entry.category.as_str())
            .bind(entry.critical)
            .bind(entry.sensitive_data)
            .bind(&entry.user_agent)
            .bind(&entry.ip_address)
            .bind(&entry.comment)
            .bind(entry.user.as_ref().map(Json))
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::from_sqlx(op, e).with_context(entry.id.to_string()))?;
        }

        tx.commit().await.map_err(|e| RepositoryError::from_sqlx(op, e))?;
        Ok(())
    }

    async fn delete_audit_entries(&self, request: &DeleteRequest) -> RepositoryResult<u64> {
        let op = RepositoryOperation::Delete;
        if request.organization_id.is_empty() {
            return Err(RepositoryError::invalid_input(
                op,
                "organization is required for retention deletes",
            ));
        }
        let result = sqlx::query(
            r#"
            DELETE FROM audit_entries
            WHERE organization_id = $1
              AND ($2::TEXT IS NULL OR business_unit_id = $2)
              AND timestamp < $3
            "#,
        )
        .bind(&request.organization_id)
        .bind(request.business_unit_id.as_deref())
        .bind(request.cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::from_sqlx(op, e).with_context(request.organization_id.clone()))?;

        Ok(result.rows_affected())
    }

    async fn list(&self, options: &ListOptions) -> RepositoryResult<ListResult> {
        let op = RepositoryOperation::List;
        validate_tenant(&options.tenant, op)?;
        let pagination = options.pagination.normalized();

        let mut count_qb = scoped("SELECT COUNT(*)", &options.tenant);
        push_filter(&mut count_qb, &options.filter);
        let total = self.count(count_qb, op).await?;

        let mut qb = scoped("SELECT *", &options.tenant);
        push_filter(&mut qb, &options.filter);
        qb.push(" ORDER BY timestamp DESC, id DESC LIMIT ")
            .push_bind(limit_i64(pagination.limit))
            .push(" OFFSET ")
            .push_bind(limit_i64(pagination.offset));
        let entries = self.fetch_entries(qb, op).await?;

        Ok(ListResult { entries, total })
    }

    async fn list_by_resource_id(&self, request: &ListByResourceRequest) -> RepositoryResult<ListResult> {
        let op = RepositoryOperation::ListByResource;
        validate_tenant(&request.tenant, op)?;
        let pagination = request.pagination.normalized();

        let mut count_qb = scoped("SELECT COUNT(*)", &request.tenant);
        count_qb.push(" AND resource_id = ").push_bind(request.resource_id.clone());
        let total = self.count(count_qb, op).await?;

        let mut qb = scoped("SELECT *", &request.tenant);
        qb.push(" AND resource_id = ")
            .push_bind(request.resource_id.clone())
            .push(" ORDER BY timestamp ASC, id ASC LIMIT ")
            .push_bind(limit_i64(pagination.limit))
            .push(" OFFSET ")
            .push_bind(limit_i64(pagination.offset));
        let entries = self.fetch_entries(qb, op).await?;

        Ok(ListResult { entries, total })
    }

    async fn get_by_id(&self, request: &GetByIdRequest) -> RepositoryResult<Entry> {
        let op = RepositoryOperation::GetById;
        validate_tenant(&request.tenant, op)?;

        let mut qb = scoped("SELECT *", &request.tenant);
        qb.push(" AND id = ").push_bind(request.entry_id.as_str().to_string());
        self.fetch_entries(qb, op)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RepositoryError::not_found(request.entry_id.as_str()))
    }

    async fn get_by_resource_and_operation(
        &self,
        request: &ResourceOperationRequest,
    ) -> RepositoryResult<Vec<Entry>> {
        let op = RepositoryOperation::GetByResourceAndOperation;
        validate_tenant(&request.tenant, op)?;

        let mut qb = scoped("SELECT *", &request.tenant);
        qb.push(" AND resource = ")
            .push_bind(request.resource.as_str())
            .push(" AND resource_id = ")
            .push_bind(request.resource_id.clone())
            .push(" AND operation = ")
            .push_bind(request.operation.as_str());
        if let Some(since) = request.since {
            qb.push(" AND timestamp >= ").push_bind(since);
        }
        qb.push(" ORDER BY timestamp ASC, id ASC LIMIT ")
            .push_bind(limit_i64(request.limit));
        self.fetch_entries(qb, op).await
    }

    async fn get_recent_entries(&self, request: &RecentEntriesRequest) -> RepositoryResult<Vec<Entry>> {
        let op = RepositoryOperation::GetRecent;
        validate_tenant(&request.tenant, op)?;

        let mut qb = scoped("SELECT *", &request.tenant);
        qb.push(" AND timestamp >= ").push_bind(request.since_timestamp);
        if let Some(operation) = request.operation {
            qb.push(" AND operation = ").push_bind(operation.as_str());
        }
        if let Some(resource) = request.resource {
            qb.push(" AND resource = ").push_bind(resource.as_str());
        }
        qb.push(" ORDER BY timestamp ASC, id ASC LIMIT ")
            .push_bind(limit_i64(request.limit));
        self.fetch_entries(qb, op).await
    }
}

/// Internal row type for sqlx mapping
#[derive(sqlx::FromRow)]
struct AuditEntryRow {
    id: String,
    resource_id: String,
    resource: String,
    operation: String,
    user_id: String,
    organization_id: String,
    business_unit_id: String,
    correlation_id: Option<String>,
    timestamp: i64,
    previous_state: Json<DataMap>,
    current_state: Json<DataMap>,
    changes: Json<DataMap>,
    metadata: Json<DataMap>,
    category: String,
    critical: bool,
    sensitive_data: bool,
    user_agent: String,
    ip_address: String,
    comment: String,
    user_snapshot: Option<Json<UserSnapshot>>,
}

fn decode_tag<T: DeserializeOwned>(raw: String, column: &str, operation: RepositoryOperation) -> RepositoryResult<T> {
    serde_json::from_value(serde_json::Value::String(raw)).map_err(|e| {
        RepositoryError::data_integrity(operation, format!("invalid {}: {}", column, e))
    })
}

impl AuditEntryRow {
    fn into_entry(self, operation: RepositoryOperation) -> RepositoryResult<Entry> {
        Ok(Entry {
            id: EntryId::from_raw(self.id),
            resource_id: self.resource_id,
            resource: decode_tag(self.resource, "resource", operation)?,
            operation: decode_tag(self.operation, "operation", operation)?,
            user_id: self.user_id,
            organization_id: self.organization_id,
            business_unit_id: self.business_unit_id,
            correlation_id: self.correlation_id.map(CorrelationId::from_raw),
            timestamp: self.timestamp,
            previous_state: self.previous_state.0,
            current_state: self.current_state.0,
            changes: self.changes.0,
            metadata: self.metadata.0,
            category: decode_tag(self.category, "category", operation)?,
            critical: self.critical,
            sensitive_data: self.sensitive_data,
            user_agent: self.user_agent,
            ip_address: self.ip_address,
            comment: self.comment,
            user: self.user_snapshot.map(|u| u.0),
        })
    }
}
