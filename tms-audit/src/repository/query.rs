//! Query request types
//!
//! Every read carries a [`TenantScope`]; backends filter on it before any
//! other predicate, so no request can observe another tenant's rows.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::entry::{Category, Entry, Operation, Resource};
use crate::error::{Error, Result};
use crate::ids::EntryId;

/// Page size used when a request does not set one
pub const DEFAULT_PAGE_SIZE: u64 = 20;

/// Largest page a single request may read
pub const MAX_PAGE_SIZE: u64 = 1000;

/// Sort direction for timestamp-ordered results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    Ascending,
    #[default]
    Descending,
}

impl OrderDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ascending => write!(f, "asc"),
            Self::Descending => write!(f, "desc"),
        }
    }
}

/// Limit/offset pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: u64,
    pub limit: u64,
}

impl Pagination {
    #[must_use]
    pub const fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    #[must_use]
    pub const fn first_page(limit: u64) -> Self {
        Self { offset: 0, limit }
    }

    /// 1-based page number to offset
    #[must_use]
    pub const fn page(page_number: u64, page_size: u64) -> Self {
        let offset = page_number.saturating_sub(1).saturating_mul(page_size);
        Self {
            offset,
            limit: page_size,
        }
    }

    /// Zero limits become the default page size; large ones are capped.
    #[must_use]
    pub fn normalized(self) -> Self {
        let limit = match self.limit {
            0 => DEFAULT_PAGE_SIZE,
            l => l.min(MAX_PAGE_SIZE),
        };
        Self {
            offset: self.offset,
            limit,
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

/// The organization and business unit a read is confined to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantScope {
    pub organization_id: String,
    pub business_unit_id: String,
}

impl TenantScope {
    pub fn new(organization_id: impl Into<String>, business_unit_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            business_unit_id: business_unit_id.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.organization_id.trim().is_empty() || self.business_unit_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "organization and business unit are required for audit queries".into(),
            ));
        }
        Ok(())
    }

    /// True if the entry belongs to this tenant.
    pub fn contains(&self, entry: &Entry) -> bool {
        entry.organization_id == self.organization_id && entry.business_unit_id == self.business_unit_id
    }
}

/// Optional narrowing for [`ListOptions`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    pub resource: Option<Resource>,
    pub operation: Option<Operation>,
    pub category: Option<Category>,
    pub user_id: Option<String>,
    /// Inclusive lower bound, seconds since epoch
    pub since: Option<i64>,
    /// Exclusive upper bound, seconds since epoch
    pub until: Option<i64>,
}

impl ListFilter {
    pub fn matches(&self, entry: &Entry) -> bool {
        self.resource.is_none_or(|r| entry.resource == r)
            && self.operation.is_none_or(|o| entry.operation == o)
            && self.category.is_none_or(|c| entry.category == c)
            && self.user_id.as_deref().is_none_or(|u| entry.user_id == u)
            && self.since.is_none_or(|s| entry.timestamp >= s)
            && self.until.is_none_or(|u| entry.timestamp < u)
    }
}

/// Tenant-wide listing, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    pub tenant: TenantScope,
    #[serde(default)]
    pub filter: ListFilter,
    #[serde(default)]
    pub pagination: Pagination,
}

impl ListOptions {
    pub fn new(tenant: TenantScope) -> Self {
        Self {
            tenant,
            filter: ListFilter::default(),
            pagination: Pagination::default(),
        }
    }

    pub fn with_filter(mut self, filter: ListFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }
}

/// History of one domain object, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListByResourceRequest {
    pub tenant: TenantScope,
    pub resource_id: String,
    #[serde(default)]
    pub pagination: Pagination,
}

/// Point lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetByIdRequest {
    pub tenant: TenantScope,
    pub entry_id: EntryId,
}

/// Entries recording one operation on one object, oldest first.
///
/// Answers questions like "who created X" or "was X approved since T".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOperationRequest {
    pub tenant: TenantScope,
    pub resource: Resource,
    pub resource_id: String,
    pub operation: Operation,
    #[serde(default)]
    pub since: Option<i64>,
    #[serde(default = "default_narrow_limit")]
    pub limit: u64,
}

/// Entries written since a point in time, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentEntriesRequest {
    pub tenant: TenantScope,
    pub since_timestamp: i64,
    #[serde(default)]
    pub operation: Option<Operation>,
    #[serde(default)]
    pub resource: Option<Resource>,
    #[serde(default = "default_narrow_limit")]
    pub limit: u64,
}

fn default_narrow_limit() -> u64 {
    100
}

/// Age-based delete for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub organization_id: String,
    /// Narrow to one business unit; all of the organization's otherwise
    #[serde(default)]
    pub business_unit_id: Option<String>,
    /// Entries with `timestamp < cutoff` are removed
    pub cutoff: i64,
}

/// A page of entries plus the unpaginated total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResult {
    pub entries: Vec<Entry>,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_offsets() {
        assert_eq!(Pagination::page(1, 20), Pagination::new(0, 20));
        assert_eq!(Pagination::page(3, 20).offset, 40);
        assert_eq!(Pagination::page(0, 20).offset, 0);
    }

    #[test]
    fn test_huge_page_numbers_saturate() {
        assert_eq!(Pagination::page(u64::MAX, 100).offset, u64::MAX);
        assert_eq!(Pagination::page(u64::MAX / 2, 4).offset, u64::MAX);
    }

    #[test]
    fn test_pagination_normalized() {
        assert_eq!(Pagination::new(5, 0).normalized().limit, DEFAULT_PAGE_SIZE);
        assert_eq!(Pagination::first_page(10_000).normalized().limit, MAX_PAGE_SIZE);
        assert_eq!(Pagination::first_page(50).normalized().limit, 50);
    }

    #[test]
    fn test_tenant_scope() {
        assert!(TenantScope::new("org_1", "").validate().is_err());
        let scope = TenantScope::new("org_1", "bu_1");
        assert!(scope.validate().is_ok());

        let entry = Entry::new(Resource::Customer, "cus_1", Operation::Create, "usr_1", "org_1", "bu_1");
        assert!(scope.contains(&entry));
        assert!(!TenantScope::new("org_2", "bu_1").contains(&entry));
    }

    #[test]
    fn test_filter_matches() {
        let mut entry = Entry::new(Resource::Invoice, "inv_1", Operation::Approve, "usr_1", "org_1", "bu_1");
        entry.timestamp = 1_000;

        assert!(ListFilter::default().matches(&entry));
        let filter = ListFilter {
            resource: Some(Resource::Invoice),
            operation: Some(Operation::Approve),
            since: Some(1_000),
            until: Some(1_001),
            ..Default::default()
        };
        assert!(filter.matches(&entry));
        let filter = ListFilter {
            until: Some(1_000),
            ..Default::default()
        };
        assert!(!filter.matches(&entry));
        let filter = ListFilter {
            user_id: Some("usr_2".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&entry));
    }
}
