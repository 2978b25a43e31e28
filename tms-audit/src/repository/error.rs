//! Repository error types
//!
//! Backends classify their driver failures into a small, stable set of kinds
//! so the batch processor and workflow retry policies can decide whether a
//! failed operation is worth repeating.

use std::fmt;

/// Operation being performed when the repository error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryOperation {
    /// Establishing a connection or acquiring one from the pool
    Connect,
    /// Inserting a batch of entries
    Insert,
    /// Retention delete
    Delete,
    /// Tenant-scoped paginated listing
    List,
    /// Listing by resource ID
    ListByResource,
    /// Point lookup by entry ID
    GetById,
    /// Resource + operation filter
    GetByResourceAndOperation,
    /// Recent entries for a resource
    GetRecent,
    /// Reading per-tenant retention configuration
    RetentionConfig,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Insert => write!(f, "insert"),
            Self::Delete => write!(f, "delete"),
            Self::List => write!(f, "list"),
            Self::ListByResource => write!(f, "list_by_resource"),
            Self::GetById => write!(f, "get_by_id"),
            Self::GetByResourceAndOperation => write!(f, "get_by_resource_and_operation"),
            Self::GetRecent => write!(f, "get_recent"),
            Self::RetentionConfig => write!(f, "retention_config"),
        }
    }
}

/// Category of repository error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryErrorKind {
    /// Row not found in the caller's tenant
    NotFound,
    /// Transient failure (connection, pool, timeout)
    Retryable,
    /// Constraint violation or corrupt row
    DataIntegrity,
    /// Request rejected before reaching storage
    InvalidInput,
    /// Failure that will not resolve on retry
    Permanent,
}

impl fmt::Display for RepositoryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Retryable => write!(f, "retryable"),
            Self::DataIntegrity => write!(f, "data_integrity"),
            Self::InvalidInput => write!(f, "invalid_input"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Structured repository error with operation context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryError {
    /// The operation being performed when the error occurred
    pub operation: RepositoryOperation,
    /// The category of error
    pub kind: RepositoryErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Additional context (entry ID, tenant, table)
    pub context: Option<String>,
}

impl RepositoryError {
    /// Create a new repository error
    pub fn new(
        operation: RepositoryOperation,
        kind: RepositoryErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            context: None,
        }
    }

    /// Attach context to an existing error
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Entry lookup missed
    pub fn not_found(entry_id: impl Into<String>) -> Self {
        let entry_id = entry_id.into();
        Self {
            operation: RepositoryOperation::GetById,
            kind: RepositoryErrorKind::NotFound,
            message: format!("audit entry {} not found", entry_id),
            context: Some(entry_id),
        }
    }

    /// Transient failure
    pub fn retryable(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::Retryable, message)
    }

    /// Constraint violation
    pub fn data_integrity(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::DataIntegrity, message)
    }

    /// Rejected request
    pub fn invalid_input(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::InvalidInput, message)
    }

    /// Non-retryable failure
    pub fn permanent(operation: RepositoryOperation, message: impl Into<String>) -> Self {
        Self::new(operation, RepositoryErrorKind::Permanent, message)
    }

    /// Check if this error is potentially retriable
    pub fn is_retryable(&self) -> bool {
        self.kind == RepositoryErrorKind::Retryable
    }

    /// Classify a sqlx driver error for the given operation.
    #[cfg(feature = "database")]
    pub fn from_sqlx(operation: RepositoryOperation, err: sqlx::Error) -> Self {
        use sqlx::Error as E;
        match err {
            E::RowNotFound => Self::new(operation, RepositoryErrorKind::NotFound, "row not found"),
            E::PoolTimedOut => Self::retryable(operation, "connection pool timed out"),
            E::PoolClosed => Self::retryable(operation, "connection pool is closed"),
            E::Io(e) => Self::retryable(operation, e.to_string()),
            E::Tls(e) => Self::retryable(operation, format!("TLS error: {}", e)),
            E::WorkerCrashed => Self::retryable(operation, "database worker crashed"),
            E::Configuration(e) => Self::permanent(operation, e.to_string()),
            E::ColumnDecode { index, source } => Self::data_integrity(
                operation,
                format!("failed to decode column {}: {}", index, source),
            ),
            E::Decode(e) => Self::data_integrity(operation, e.to_string()),
            E::Database(db_err) => {
                if db_err.is_unique_violation()
                    || db_err.is_foreign_key_violation()
                    || db_err.is_check_violation()
                {
                    Self::data_integrity(operation, db_err.to_string())
                } else {
                    Self::permanent(operation, db_err.to_string())
                }
            }
            other => Self::permanent(operation, other.to_string()),
        }
    }
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Repository {} error during {}: {}",
            self.kind, self.operation, self.message
        )?;
        if let Some(ref context) = self.context {
            write!(f, " [{}]", context)?;
        }
        Ok(())
    }
}

impl std::error::Error for RepositoryError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let error = RepositoryError::retryable(RepositoryOperation::Insert, "connection reset")
            .with_context("batch abt_01h455vb4pex5vsknk084sn02q");
        assert_eq!(
            error.to_string(),
            "Repository retryable error during insert: connection reset [batch abt_01h455vb4pex5vsknk084sn02q]"
        );
    }

    #[test]
    fn test_not_found_carries_entry_id() {
        let error = RepositoryError::not_found("ae_123");
        assert_eq!(error.kind, RepositoryErrorKind::NotFound);
        assert_eq!(error.context.as_deref(), Some("ae_123"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_only_retryable_kind_is_retryable() {
        for kind in [
            RepositoryErrorKind::NotFound,
            RepositoryErrorKind::DataIntegrity,
            RepositoryErrorKind::InvalidInput,
            RepositoryErrorKind::Permanent,
        ] {
            assert!(!RepositoryError::new(RepositoryOperation::List, kind, "x").is_retryable());
        }
        assert!(RepositoryError::retryable(RepositoryOperation::List, "x").is_retryable());
    }
}
