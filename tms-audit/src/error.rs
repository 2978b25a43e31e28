//! Error types and the audit error taxonomy

use std::fmt;
use thiserror::Error;

use crate::repository::{RepositoryError, RepositoryErrorKind};

/// Stable error classification exposed to callers.
///
/// Concrete error variants are an implementation detail; callers branch on
/// the kind returned by [`Error::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing required field, bad rule regex, bad bulk bounds
    InvalidInput,
    /// The sensitive-data manager refused or failed to redact an entry
    SanitizationFailed,
    /// Non-blocking admission found the queue full
    QueueFull,
    /// Bounded admission timed out
    QueueTimeout,
    /// Transient failure; the operation may succeed if repeated
    Retryable,
    /// The requested entry does not exist for the caller's tenant
    NotFound,
    /// Stored data violates a constraint
    DataIntegrity,
    /// Writes rejected because the service is not running
    ServiceStopped,
    /// Anything else that will not succeed on retry
    Permanent,
}

impl ErrorKind {
    /// Whether an operation failing with this kind is worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput => write!(f, "invalid_input"),
            Self::SanitizationFailed => write!(f, "sanitization_failed"),
            Self::QueueFull => write!(f, "queue_full"),
            Self::QueueTimeout => write!(f, "queue_timeout"),
            Self::Retryable => write!(f, "retryable"),
            Self::NotFound => write!(f, "not_found"),
            Self::DataIntegrity => write!(f, "data_integrity"),
            Self::ServiceStopped => write!(f, "service_stopped"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Invalid argument supplied by the caller
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Entry failed validation before admission
    #[error("Invalid audit entry: {0}")]
    InvalidEntry(String),

    /// Redaction failed
    #[error("Sanitization failed: {0}")]
    SanitizationFailed(String),

    /// Audit queue is full and the entry was dropped
    #[error("Audit queue is full")]
    QueueFull,

    /// Bounded admission did not complete in time
    #[error("Timed out enqueueing audit entry after {0:?}")]
    QueueTimeout(std::time::Duration),

    /// The service is not accepting writes
    #[error("Audit service is not running (state: {0})")]
    ServiceStopped(String),

    /// Entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Structured repository error with operation context
    #[error("{0}")]
    Repository(RepositoryError),

    /// Batch insert retries exhausted
    #[error("Max retries ({attempts}) exceeded: {source}")]
    MaxRetriesExceeded {
        /// Number of attempts made
        attempts: u32,
        /// The last error observed
        #[source]
        source: Box<Error>,
    },

    /// A deadline elapsed before the operation completed
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Workflow or activity failure
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error onto the stable taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) | Self::InvalidEntry(_) => ErrorKind::InvalidInput,
            Self::SanitizationFailed(_) => ErrorKind::SanitizationFailed,
            Self::QueueFull => ErrorKind::QueueFull,
            Self::QueueTimeout(_) => ErrorKind::QueueTimeout,
            Self::ServiceStopped(_) => ErrorKind::ServiceStopped,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Repository(e) => match e.kind {
                RepositoryErrorKind::NotFound => ErrorKind::NotFound,
                RepositoryErrorKind::Retryable => ErrorKind::Retryable,
                RepositoryErrorKind::DataIntegrity => ErrorKind::DataIntegrity,
                RepositoryErrorKind::InvalidInput => ErrorKind::InvalidInput,
                RepositoryErrorKind::Permanent => ErrorKind::Permanent,
            },
            Self::DeadlineExceeded(_) | Self::Io(_) => ErrorKind::Retryable,
            Self::MaxRetriesExceeded { .. }
            | Self::Config(_)
            | Self::Workflow(_)
            | Self::Internal(_) => ErrorKind::Permanent,
        }
    }

    /// Shorthand for `self.kind().is_retryable()`.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<RepositoryError> for Error {
    fn from(err: RepositoryError) -> Self {
        match err.kind {
            RepositoryErrorKind::NotFound => Error::NotFound(err.message),
            _ => Error::Repository(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("serialization failed: {}", err))
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RepositoryOperation;

    #[test]
    fn test_repository_kinds_map_to_taxonomy() {
        let err: Error = RepositoryError::new(
            RepositoryOperation::Insert,
            RepositoryErrorKind::Retryable,
            "connection reset",
        )
        .into();
        assert_eq!(err.kind(), ErrorKind::Retryable);
        assert!(err.is_retryable());

        let err: Error = RepositoryError::new(
            RepositoryOperation::Insert,
            RepositoryErrorKind::DataIntegrity,
            "duplicate key",
        )
        .into();
        assert_eq!(err.kind(), ErrorKind::DataIntegrity);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_found_repository_error_becomes_not_found() {
        let err: Error = RepositoryError::not_found("ae_123").into();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_max_retries_is_permanent() {
        let err = Error::MaxRetriesExceeded {
            attempts: 4,
            source: Box::new(Error::DeadlineExceeded("insert".into())),
        };
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(err.to_string().contains("Max retries (4)"));
    }

    #[test]
    fn test_admission_errors() {
        assert_eq!(Error::QueueFull.kind(), ErrorKind::QueueFull);
        assert_eq!(
            Error::QueueTimeout(std::time::Duration::from_secs(5)).kind(),
            ErrorKind::QueueTimeout
        );
        assert_eq!(
            Error::ServiceStopped("stopped".into()).kind().to_string(),
            "service_stopped"
        );
    }
}
