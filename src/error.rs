use std::time::Duration;
use thiserror::Error;

/// Failures reported by a durable event log backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("durable store unavailable: {0}")]
    Unavailable(String),
    #[error("durable store integrity error: {0}")]
    Integrity(String),
}

/// Failures reported by an aggregate cache backend. None of them is fatal to a visit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache operation `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
}

/// The error a caller of [`crate::service::VisitService::record_visit`] can observe.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VisitError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("storage integrity error: {0}")]
    StorageIntegrity(String),
    #[error("storage operation `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
}

impl VisitError {
    /// Integrity errors are never retried: the append is not idempotent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::Timeout { .. })
    }
}

impl From<StorageError> for VisitError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(msg) => Self::StorageUnavailable(msg),
            StorageError::Integrity(msg) => Self::StorageIntegrity(msg),
        }
    }
}

#[test]
fn integrity_errors_are_not_retryable() {
    let err: VisitError = StorageError::Integrity("UNIQUE constraint failed".into()).into();
    assert!(!err.is_retryable());

    let err: VisitError = StorageError::Unavailable("connection refused".into()).into();
    assert!(err.is_retryable());

    let err = VisitError::Timeout {
        op: "append",
        after: Duration::from_millis(10),
    };
    assert!(err.is_retryable());
}
