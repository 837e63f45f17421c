//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// These are returned synchronously by admission and lookup calls. Failures
/// that happen while a job executes are reported through [`JobError`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("Queue is full: {capacity} jobs are already waiting")]
    QueueFull { capacity: usize },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Job {0} is not cancellable")]
    NotCancellable(String),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Failure of a single job execution.
///
/// Result handles resolve to this, and the execution pool returns it for
/// every attempt that did not produce a result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Job was cancelled")]
    Cancelled,

    #[error("Task timeout after {0} ms")]
    Timeout(u64),

    /// Codec failure, message passed through verbatim.
    #[error("{0}")]
    Execution(String),

    #[error("Execution unit crashed: {0}")]
    UnitCrashed(String),

    #[error("Execution pool is closed")]
    PoolClosed,
}

impl JobError {
    /// Whether the retry policy may run the job again after this failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, JobError::Cancelled | JobError::PoolClosed)
    }

    /// Stable error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::Cancelled => "CANCELLED",
            JobError::Timeout(_) => "TIMEOUT",
            JobError::Execution(_) => "EXECUTION_ERROR",
            JobError::UnitCrashed(_) => "UNIT_CRASHED",
            JobError::PoolClosed => "POOL_CLOSED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_message_is_verbatim() {
        let err = JobError::Execution("Unsupported task kind: gif".to_string());
        assert_eq!(err.to_string(), "Unsupported task kind: gif");
        assert_eq!(err.code(), "EXECUTION_ERROR");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(JobError::Timeout(10).is_retryable());
        assert!(JobError::UnitCrashed("exit status 3".into()).is_retryable());
        assert!(JobError::Execution("boom".into()).is_retryable());
        assert!(!JobError::Cancelled.is_retryable());
        assert!(!JobError::PoolClosed.is_retryable());
    }

    #[test]
    fn test_not_found_helper() {
        let err = Error::not_found("Job", "abc");
        assert_eq!(err.to_string(), "Entity not found: Job with id abc");
    }
}
