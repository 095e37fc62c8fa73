//! Error types for the job orchestration layer

use thiserror::Error;

/// Failure raised by a job handler.
///
/// The variant decides what the broker does next: validation failures are
/// never retried, transient failures are retried with backoff until the
/// job's attempts are exhausted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Whether the broker may schedule another attempt after this failure
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Errors surfaced by a broker backend
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("job {job_id} not found in queue {queue}")]
    JobNotFound { queue: String, job_id: String },
    #[error("broker connection closed")]
    Closed,
}

/// Errors surfaced by the queue manager and the modules built on it
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("queue '{0}' is not registered")]
    UnknownQueue(String),
    #[error("queue manager is not initialized")]
    NotInitialized,
    #[error("queue manager is shutting down")]
    ShuttingDown,
    #[error("invalid cron pattern '{pattern}': {reason}")]
    InvalidCron { pattern: String, reason: String },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;
pub type QueueResult<T> = Result<T, QueueError>;
