//! Error types shared across the queue

use thiserror::Error;

/// Errors produced by the queue manager and its drivers.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found")]
    JobNotFound,

    #[error("queue is empty")]
    QueueEmpty,

    #[error("job timeout")]
    JobTimeout,

    #[error("max attempts exceeded")]
    MaxAttemptsExceeded,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("driver not found: {0}")]
    DriverNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("queue is stopped")]
    QueueStopped,

    #[error("queue already running")]
    AlreadyRunning,

    #[error("operation not supported by this driver: {0}")]
    Unsupported(&'static str),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors returned by job handlers. Opaque on purpose: the queue only
/// records the message, it never inspects the error.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;
