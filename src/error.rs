use std::any::Any;
use thiserror::Error;

/// Result type for pipeline engine operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while moving work through the engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Send attempted after the queue was closed, or a queue was closed twice
    #[error("Queue is closed")]
    QueueClosed,

    /// Operation aborted because its cancellation node was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation aborted because its cancellation node's deadline elapsed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Non-blocking send found no free slot
    #[error("Queue is full")]
    QueueFull,

    /// A job's own processing failed
    #[error("Job failed: {0}")]
    Job(String),

    /// A job or stage panicked; the fault was contained at the worker boundary
    #[error("Job panicked: {0}")]
    Panicked(String),

    /// No stages in pipeline
    #[error("Cannot build pipeline with no stages")]
    NoStages,

    /// Thread spawn error
    #[error("Thread error: {0}")]
    ThreadError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl PipelineError {
    /// Shorthand for a job-level failure
    pub fn job(message: impl Into<String>) -> Self {
        Self::Job(message.into())
    }

    /// Closed, cancelled and deadline errors come from the engine itself and
    /// surface to the caller that triggered them; everything else belongs to a job.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::QueueClosed | Self::Cancelled | Self::DeadlineExceeded
        )
    }

    /// True for both explicit cancellation and deadline expiry
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
