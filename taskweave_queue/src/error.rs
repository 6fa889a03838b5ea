//! Error types for the queue layer.

use crate::job::JobId;
use taskweave_core::TaskError;
use thiserror::Error;

/// Errors raised by storage, limiters, clients and servers.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Storage backend failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Storage used before `setup`
    #[error("Storage not initialized")]
    NotInitialized,

    /// No queue registered under this name
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Job id unknown to storage
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Queue was built without a required component
    #[error("Queue misconfigured: {0}")]
    Misconfigured(String),

    /// Update channel closed
    #[error("Queue closed: {0}")]
    Closed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type alias for Result with QueueError.
pub type Result<T> = std::result::Result<T, QueueError>;

impl From<QueueError> for TaskError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::QueueNotFound(_) | QueueError::Misconfigured(_) => {
                TaskError::configuration(err.to_string())
            }
            QueueError::Storage(_) | QueueError::Io(_) | QueueError::Closed(_) => {
                TaskError::transient(err.to_string())
            }
            other => TaskError::permanent(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_errors_map_to_task_taxonomy() {
        let err: TaskError = QueueError::QueueNotFound("embeddings".into()).into();
        assert!(matches!(err, TaskError::Configuration(_)));

        let err: TaskError = QueueError::Storage("disk full".into()).into();
        assert!(err.is_retryable());

        let err: TaskError = QueueError::NotInitialized.into();
        assert!(!err.is_retryable());
    }
}
