//! Error types shared by every taskweave layer.
//!
//! [`TaskError`] is the failure taxonomy a task or job settles with. It is
//! serializable so that a failed job can carry its error through storage and
//! back to the client that submitted it.

use serde::{Deserialize, Serialize};

/// Failure a task or job settles with.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TaskError {
    /// Input failed schema or task-specific validation before execution.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Task is wired to a provider or queue that cannot be resolved.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The run-function failed.
    #[error("Execution failed: {message}")]
    ExecutionFailed {
        /// Failure description
        message: String,
        /// Whether an external retry policy may try again
        transient: bool,
    },

    /// Cancellation was observed. Not a failure.
    #[error("Aborted")]
    Aborted,

    /// A dataflow's format check failed at delivery time.
    #[error("Runtime incompatibility on {dataflow}: {source_format} cannot feed {target_format}")]
    RuntimeIncompatibility {
        /// Dataflow identifier (`source.port -> target.port`)
        dataflow: String,
        /// Format the source produced (`<none>` when untagged)
        source_format: String,
        /// Format the target requires
        target_format: String,
    },

    /// A required input can never arrive because an upstream task failed.
    #[error("Dependency {dependency} failed: {reason}")]
    DependencyFailed {
        /// Upstream task that failed
        dependency: String,
        /// Upstream failure message
        reason: String,
    },
}

impl TaskError {
    /// Creates a permanent (non-retryable) execution failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
            transient: false,
        }
    }

    /// Creates a transient (retryable) execution failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
            transient: true,
        }
    }

    /// Creates an input validation failure.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Creates a configuration failure.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Returns true if an external retry policy may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExecutionFailed { transient: true, .. })
    }

    /// Returns true for [`TaskError::Aborted`].
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Returns true for errors that must reach the immediate caller
    /// synchronously instead of being folded into a graph result.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::Configuration(_))
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::permanent(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::permanent(format!("JSON error: {}", err))
    }
}

/// Errors raised while parsing schemas and format tags.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// Format tag string is malformed.
    #[error("Invalid format tag: {0:?}")]
    InvalidFormatTag(String),

    /// A port name was declared twice.
    #[error("Duplicate port: {0}")]
    DuplicatePort(String),
}

/// Type alias for Result with TaskError.
pub type Result<T> = std::result::Result<T, TaskError>;
