//! Error types for graph construction.
//!
//! Execution failures are reported as [`TaskError`]s per task; the errors
//! here are raised while a graph is being assembled.

use crate::task::TaskId;
use taskweave_core::TaskError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Referenced task not found in graph
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Task id already used
    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    /// Port not declared by the task's schema
    #[error("Task {task} has no {direction} port '{port}'")]
    PortNotFound {
        task: TaskId,
        port: String,
        direction: &'static str,
    },

    /// Input port already fed by another dataflow
    #[error("Input port {task}.{port} is already wired")]
    PortAlreadyWired { task: TaskId, port: String },

    /// Ports cannot be connected
    #[error("Incompatible dataflow {dataflow}: {reason}")]
    IncompatibleDataflow { dataflow: String, reason: String },

    /// Dataflow would close a cycle
    #[error("Cycle detected in graph involving tasks: {0:?}")]
    CycleDetected(Vec<TaskId>),

    /// Automatic wiring found several candidate ports
    #[error("Ambiguous wiring from {source_task} to {target}.{port}: candidates {candidates:?}")]
    AmbiguousWiring {
        source_task: TaskId,
        target: TaskId,
        port: String,
        candidates: Vec<String>,
    },

    /// Automatic wiring found nothing to connect
    #[error("No compatible ports between {source_task} and {target}")]
    NoCompatiblePorts { source_task: TaskId, target: TaskId },

    /// Graph has no tasks
    #[error("Graph cannot be empty")]
    EmptyGraph,
}

impl From<GraphError> for TaskError {
    fn from(err: GraphError) -> Self {
        TaskError::configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_errors_are_configuration_errors() {
        let err: TaskError = GraphError::TaskNotFound(TaskId::new("a")).into();
        assert!(matches!(err, TaskError::Configuration(_)));
        assert!(err.is_caller_error());
    }

    #[test]
    fn test_port_not_found_message() {
        let err = GraphError::PortNotFound {
            task: TaskId::new("embed"),
            port: "vector".into(),
            direction: "output",
        };
        assert_eq!(err.to_string(), "Task embed has no output port 'vector'");
    }
}
