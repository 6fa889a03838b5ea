//! Task abstraction.
//!
//! A [`Task`] declares typed input and output ports and performs its work in
//! [`Task::execute`]. Lifecycle, caching and cancellation are handled by the
//! [`TaskNode`](crate::node::TaskNode) wrapping it, so implementations only
//! describe the work itself.

use crate::context::EngineContext;
use crate::stream::TaskEventStream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use taskweave_core::{CancellationToken, FormatTag, ProgressReporter, TaskError, TaskSchema};

/// Unique identifier of a task within a graph.
#[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a task.
///
/// `Created -> Validating -> Running -> {Completed | Failed | Aborted}`;
/// `Streaming` is the running state of a task producing incremental output.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Validating,
    Running,
    Streaming,
    Completed,
    Failed,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Validating | Self::Running | Self::Streaming)
    }
}

/// Input values keyed by port id.
pub type TaskInput = Map<String, Value>;

/// Output values keyed by port id, with the format each value was emitted in.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub values: Map<String, Value>,
    /// Runtime format tags; override the output schema's static tags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub formats: BTreeMap<String, FormatTag>,
}

impl TaskOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a port value.
    pub fn with(mut self, port: impl Into<String>, value: Value) -> Self {
        self.values.insert(port.into(), value);
        self
    }

    /// Tags a port value with the format it was produced in.
    pub fn with_format(mut self, port: impl Into<String>, tag: FormatTag) -> Self {
        self.formats.insert(port.into(), tag);
        self
    }

    /// Builds an output from a plain value.
    ///
    /// Objects map key-by-key onto ports; any other value becomes the
    /// `output` port.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(values) => Self {
                values,
                formats: BTreeMap::new(),
            },
            other => Self::new().with("output", other),
        }
    }

    pub fn get(&self, port: &str) -> Option<&Value> {
        self.values.get(port)
    }

    pub fn format(&self, port: &str) -> Option<&FormatTag> {
        self.formats.get(port)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

/// What a task sees while executing.
#[derive(Clone)]
pub struct ExecutionContext {
    pub task_id: TaskId,
    /// Correlates every task of one graph run
    pub run_id: Option<String>,
    pub progress: ProgressReporter,
    pub cancellation: CancellationToken,
    pub engine: Arc<EngineContext>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("task_id", &self.task_id)
            .field("run_id", &self.run_id)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A unit of work with typed ports.
#[async_trait]
pub trait Task: Send + Sync {
    /// Type name; used for cache fingerprints and provider dispatch.
    fn task_type(&self) -> &str;

    fn input_schema(&self) -> &TaskSchema;

    fn output_schema(&self) -> &TaskSchema;

    /// Whether outputs may be served from the output cache.
    fn cacheable(&self) -> bool {
        false
    }

    /// Task-specific semantic checks after schema validation.
    fn validate_input(&self, _input: &TaskInput) -> Result<(), TaskError> {
        Ok(())
    }

    /// Verifies that everything the task depends on (providers, queues) is
    /// resolvable. Failures are configuration errors.
    fn check_configuration(&self, _engine: &EngineContext) -> Result<(), TaskError> {
        Ok(())
    }

    /// Plain configuration record used in graph definitions.
    fn config(&self) -> Value {
        Value::Null
    }

    async fn execute(&self, input: TaskInput, ctx: ExecutionContext) -> Result<TaskOutput, TaskError>;

    /// Fast preview. Must not block on slow external calls; the default
    /// returns the previous full output.
    fn execute_reactive(&self, _input: &TaskInput, previous: Option<&TaskOutput>) -> Option<TaskOutput> {
        previous.cloned()
    }

    /// Incremental variant of [`execute`](Self::execute). `None` means the
    /// task has no streaming capability.
    fn execute_stream(&self, _input: TaskInput, _ctx: ExecutionContext) -> Option<TaskEventStream> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_from_object_maps_ports() {
        let output = TaskOutput::from_value(json!({"vector": [1, 2], "dims": 2}));
        assert_eq!(output.get("dims"), Some(&json!(2)));
        assert_eq!(output.values.len(), 2);
    }

    #[test]
    fn test_output_from_scalar_uses_output_port() {
        let output = TaskOutput::from_value(json!("text"));
        assert_eq!(output.get("output"), Some(&json!("text")));
    }

    #[test]
    fn test_output_serialization_skips_empty_formats() {
        let output = TaskOutput::new().with("a", json!(1));
        let json = serde_json::to_value(&output).unwrap();
        assert!(json.get("formats").is_none());

        let tagged = output.with_format("a", "model:Embedding".parse().unwrap());
        let json = serde_json::to_value(&tagged).unwrap();
        assert_eq!(json["formats"]["a"], "model:Embedding");
    }

    #[test]
    fn test_task_state_terminal() {
        assert!(TaskState::Aborted.is_terminal());
        assert!(!TaskState::Streaming.is_terminal());
        assert!(TaskState::Streaming.is_active());
        assert!(!TaskState::Created.is_active());
    }
}
