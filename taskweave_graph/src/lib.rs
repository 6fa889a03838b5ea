//! Taskweave graph layer - typed tasks wired into dataflow graphs.
//!
//! A [`Task`] declares typed input and output ports and executes against an
//! [`ExecutionContext`]. Tasks are placed in a [`TaskGraph`] as
//! [`TaskNode`]s and connected port-to-port by [`Dataflow`]s, which are
//! checked for compatibility when they are added. Running a graph schedules
//! each task once all of its inputs have arrived, propagating failures and
//! aborts to dependents while unrelated branches keep going.
//!
//! [`Workflow`] is a builder over a graph that auto-wires consecutive tasks
//! by port name and type. [`GraphDefinition`] persists graphs as JSON or YAML.
//!
//! # Example
//!
//! ```rust,no_run
//! use serde_json::{json, Map, Value};
//! use taskweave_graph::{FunctionTask, TaskInput, TaskOutput, Workflow};
//! use taskweave_core::schema::{PortDefinition, PortSchema, TaskSchema};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let upper = FunctionTask::new("upper", |input: TaskInput, _ctx| async move {
//!     let text = input.get("text").and_then(Value::as_str).unwrap_or_default();
//!     Ok(TaskOutput::new().with("text", json!(text.to_uppercase())))
//! })
//! .input_schema(TaskSchema::new().port(PortDefinition::required("text", PortSchema::string())))
//! .output_schema(TaskSchema::new().port(PortDefinition::required("text", PortSchema::string())));
//!
//! let mut workflow = Workflow::new();
//! workflow.add("upper", upper)?;
//!
//! let mut input = Map::new();
//! input.insert("text".into(), json!("hello"));
//! let output = workflow.run_output(input).await?;
//! assert_eq!(output.get("text"), Some(&json!("HELLO")));
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod dag;
pub mod dataflow;
pub mod definition;
pub mod error;
pub mod executor;
pub mod node;
pub mod provider;
pub mod stream;
pub mod task;
pub mod tasks;
pub mod workflow;

pub use context::EngineContext;
pub use dag::TaskGraph;
pub use dataflow::{Dataflow, WiredDataflow};
pub use definition::{DefinitionError, GraphDefinition, TaskDefinition, TaskFactory};
pub use error::GraphError;
pub use executor::{GraphRunResult, GraphStatus};
pub use node::{RunOptions, TaskNode};
pub use provider::{ProviderJob, ProviderJobRunner, ProviderRegistry, RunFunction, StreamFunction};
pub use stream::{TaskEvent, TaskEventStream};
pub use task::{ExecutionContext, Task, TaskId, TaskInput, TaskOutput, TaskState};
pub use tasks::{FunctionTask, ProviderTask, ProviderTaskConfig, QueuedTask};
pub use workflow::Workflow;
