//! Graph definitions.
//!
//! A [`GraphDefinition`] is the persisted form of a graph: plain
//! `(id, type, config)` task records plus dataflow records, readable and
//! writable as JSON or YAML. A [`TaskFactory`] turns task records back into
//! task instances.

use crate::context::EngineContext;
use crate::dag::TaskGraph;
use crate::dataflow::Dataflow;
use crate::error::GraphError;
use crate::node::TaskNode;
use crate::task::{Task, TaskId, TaskInput};
use crate::tasks::{ProviderTask, QueuedTask};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use taskweave_core::TaskError;
use thiserror::Error;

/// Errors while loading or instantiating a graph definition.
#[derive(Error, Debug)]
pub enum DefinitionError {
    /// No constructor registered for a task type
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    /// Constructor rejected the task's config
    #[error("Invalid config for task {task}: {source}")]
    InvalidConfig { task: TaskId, source: TaskError },

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// File extension is neither JSON nor YAML
    #[error("Unsupported definition format: {0}")]
    UnsupportedFormat(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persisted task record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
    /// Static input values
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub input: TaskInput,
}

/// Persisted graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub name: String,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub dataflows: Vec<Dataflow>,
}

impl GraphDefinition {
    pub fn from_json(json: &str) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, DefinitionError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, DefinitionError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> Result<String, DefinitionError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Loads a `.json`, `.yaml` or `.yml` file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        match extension(path).as_str() {
            "json" => Self::from_json(&content),
            "yaml" | "yml" => Self::from_yaml(&content),
            other => Err(DefinitionError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Writes the definition in the format implied by the file extension.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), DefinitionError> {
        let path = path.as_ref();
        let content = match extension(path).as_str() {
            "json" => self.to_json()?,
            "yaml" | "yml" => self.to_yaml()?,
            other => return Err(DefinitionError::UnsupportedFormat(other.to_string())),
        };
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

impl TaskGraph {
    /// Captures the graph as plain records.
    pub fn to_definition(&self, name: impl Into<String>) -> GraphDefinition {
        GraphDefinition {
            name: name.into(),
            tasks: self
                .tasks()
                .into_iter()
                .map(|node| TaskDefinition {
                    id: node.id().clone(),
                    task_type: node.task_type().to_string(),
                    config: node.task().config(),
                    input: node.defaults().clone(),
                })
                .collect(),
            dataflows: self
                .dataflows()
                .iter()
                .map(|w| w.dataflow.clone())
                .collect(),
        }
    }
}

type Constructor = dyn Fn(&Value) -> Result<Arc<dyn Task>, TaskError> + Send + Sync;

/// Builds task instances from task records.
///
/// Constructors are looked up by task type. Types without a constructor
/// fall back to a [`QueuedTask`] when the config names a queue, or a
/// [`ProviderTask`] when it names a provider registered for that type.
#[derive(Clone, Default)]
pub struct TaskFactory {
    constructors: HashMap<String, Arc<Constructor>>,
}

impl TaskFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor for `task_type`, replacing any previous one.
    pub fn register<F>(&mut self, task_type: impl Into<String>, constructor: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Task>, TaskError> + Send + Sync + 'static,
    {
        let task_type = task_type.into();
        if self
            .constructors
            .insert(task_type.clone(), Arc::new(constructor))
            .is_some()
        {
            tracing::warn!(task_type = %task_type, "replacing task constructor");
        }
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.constructors.contains_key(task_type)
    }

    /// Instantiates one task record.
    pub fn create(
        &self,
        definition: &TaskDefinition,
        engine: &EngineContext,
    ) -> Result<Arc<dyn Task>, DefinitionError> {
        let invalid = |source: TaskError| DefinitionError::InvalidConfig {
            task: definition.id.clone(),
            source,
        };

        if let Some(constructor) = self.constructors.get(&definition.task_type) {
            return constructor(&definition.config).map_err(invalid);
        }

        let names_provider = definition
            .config
            .get("provider")
            .and_then(Value::as_str)
            .is_some_and(|p| engine.providers().contains(&definition.task_type, p));
        if definition.config.get("queue").is_some() {
            let task = QueuedTask::from_config(&definition.task_type, &definition.config)
                .map_err(invalid)?;
            return Ok(Arc::new(task));
        }
        if names_provider {
            let task = ProviderTask::from_config(&definition.task_type, &definition.config)
                .map_err(invalid)?;
            return Ok(Arc::new(task));
        }
        Err(DefinitionError::UnknownTaskType(definition.task_type.clone()))
    }

    /// Builds a graph bound to `engine` from a definition.
    pub fn build_graph(
        &self,
        definition: &GraphDefinition,
        engine: Arc<EngineContext>,
    ) -> Result<TaskGraph, DefinitionError> {
        let mut graph = TaskGraph::with_context(Arc::clone(&engine));
        for task in &definition.tasks {
            let instance = self.create(task, &engine)?;
            let node = TaskNode::from_arc(task.id.clone(), instance).with_input(task.input.clone());
            graph.add_node(node)?;
        }
        for dataflow in &definition.dataflows {
            graph.add_dataflow(dataflow.clone())?;
        }
        tracing::debug!(
            name = %definition.name,
            tasks = graph.len(),
            dataflows = graph.dataflows().len(),
            "graph built from definition"
        );
        Ok(graph)
    }
}
