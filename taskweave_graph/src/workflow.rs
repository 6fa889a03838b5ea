//! Workflow builder.
//!
//! A [`Workflow`] grows a [`TaskGraph`] one task at a time and wires each new
//! task to the previous one automatically: every free input port is fed by
//! the source port of the same name when it is compatible, otherwise by the
//! only compatible source port. Input ports with several candidates are left
//! for an explicit [`connect`](Workflow::connect).

use crate::context::EngineContext;
use crate::dag::TaskGraph;
use crate::error::GraphError;
use crate::executor::GraphRunResult;
use crate::node::TaskNode;
use crate::task::{Task, TaskId, TaskInput, TaskOutput};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use taskweave_core::compat::can_connect;
use taskweave_core::{CancellationToken, TaskError};

/// Ports wired between two tasks, plus target ports left ambiguous.
#[derive(Debug, Default)]
struct Wiring {
    edges: Vec<(String, String)>,
    ambiguous: Vec<(String, Vec<String>)>,
}

fn warn_ambiguous(source: &TaskId, target: &TaskId, wiring: &Wiring) {
    for (port, candidates) in &wiring.ambiguous {
        tracing::warn!(
            source = %source,
            target = %target,
            port = %port,
            ?candidates,
            "ambiguous auto-wiring left unconnected"
        );
    }
}

pub struct Workflow {
    graph: TaskGraph,
    /// Tail of the chain new tasks are wired from
    last: Option<TaskId>,
}

impl Workflow {
    pub fn new() -> Self {
        Self::from_graph(TaskGraph::new())
    }

    pub fn with_context(engine: Arc<EngineContext>) -> Self {
        Self::from_graph(TaskGraph::with_context(engine))
    }

    pub fn from_graph(graph: TaskGraph) -> Self {
        Self { graph, last: None }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut TaskGraph {
        &mut self.graph
    }

    pub fn into_graph(self) -> TaskGraph {
        self.graph
    }

    /// Appends a task, auto-wiring it from the previous one.
    pub fn add<T: Task + 'static>(
        &mut self,
        id: impl Into<TaskId>,
        task: T,
    ) -> Result<&mut Self, GraphError> {
        self.add_node(TaskNode::new(id, task))
    }

    pub fn add_node(&mut self, node: TaskNode) -> Result<&mut Self, GraphError> {
        let wiring = match &self.last {
            Some(previous) => {
                let wiring = self.plan(previous, node.task().as_ref())?;
                warn_ambiguous(previous, node.id(), &wiring);
                Some((previous.clone(), wiring))
            }
            None => None,
        };
        let id = self.commit(node, wiring)?;
        self.last = Some(id);
        Ok(self)
    }

    /// Adds an explicit dataflow.
    pub fn connect(
        &mut self,
        source: impl Into<TaskId>,
        source_port: impl Into<String>,
        target: impl Into<TaskId>,
        target_port: impl Into<String>,
    ) -> Result<&mut Self, GraphError> {
        self.graph.connect(source, source_port, target, target_port)?;
        Ok(self)
    }

    /// Appends a strict linear chain.
    ///
    /// Each step must wire at least one port and may not leave any port
    /// ambiguous. A rejected step leaves the graph and the chain tail as they
    /// were before it; earlier steps stay in place.
    pub fn pipe<I>(&mut self, tasks: I) -> Result<&mut Self, GraphError>
    where
        I: IntoIterator<Item = (TaskId, Arc<dyn Task>)>,
    {
        for (id, task) in tasks {
            let wiring = match &self.last {
                Some(previous) => {
                    let wiring = self.plan(previous, task.as_ref())?;
                    if let Some((port, candidates)) = wiring.ambiguous.first().cloned() {
                        return Err(GraphError::AmbiguousWiring {
                            source_task: previous.clone(),
                            target: id,
                            port,
                            candidates,
                        });
                    }
                    if wiring.edges.is_empty() {
                        return Err(GraphError::NoCompatiblePorts {
                            source_task: previous.clone(),
                            target: id,
                        });
                    }
                    Some((previous.clone(), wiring))
                }
                None => None,
            };
            let id = self.commit(TaskNode::from_arc(id, task), wiring)?;
            self.last = Some(id);
        }
        Ok(self)
    }

    /// Fans out to independent tasks, each auto-wired from the current tail.
    ///
    /// The branches become the workflow's terminals; run them with
    /// [`run_collect`](Self::run_collect) to get their outputs in order.
    pub fn parallel<I>(&mut self, tasks: I) -> Result<&mut Self, GraphError>
    where
        I: IntoIterator<Item = (TaskId, Arc<dyn Task>)>,
    {
        for (id, task) in tasks {
            let wiring = match &self.last {
                Some(source) => {
                    let wiring = self.plan(source, task.as_ref())?;
                    warn_ambiguous(source, &id, &wiring);
                    Some((source.clone(), wiring))
                }
                None => None,
            };
            self.commit(TaskNode::from_arc(id, task), wiring)?;
        }
        self.last = None;
        Ok(self)
    }

    /// Wiring from `source` into the free input ports of `task`.
    fn plan(&self, source: &TaskId, task: &dyn Task) -> Result<Wiring, GraphError> {
        let source_node = self
            .graph
            .node(source.as_str())
            .ok_or_else(|| GraphError::TaskNotFound(source.clone()))?;
        let outputs = source_node.task().output_schema();

        let mut wiring = Wiring::default();
        for port in task.input_schema().ports() {
            let candidates: Vec<&str> = outputs
                .ports()
                .iter()
                .filter(|out| can_connect(&out.schema, &port.schema).is_connectable())
                .map(|out| out.id.as_str())
                .collect();

            if candidates.contains(&port.id.as_str()) {
                wiring.edges.push((port.id.clone(), port.id.clone()));
            } else if let [only] = candidates.as_slice() {
                wiring.edges.push((only.to_string(), port.id.clone()));
            } else if candidates.len() > 1 {
                wiring.ambiguous.push((
                    port.id.clone(),
                    candidates.iter().map(|c| c.to_string()).collect(),
                ));
            }
        }
        Ok(wiring)
    }

    /// Inserts `node` and its planned dataflows, or nothing at all.
    fn commit(
        &mut self,
        node: TaskNode,
        wiring: Option<(TaskId, Wiring)>,
    ) -> Result<TaskId, GraphError> {
        let id = node.id().clone();
        self.graph.add_node(node)?;
        let Some((source, wiring)) = wiring else {
            return Ok(id);
        };
        for (source_port, target_port) in wiring.edges {
            if let Err(e) = self
                .graph
                .connect(source.clone(), source_port, id.clone(), target_port)
            {
                self.graph.remove(&id)?;
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Runs the workflow, feeding `input` to every root task.
    pub async fn run(&self, input: TaskInput) -> Result<GraphRunResult, TaskError> {
        self.run_with(input, CancellationToken::never()).await
    }

    pub async fn run_with(
        &self,
        input: TaskInput,
        cancellation: CancellationToken,
    ) -> Result<GraphRunResult, TaskError> {
        let inputs: HashMap<TaskId, TaskInput> = self
            .graph
            .roots()
            .into_iter()
            .map(|id| (id, input.clone()))
            .collect();
        self.graph.run_with(inputs, cancellation).await
    }

    /// Runs the workflow and returns its terminal output.
    ///
    /// With one terminal task this is that task's output. With several, the
    /// output maps each terminal task id to its output values.
    pub async fn run_output(&self, input: TaskInput) -> Result<TaskOutput, TaskError> {
        let result = self.run(input).await?;
        let sinks = result.sinks().to_vec();
        let outputs = result.into_result()?;

        if let [only] = sinks.as_slice() {
            return outputs
                .get(only)
                .cloned()
                .ok_or_else(|| TaskError::permanent(format!("task {} produced no output", only)));
        }
        let mut merged = Map::new();
        for id in sinks {
            if let Some(output) = outputs.get(&id) {
                merged.insert(id.into_inner(), Value::Object(output.values.clone()));
            }
        }
        Ok(TaskOutput {
            values: merged,
            formats: Default::default(),
        })
    }

    /// Runs the workflow and returns each terminal task's outcome in the
    /// order the tasks were added.
    pub async fn run_collect(
        &self,
        input: TaskInput,
    ) -> Result<Vec<Result<TaskOutput, TaskError>>, TaskError> {
        let result = self.run(input).await?;
        Ok(result
            .sinks()
            .iter()
            .map(|id| match result.outputs.get(id) {
                Some(output) => Ok(output.clone()),
                None => Err(result.errors.get(id).cloned().unwrap_or(TaskError::Aborted)),
            })
            .collect())
    }

    pub fn abort(&self) {
        self.graph.abort();
    }

    pub fn reset(&self) {
        self.graph.reset();
    }
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::FunctionTask;
    use serde_json::json;
    use taskweave_core::{PortDefinition, PortSchema, TaskSchema};

    fn engine() -> Arc<EngineContext> {
        Arc::new(EngineContext::default())
    }

    fn upper() -> FunctionTask {
        FunctionTask::new("upper", |input: TaskInput, _ctx| async move {
            let text = input.get("text").and_then(Value::as_str).unwrap_or_default();
            Ok(TaskOutput::new().with("text", json!(text.to_uppercase())))
        })
        .input_schema(TaskSchema::new().port(PortDefinition::required("text", PortSchema::string())))
        .output_schema(TaskSchema::new().port(PortDefinition::required("text", PortSchema::string())))
    }

    fn length() -> FunctionTask {
        FunctionTask::new("length", |input: TaskInput, _ctx| async move {
            let len = input.get("value").and_then(Value::as_str).map_or(0, str::len);
            Ok(TaskOutput::new().with("length", json!(len)))
        })
        .input_schema(TaskSchema::new().port(PortDefinition::required("value", PortSchema::string())))
        .output_schema(TaskSchema::new().port(PortDefinition::required("length", PortSchema::integer())))
    }

    fn two_strings() -> FunctionTask {
        FunctionTask::new("split", |_input: TaskInput, _ctx| async move {
            Ok(TaskOutput::new().with("head", json!("a")).with("tail", json!("b")))
        })
        .output_schema(
            TaskSchema::new()
                .port(PortDefinition::required("head", PortSchema::string()))
                .port(PortDefinition::required("tail", PortSchema::string())),
        )
    }

    fn text(value: &str) -> TaskInput {
        let mut input = TaskInput::new();
        input.insert("text".into(), json!(value));
        input
    }

    #[tokio::test]
    async fn test_auto_wiring_by_name_then_single_candidate() {
        let mut workflow = Workflow::with_context(engine());
        workflow.add("upper", upper()).unwrap().add("length", length()).unwrap();
        assert_eq!(workflow.graph().dataflows().len(), 1);
        assert_eq!(workflow.graph().dataflows()[0].dataflow.source_port, "text");
        assert_eq!(workflow.graph().dataflows()[0].dataflow.target_port, "value");

        let output = workflow.run_output(text("hello")).await.unwrap();
        assert_eq!(output.get("length"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_ambiguous_auto_wiring_needs_explicit_edge() {
        let mut workflow = Workflow::with_context(engine());
        workflow.add("split", two_strings()).unwrap().add("length", length()).unwrap();
        assert!(workflow.graph().dataflows().is_empty());

        workflow.connect("split", "tail", "length", "value").unwrap();
        let output = workflow.run_output(TaskInput::new()).await.unwrap();
        assert_eq!(output.get("length"), Some(&json!(1)));
    }

    fn counter() -> FunctionTask {
        FunctionTask::new("counter", |input: TaskInput, _ctx| async move {
            Ok(TaskOutput::new().with("n", input.get("n").cloned().unwrap_or(json!(0))))
        })
        .input_schema(TaskSchema::new().port(PortDefinition::required("n", PortSchema::integer())))
    }

    fn step(id: &str, task: FunctionTask) -> (TaskId, Arc<dyn Task>) {
        (TaskId::new(id), Arc::new(task) as Arc<dyn Task>)
    }

    #[tokio::test]
    async fn test_pipe_is_strict() {
        let mut workflow = Workflow::with_context(engine());
        let err = workflow
            .pipe(vec![step("split", two_strings()), step("length", length())])
            .err()
            .unwrap();
        assert!(matches!(err, GraphError::AmbiguousWiring { .. }));
        assert!(workflow.graph().contains("split"));
        assert!(!workflow.graph().contains("length"));

        let mut workflow = Workflow::with_context(engine());
        let err = workflow
            .pipe(vec![step("length", length()), step("upper", upper())])
            .err()
            .unwrap();
        assert!(matches!(err, GraphError::NoCompatiblePorts { .. }));
        assert!(!workflow.graph().contains("upper"));
    }

    #[tokio::test]
    async fn test_rejected_pipe_step_keeps_graph_and_tail() {
        let mut workflow = Workflow::with_context(engine());
        workflow.add("upper", upper()).unwrap();

        let err = workflow.pipe(vec![step("count", counter())]).err().unwrap();
        assert_eq!(
            err,
            GraphError::NoCompatiblePorts {
                source_task: TaskId::new("upper"),
                target: TaskId::new("count"),
            }
        );
        assert!(!workflow.graph().contains("count"));
        assert_eq!(workflow.graph().len(), 1);

        // The next task still wires from "upper".
        workflow.add("length", length()).unwrap();
        assert_eq!(workflow.graph().dataflows().len(), 1);
        assert_eq!(workflow.graph().dataflows()[0].dataflow.source.as_str(), "upper");
        let output = workflow.run_output(text("abcd")).await.unwrap();
        assert_eq!(output.get("length"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_duplicate_id_leaves_tail_unchanged() {
        let mut workflow = Workflow::with_context(engine());
        workflow.add("upper", upper()).unwrap();
        let err = workflow.add("upper", upper()).err().unwrap();
        assert_eq!(err, GraphError::DuplicateTask(TaskId::new("upper")));

        workflow.add("length", length()).unwrap();
        assert_eq!(workflow.graph().dataflows().len(), 1);
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_parallel_warns_on_ambiguous_branch() {
        let logs = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .with_ansi(false)
            .finish();

        let mut workflow = Workflow::with_context(engine());
        tracing::subscriber::with_default(subscriber, || {
            workflow
                .add("split", two_strings())
                .unwrap()
                .parallel(vec![step("len", length()), step("count", counter())])
                .unwrap();
        });

        assert!(workflow.graph().dataflows().is_empty());
        assert_eq!(workflow.graph().len(), 3);
        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("ambiguous auto-wiring left unconnected"));
        assert!(output.contains("target=len"));
        assert!(!output.contains("target=count"));
    }

    #[tokio::test]
    async fn test_parallel_collects_in_order() {
        let mut workflow = Workflow::with_context(engine());
        workflow
            .add("upper", upper())
            .unwrap()
            .parallel(vec![step("len", length()), step("again", upper())])
            .unwrap();

        let results = workflow.run_collect(text("abc")).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().get("length"), Some(&json!(3)));
        assert_eq!(results[1].as_ref().unwrap().get("text"), Some(&json!("ABC")));
    }
}
