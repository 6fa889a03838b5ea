//! Task graph built on petgraph.
//!
//! [`TaskGraph`] owns task nodes and the dataflows between their ports. Every
//! dataflow is checked when it is attached: both ports must exist, the target
//! port must be free, the schemas must be statically compatible and the edge
//! must not close a cycle.

use crate::context::EngineContext;
use crate::dataflow::{Dataflow, WiredDataflow};
use crate::error::GraphError;
use crate::executor::{self, GraphRunResult};
use crate::node::{lock, TaskNode};
use crate::task::{Task, TaskId, TaskInput};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use taskweave_core::compat::can_connect;
use taskweave_core::{
    CancellationToken, CancellationTokenSource, Compatibility, PortSchema, TaskError, TaskSchema,
};

/// Schema of `port`, or `any` when the task declares no ports at all.
pub(crate) fn port_schema(schema: &TaskSchema, port: &str) -> Option<PortSchema> {
    if schema.is_empty() {
        return Some(PortSchema::any());
    }
    schema.get(port).map(|p| p.schema.clone())
}

/// Directed acyclic graph of tasks.
///
/// # Example
///
/// ```ignore
/// let mut graph = TaskGraph::with_context(engine);
/// graph.add_task("embed", EmbedTask::new())?;
/// graph.add_task("store", StoreTask::new())?;
/// graph.connect("embed", "vector", "store", "vector")?;
/// let result = graph.run().await?;
/// ```
pub struct TaskGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
    nodes: HashMap<TaskId, Arc<TaskNode>>,
    /// Insertion order
    order: Vec<TaskId>,
    dataflows: Vec<WiredDataflow>,
    engine: Arc<EngineContext>,
    /// Cancellation of the current run, tagged with its run number
    active: Mutex<Option<(u64, CancellationTokenSource)>>,
    runs: AtomicU64,
}

impl TaskGraph {
    /// Creates an empty graph bound to the global engine context.
    pub fn new() -> Self {
        Self::with_context(EngineContext::global())
    }

    pub fn with_context(engine: Arc<EngineContext>) -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
            nodes: HashMap::new(),
            order: Vec::new(),
            dataflows: Vec::new(),
            engine,
            active: Mutex::new(None),
            runs: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<EngineContext> {
        &self.engine
    }

    /// Adds a task under `id`.
    pub fn add_task<T: Task + 'static>(
        &mut self,
        id: impl Into<TaskId>,
        task: T,
    ) -> Result<Arc<TaskNode>, GraphError> {
        self.add_node(TaskNode::new(id, task))
    }

    /// Adds a prepared node, e.g. one carrying static inputs.
    pub fn add_node(&mut self, node: TaskNode) -> Result<Arc<TaskNode>, GraphError> {
        let id = node.id().clone();
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateTask(id));
        }
        let node = Arc::new(node);
        node.bind(&self.engine);

        let idx = self.graph.add_node(id.clone());
        self.index.insert(id.clone(), idx);
        self.nodes.insert(id.clone(), Arc::clone(&node));
        self.order.push(id);
        Ok(node)
    }

    /// Removes a task together with every dataflow touching it.
    pub fn remove(&mut self, id: &TaskId) -> Result<Arc<TaskNode>, GraphError> {
        let idx = self.index_of(id)?;
        let node = self.require(id)?.clone();
        self.graph.remove_node(idx);
        // petgraph moves the last node into the freed index
        if let Some(moved) = self.graph.node_weight(idx) {
            self.index.insert(moved.clone(), idx);
        }
        self.index.remove(id);
        self.nodes.remove(id);
        self.order.retain(|t| t != id);
        self.dataflows
            .retain(|w| &w.dataflow.source != id && &w.dataflow.target != id);
        tracing::debug!(task_id = %id, "task removed");
        Ok(node)
    }

    /// Wires `source.source_port` to `target.target_port`.
    pub fn connect(
        &mut self,
        source: impl Into<TaskId>,
        source_port: impl Into<String>,
        target: impl Into<TaskId>,
        target_port: impl Into<String>,
    ) -> Result<Compatibility, GraphError> {
        self.add_dataflow(Dataflow::new(source, source_port, target, target_port))
    }

    /// Attaches a dataflow after validating it.
    ///
    /// Returns `Static` when the edge is fully checked, or `Deferred` when
    /// the target's format tag can only be checked at delivery.
    pub fn add_dataflow(&mut self, dataflow: Dataflow) -> Result<Compatibility, GraphError> {
        let source = self.require(&dataflow.source)?;
        let target = self.require(&dataflow.target)?;

        let source_schema = port_schema(source.task().output_schema(), &dataflow.source_port)
            .ok_or_else(|| GraphError::PortNotFound {
                task: dataflow.source.clone(),
                port: dataflow.source_port.clone(),
                direction: "output",
            })?;
        let target_schema = port_schema(target.task().input_schema(), &dataflow.target_port)
            .ok_or_else(|| GraphError::PortNotFound {
                task: dataflow.target.clone(),
                port: dataflow.target_port.clone(),
                direction: "input",
            })?;

        let already_wired = self.dataflows.iter().any(|w| {
            w.dataflow.target == dataflow.target && w.dataflow.target_port == dataflow.target_port
        });
        if already_wired {
            return Err(GraphError::PortAlreadyWired {
                task: dataflow.target.clone(),
                port: dataflow.target_port.clone(),
            });
        }

        let compatibility = can_connect(&source_schema, &target_schema);
        if let Compatibility::Incompatible(reason) = &compatibility {
            return Err(GraphError::IncompatibleDataflow {
                dataflow: dataflow.to_string(),
                reason: reason.clone(),
            });
        }

        let from = self.index_of(&dataflow.source)?;
        let to = self.index_of(&dataflow.target)?;
        if let Some(cycle) = self.cycle_through(from, to) {
            return Err(GraphError::CycleDetected(cycle));
        }

        self.graph.add_edge(from, to, ());
        tracing::debug!(dataflow = %dataflow, ?compatibility, "dataflow attached");
        self.dataflows.push(WiredDataflow {
            dataflow,
            compatibility: compatibility.clone(),
        });
        Ok(compatibility)
    }

    /// Path `to ->...-> from` that a new `from -> to` edge would close.
    fn cycle_through(&self, from: NodeIndex, to: NodeIndex) -> Option<Vec<TaskId>> {
        if from == to {
            return Some(vec![self.graph[from].clone()]);
        }

        let mut parents: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([to]);
        while let Some(current) = queue.pop_front() {
            if current == from {
                let mut path = vec![self.graph[from].clone()];
                let mut step = from;
                while let Some(&parent) = parents.get(&step) {
                    path.push(self.graph[parent].clone());
                    step = parent;
                }
                path.reverse();
                return Some(path);
            }
            for next in self.graph.neighbors_directed(current, Direction::Outgoing) {
                if next != to && !parents.contains_key(&next) {
                    parents.insert(next, current);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex, GraphError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::TaskNotFound(id.clone()))
    }

    fn require(&self, id: &TaskId) -> Result<&Arc<TaskNode>, GraphError> {
        self.nodes
            .get(id)
            .ok_or_else(|| GraphError::TaskNotFound(id.clone()))
    }

    pub fn node(&self, id: &str) -> Option<&Arc<TaskNode>> {
        self.nodes.get(&TaskId::from(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(&TaskId::from(id))
    }

    /// Nodes in insertion order.
    pub fn tasks(&self) -> Vec<&Arc<TaskNode>> {
        self.order.iter().filter_map(|id| self.nodes.get(id)).collect()
    }

    pub fn task_ids(&self) -> &[TaskId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dataflows(&self) -> &[WiredDataflow] {
        &self.dataflows
    }

    /// Dataflows feeding `id`.
    pub fn incoming(&self, id: &TaskId) -> Vec<&WiredDataflow> {
        self.dataflows
            .iter()
            .filter(|w| &w.dataflow.target == id)
            .collect()
    }

    /// Dataflows leaving `id`.
    pub fn outgoing(&self, id: &TaskId) -> Vec<&WiredDataflow> {
        self.dataflows
            .iter()
            .filter(|w| &w.dataflow.source == id)
            .collect()
    }

    /// Tasks without incoming dataflows, in insertion order.
    pub fn roots(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| self.incoming(id).is_empty())
            .cloned()
            .collect()
    }

    /// Tasks without outgoing dataflows, in insertion order.
    pub fn sinks(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| self.outgoing(id).is_empty())
            .cloned()
            .collect()
    }

    /// Tasks ordered so that every source precedes its targets.
    pub fn topological_order(&self) -> Result<Vec<TaskId>, GraphError> {
        if self.graph.node_count() == 0 {
            return Err(GraphError::EmptyGraph);
        }
        let sorted = toposort(&self.graph, None)
            .map_err(|cycle| GraphError::CycleDetected(vec![self.graph[cycle.node_id()].clone()]))?;
        Ok(sorted.into_iter().map(|idx| self.graph[idx].clone()).collect())
    }

    /// Runs every task, feeding outputs along dataflows.
    pub async fn run(&self) -> Result<GraphRunResult, TaskError> {
        self.run_with(HashMap::new(), CancellationToken::never()).await
    }

    /// Runs the graph with per-task input overrides under `cancellation`.
    ///
    /// Configuration errors and invalid root input are returned as `Err`
    /// before anything executes. Execution failures are reported per task in
    /// the [`GraphRunResult`].
    pub async fn run_with(
        &self,
        inputs: HashMap<TaskId, TaskInput>,
        cancellation: CancellationToken,
    ) -> Result<GraphRunResult, TaskError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        let source = cancellation.child_source();
        if let Some((_, previous)) = lock(&self.active).replace((run, source.clone())) {
            previous.cancel();
        }
        let result = executor::execute(self, inputs, source.token()).await;
        let mut active = lock(&self.active);
        if active.as_ref().is_some_and(|(current, _)| *current == run) {
            *active = None;
        }
        result
    }

    /// Aborts the active run and every task that has not settled.
    pub fn abort(&self) {
        if let Some((_, source)) = lock(&self.active).take() {
            source.cancel();
        }
        for node in self.nodes.values() {
            node.abort();
        }
    }

    /// Returns every task to Created.
    pub fn reset(&self) {
        for node in self.nodes.values() {
            node.reset();
        }
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::FunctionTask;
    use crate::task::TaskOutput;
    use taskweave_core::PortDefinition;

    fn task(input: TaskSchema, output: TaskSchema) -> FunctionTask {
        FunctionTask::new("test", |_input: TaskInput, _ctx| async move { Ok(TaskOutput::new()) })
            .input_schema(input)
            .output_schema(output)
    }

    fn text_io() -> FunctionTask {
        task(
            TaskSchema::new().port(PortDefinition::optional("text", PortSchema::string())),
            TaskSchema::new().port(PortDefinition::required("text", PortSchema::string())),
        )
    }

    fn graph() -> TaskGraph {
        TaskGraph::with_context(Arc::new(EngineContext::default()))
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let mut g = graph();
        g.add_task("a", text_io()).unwrap();
        let err = g.add_task("a", text_io()).unwrap_err();
        assert_eq!(err, GraphError::DuplicateTask(TaskId::new("a")));
    }

    #[test]
    fn test_cycle_rejected_and_graph_unchanged() {
        let mut g = graph();
        for id in ["a", "b", "c"] {
            g.add_task(id, text_io()).unwrap();
        }
        g.connect("a", "text", "b", "text").unwrap();
        g.connect("b", "text", "c", "text").unwrap();

        let err = g.connect("c", "text", "a", "text").unwrap_err();
        assert_eq!(
            err,
            GraphError::CycleDetected(vec![TaskId::new("a"), TaskId::new("b"), TaskId::new("c")])
        );
        assert_eq!(g.dataflows().len(), 2);
        assert_eq!(
            g.topological_order().unwrap(),
            vec![TaskId::new("a"), TaskId::new("b"), TaskId::new("c")]
        );
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut g = graph();
        g.add_task("a", text_io()).unwrap();
        let err = g.connect("a", "text", "a", "text").unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected(_)));
    }

    #[test]
    fn test_unknown_port_rejected() {
        let mut g = graph();
        g.add_task("a", text_io()).unwrap();
        g.add_task("b", text_io()).unwrap();
        let err = g.connect("a", "vector", "b", "text").unwrap_err();
        assert!(matches!(err, GraphError::PortNotFound { direction: "output", .. }));
        let err = g.connect("x", "text", "b", "text").unwrap_err();
        assert_eq!(err, GraphError::TaskNotFound(TaskId::new("x")));
    }

    #[test]
    fn test_remove_drops_dataflows_and_keeps_indices() {
        let mut g = graph();
        for id in ["a", "b", "c"] {
            g.add_task(id, text_io()).unwrap();
        }
        g.connect("a", "text", "b", "text").unwrap();
        g.connect("b", "text", "c", "text").unwrap();

        g.remove(&TaskId::new("a")).unwrap();
        assert!(!g.contains("a"));
        assert_eq!(g.dataflows().len(), 1);
        assert_eq!(g.roots(), vec![TaskId::new("b")]);
        assert_eq!(g.topological_order().unwrap(), vec![TaskId::new("b"), TaskId::new("c")]);

        // "c" took over the freed index; wiring it must still resolve.
        g.add_task("d", text_io()).unwrap();
        g.connect("c", "text", "d", "text").unwrap();
        assert!(matches!(
            g.connect("d", "text", "b", "text").unwrap_err(),
            GraphError::CycleDetected(_)
        ));
        assert_eq!(
            g.remove(&TaskId::new("a")).unwrap_err(),
            GraphError::TaskNotFound(TaskId::new("a"))
        );
    }

    #[test]
    fn test_target_port_wired_once() {
        let mut g = graph();
        for id in ["a", "b", "c"] {
            g.add_task(id, text_io()).unwrap();
        }
        g.connect("a", "text", "c", "text").unwrap();
        let err = g.connect("b", "text", "c", "text").unwrap_err();
        assert!(matches!(err, GraphError::PortAlreadyWired { .. }));
    }

    #[test]
    fn test_format_narrowing_at_attach() {
        let tagged = |tag: &str| PortSchema::string().try_with_format(tag).unwrap();
        let mut g = graph();
        g.add_task(
            "embed",
            task(
                TaskSchema::new(),
                TaskSchema::new().port(PortDefinition::required("model", tagged("model:TextEmbeddingTask"))),
            ),
        )
        .unwrap();
        g.add_task(
            "store",
            task(
                TaskSchema::new().port(PortDefinition::required("model", tagged("model"))),
                TaskSchema::new().port(PortDefinition::required("model", tagged("model"))),
            ),
        )
        .unwrap();
        g.add_task(
            "narrow",
            task(
                TaskSchema::new().port(PortDefinition::required("model", tagged("model:TextEmbeddingTask"))),
                TaskSchema::new(),
            ),
        )
        .unwrap();

        assert_eq!(g.connect("embed", "model", "store", "model").unwrap(), Compatibility::Static);
        let err = g.connect("store", "model", "narrow", "model").unwrap_err();
        assert!(matches!(err, GraphError::IncompatibleDataflow { .. }));
    }

    #[test]
    fn test_untagged_source_deferred() {
        let mut g = graph();
        g.add_task("a", text_io()).unwrap();
        g.add_task(
            "b",
            task(
                TaskSchema::new().port(PortDefinition::required(
                    "text",
                    PortSchema::string().try_with_format("model").unwrap(),
                )),
                TaskSchema::new(),
            ),
        )
        .unwrap();
        assert_eq!(g.connect("a", "text", "b", "text").unwrap(), Compatibility::Deferred);
        assert!(g.dataflows()[0].is_deferred());
    }

    #[test]
    fn test_roots_and_sinks() {
        let mut g = graph();
        for id in ["a", "b", "c"] {
            g.add_task(id, text_io()).unwrap();
        }
        g.connect("a", "text", "c", "text").unwrap();
        assert_eq!(g.roots(), vec![TaskId::new("a"), TaskId::new("b")]);
        assert_eq!(g.sinks(), vec![TaskId::new("b"), TaskId::new("c")]);
        assert_eq!(g.incoming(&TaskId::new("c")).len(), 1);
    }

    #[test]
    fn test_empty_graph_has_no_order() {
        assert_eq!(graph().topological_order().unwrap_err(), GraphError::EmptyGraph);
    }
}
