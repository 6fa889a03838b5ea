//! Concurrent graph execution.
//!
//! Every task whose wired inputs have all arrived runs concurrently on a
//! [`JoinSet`]. When a task completes, its output is delivered along its
//! outgoing dataflows after the delivery-time format check. When a task
//! fails, dependents that needed one of its outputs fail by propagation
//! without running; unrelated branches keep going.

use crate::dag::{port_schema, TaskGraph};
use crate::error::GraphError;
use crate::node::{RunOptions, TaskNode};
use crate::task::{TaskId, TaskInput, TaskOutput};
use futures_util::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use taskweave_core::compat::check_delivery;
use taskweave_core::events::{EventKind, EventScope, LifecycleEvent};
use taskweave_core::{CancellationToken, TaskError};
use tokio::task::JoinSet;
use uuid::Uuid;

/// Overall outcome of a graph run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphStatus {
    Completed,
    Failed,
    Aborted,
}

/// Per-task results of one graph run.
///
/// Partial results stay available when the run failed or was aborted.
#[derive(Clone, Debug)]
pub struct GraphRunResult {
    pub run_id: String,
    pub outputs: HashMap<TaskId, TaskOutput>,
    pub errors: HashMap<TaskId, TaskError>,
    /// Tasks that ended aborted, in the order they settled
    pub aborted: Vec<TaskId>,
    first_failure: Option<(TaskId, TaskError)>,
    cancelled: bool,
    sinks: Vec<TaskId>,
}

impl GraphRunResult {
    pub fn status(&self) -> GraphStatus {
        if self.cancelled {
            GraphStatus::Aborted
        } else if self.first_failure.is_some() {
            GraphStatus::Failed
        } else {
            GraphStatus::Completed
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == GraphStatus::Completed
    }

    pub fn output(&self, id: &str) -> Option<&TaskOutput> {
        self.outputs.get(&TaskId::from(id))
    }

    pub fn error(&self, id: &str) -> Option<&TaskError> {
        self.errors.get(&TaskId::from(id))
    }

    /// The first failure that was not caused by another task's failure.
    pub fn first_failure(&self) -> Option<(&TaskId, &TaskError)> {
        self.first_failure.as_ref().map(|(id, err)| (id, err))
    }

    /// Tasks without outgoing dataflows, in insertion order.
    pub fn sinks(&self) -> &[TaskId] {
        &self.sinks
    }

    /// Outputs of the sink tasks that completed, in insertion order.
    pub fn sink_outputs(&self) -> Vec<(&TaskId, &TaskOutput)> {
        self.sinks
            .iter()
            .filter_map(|id| self.outputs.get(id).map(|out| (id, out)))
            .collect()
    }

    /// Converts into the per-task outputs, or the error the run settled with.
    pub fn into_result(self) -> Result<HashMap<TaskId, TaskOutput>, TaskError> {
        match self.status() {
            GraphStatus::Completed => Ok(self.outputs),
            GraphStatus::Aborted => Err(TaskError::Aborted),
            GraphStatus::Failed => Err(self
                .first_failure
                .map(|(_, err)| err)
                .unwrap_or_else(|| TaskError::permanent("graph run failed"))),
        }
    }
}

struct Scheduler<'g> {
    graph: &'g TaskGraph,
    run_id: String,
    token: CancellationToken,
    inputs: HashMap<TaskId, TaskInput>,
    /// Wired inputs still outstanding per task
    waiting: HashMap<TaskId, usize>,
    settled: HashSet<TaskId>,
    ready: VecDeque<TaskId>,
    result: GraphRunResult,
}

/// Runs `graph` under `token`.
pub(crate) async fn execute(
    graph: &TaskGraph,
    inputs: HashMap<TaskId, TaskInput>,
    token: CancellationToken,
) -> Result<GraphRunResult, TaskError> {
    if graph.is_empty() {
        return Err(GraphError::EmptyGraph.into());
    }
    preflight(graph, &inputs)?;

    let run_id = Uuid::new_v4().to_string();
    let engine = Arc::clone(graph.engine());
    let scope = EventScope::Graph {
        run_id: run_id.clone(),
    };

    for node in graph.tasks() {
        node.reset();
    }

    tracing::info!(run_id = %run_id, tasks = graph.len(), "graph run started");
    engine.emit(LifecycleEvent::now(scope.clone(), EventKind::Started));

    let mut scheduler = Scheduler::new(graph, run_id, inputs, token);
    scheduler.run().await;
    let result = scheduler.finish();

    let kind = match (result.status(), result.first_failure()) {
        (GraphStatus::Completed, _) => EventKind::Completed,
        (GraphStatus::Aborted, _) => EventKind::Aborted,
        (GraphStatus::Failed, Some((_, err))) => EventKind::Failed { error: err.clone() },
        (GraphStatus::Failed, None) => EventKind::Failed {
            error: TaskError::permanent("graph run failed"),
        },
    };
    tracing::info!(
        run_id = %result.run_id,
        status = ?result.status(),
        completed = result.outputs.len(),
        failed = result.errors.len(),
        "graph run finished"
    );
    engine.emit(LifecycleEvent::now(scope, kind));
    Ok(result)
}

/// Configuration of every task and input of every root task, checked before
/// anything runs.
fn preflight(graph: &TaskGraph, inputs: &HashMap<TaskId, TaskInput>) -> Result<(), TaskError> {
    let engine = graph.engine();
    for node in graph.tasks() {
        node.task().check_configuration(engine)?;
    }
    for id in graph.roots() {
        let Some(node) = graph.node(id.as_str()) else {
            continue;
        };
        let input = node.resolve_input(inputs.get(&id));
        node.validate(&input, engine)?;
    }
    Ok(())
}

impl<'g> Scheduler<'g> {
    fn new(
        graph: &'g TaskGraph,
        run_id: String,
        inputs: HashMap<TaskId, TaskInput>,
        token: CancellationToken,
    ) -> Self {
        let waiting: HashMap<TaskId, usize> = graph
            .task_ids()
            .iter()
            .map(|id| (id.clone(), graph.incoming(id).len()))
            .collect();
        let ready = graph.roots().into_iter().collect();
        Self {
            graph,
            result: GraphRunResult {
                run_id: run_id.clone(),
                outputs: HashMap::new(),
                errors: HashMap::new(),
                aborted: Vec::new(),
                first_failure: None,
                cancelled: false,
                sinks: graph.sinks(),
            },
            run_id,
            token,
            inputs,
            waiting,
            settled: HashSet::new(),
            ready,
        }
    }

    async fn run(&mut self) {
        let mut running: JoinSet<(TaskId, Result<TaskOutput, TaskError>)> = JoinSet::new();

        loop {
            while let Some(id) = self.ready.pop_front() {
                if self.settled.contains(&id) {
                    continue;
                }
                let Some(node) = self.graph.node(id.as_str()).cloned() else {
                    continue;
                };
                if self.token.is_cancelled() {
                    self.abort_from(&node);
                    continue;
                }
                self.spawn(&mut running, node);
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            match joined {
                Ok((id, result)) => self.on_settled(id, result),
                // Every spawned future catches its own panic.
                Err(e) => tracing::error!(error = %e, "graph task join failed"),
            }
        }

        // Only tasks downstream of an abort can be left over.
        let graph = self.graph;
        let leftover: Vec<Arc<TaskNode>> = graph
            .tasks()
            .into_iter()
            .filter(|node| !self.settled.contains(node.id()))
            .cloned()
            .collect();
        for node in leftover {
            self.abort_from(&node);
        }
    }

    fn spawn(
        &self,
        running: &mut JoinSet<(TaskId, Result<TaskOutput, TaskError>)>,
        node: Arc<TaskNode>,
    ) {
        let engine = Arc::clone(self.graph.engine());
        let input = self.inputs.get(node.id()).cloned().unwrap_or_default();
        let options = RunOptions::new()
            .cancellation(self.token.clone())
            .run_id(self.run_id.clone());
        running.spawn(async move {
            let id = node.id().clone();
            let run = AssertUnwindSafe(node.run_with(&engine, input, options)).catch_unwind();
            let result = match run.await {
                Ok(result) => result,
                Err(_) => {
                    let err = TaskError::permanent(format!("task {} panicked", id));
                    node.fail_without_running(err.clone());
                    Err(err)
                }
            };
            (id, result)
        });
    }

    fn on_settled(&mut self, id: TaskId, result: Result<TaskOutput, TaskError>) {
        self.settled.insert(id.clone());
        match result {
            Ok(output) => {
                self.deliver(&id, &output);
                self.result.outputs.insert(id, output);
            }
            Err(TaskError::Aborted) => {
                self.result.aborted.push(id.clone());
                self.abort_dependents(&id);
            }
            Err(err) => self.fail(id, err),
        }
    }

    /// Routes `output` along every dataflow leaving `source`.
    fn deliver(&mut self, source: &TaskId, output: &TaskOutput) {
        let graph = self.graph;
        let Some(source_node) = graph.node(source.as_str()) else {
            return;
        };
        for wired in graph.outgoing(source) {
            let flow = &wired.dataflow;
            if self.settled.contains(&flow.target) {
                continue;
            }
            let Some(target_node) = graph.node(flow.target.as_str()) else {
                continue;
            };

            let static_source = port_schema(source_node.task().output_schema(), &flow.source_port);
            let source_format = output
                .format(&flow.source_port)
                .cloned()
                .or_else(|| static_source.and_then(|s| s.format));
            let target_format = port_schema(target_node.task().input_schema(), &flow.target_port)
                .and_then(|s| s.format);

            if let Err(err) =
                check_delivery(&flow.to_string(), source_format.as_ref(), target_format.as_ref())
            {
                tracing::warn!(dataflow = %flow, error = %err, "dataflow delivery rejected");
                target_node.fail_without_running(err.clone());
                self.settled.insert(flow.target.clone());
                self.fail(flow.target.clone(), err);
                continue;
            }

            if let Some(value) = output.get(&flow.source_port) {
                self.inputs
                    .entry(flow.target.clone())
                    .or_default()
                    .insert(flow.target_port.clone(), value.clone());
            }
            self.arrived(&flow.target);
        }
    }

    /// One wired input of `target` has arrived or will never arrive.
    fn arrived(&mut self, target: &TaskId) {
        if let Some(count) = self.waiting.get_mut(target) {
            *count = count.saturating_sub(1);
            if *count == 0 && !self.settled.contains(target) {
                self.ready.push_back(target.clone());
            }
        }
    }

    fn fail(&mut self, id: TaskId, err: TaskError) {
        if self.result.first_failure.is_none() {
            self.result.first_failure = Some((id.clone(), err.clone()));
        }
        self.result.errors.insert(id.clone(), err.clone());

        let graph = self.graph;
        let mut worklist = VecDeque::from([(id, err)]);
        while let Some((failed, cause)) = worklist.pop_front() {
            for wired in graph.outgoing(&failed) {
                let flow = &wired.dataflow;
                if self.settled.contains(&flow.target) {
                    continue;
                }
                let Some(target) = graph.node(flow.target.as_str()) else {
                    continue;
                };
                if self.can_run_without(target, &flow.target_port) {
                    self.arrived(&flow.target);
                    continue;
                }

                let propagated = TaskError::DependencyFailed {
                    dependency: failed.to_string(),
                    reason: cause.to_string(),
                };
                target.fail_without_running(propagated.clone());
                self.settled.insert(flow.target.clone());
                self.result.errors.insert(flow.target.clone(), propagated.clone());
                worklist.push_back((flow.target.clone(), propagated));
            }
        }
    }

    /// Whether `port` of `node` has a value without its dataflow.
    fn can_run_without(&self, node: &TaskNode, port: &str) -> bool {
        let supplied = node.defaults().contains_key(port)
            || self
                .inputs
                .get(node.id())
                .is_some_and(|input| input.contains_key(port));
        if supplied {
            return true;
        }
        match node.task().input_schema().get(port) {
            Some(def) => !def.required || def.default_value.is_some(),
            // Tasks without declared ports accept whatever arrives.
            None => true,
        }
    }

    fn abort_from(&mut self, node: &Arc<TaskNode>) {
        if self.settled.insert(node.id().clone()) {
            node.abort();
            self.result.aborted.push(node.id().clone());
        }
        self.abort_dependents(node.id());
    }

    fn abort_dependents(&mut self, id: &TaskId) {
        let graph = self.graph;
        let mut worklist = VecDeque::from([id.clone()]);
        while let Some(current) = worklist.pop_front() {
            for wired in graph.outgoing(&current) {
                let target = wired.dataflow.target.clone();
                if !self.settled.insert(target.clone()) {
                    continue;
                }
                if let Some(node) = graph.node(target.as_str()) {
                    node.abort();
                }
                self.result.aborted.push(target.clone());
                worklist.push_back(target);
            }
        }
    }

    fn finish(mut self) -> GraphRunResult {
        self.result.cancelled = self.token.is_cancelled();
        self.result
    }
}
