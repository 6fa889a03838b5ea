//! Task lifecycle.
//!
//! A [`TaskNode`] owns one task instance inside a graph together with its
//! mutable lifecycle state. It drives validation, cache lookup, execution
//! under a cancellation race and settlement, emitting lifecycle events as it
//! goes.

use crate::context::EngineContext;
use crate::stream::{self, TaskEvent, TaskEventStream};
use crate::task::{ExecutionContext, Task, TaskId, TaskInput, TaskOutput, TaskState};
use futures_util::stream::{self as futures_stream, StreamExt};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use taskweave_core::events::{EventKind, EventScope, LifecycleEvent};
use taskweave_core::{
    race, race_detached, CancellationToken, CancellationTokenSource, Fingerprint, ProgressReporter,
    TaskError,
};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-run options.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Parent token; the run observes its cancellation
    pub cancellation: CancellationToken,
    /// Correlation id passed on to the task and any jobs it submits
    pub run_id: Option<String>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

struct NodeState {
    state: TaskState,
    output: Option<TaskOutput>,
    error: Option<TaskError>,
    /// Cancellation of the active run, dropped once it settles
    run: Option<CancellationTokenSource>,
    /// Bumped by every run and reset; stale settlements are ignored
    generation: u64,
    engine: Option<Arc<EngineContext>>,
}

/// A task instance and its lifecycle state.
pub struct TaskNode {
    id: TaskId,
    task: Arc<dyn Task>,
    defaults: TaskInput,
    state: Mutex<NodeState>,
}

struct Attempt {
    generation: u64,
    token: CancellationToken,
    input: TaskInput,
    ctx: ExecutionContext,
}

impl TaskNode {
    pub fn new<T: Task + 'static>(id: impl Into<TaskId>, task: T) -> Self {
        Self::from_arc(id, Arc::new(task))
    }

    pub fn from_arc(id: impl Into<TaskId>, task: Arc<dyn Task>) -> Self {
        Self {
            id: id.into(),
            task,
            defaults: TaskInput::new(),
            state: Mutex::new(NodeState {
                state: TaskState::Created,
                output: None,
                error: None,
                run: None,
                generation: 0,
                engine: None,
            }),
        }
    }

    /// Sets static input values. Wired and supplied values take precedence.
    pub fn with_input(mut self, input: TaskInput) -> Self {
        self.defaults = input;
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    pub fn task_type(&self) -> &str {
        self.task.task_type()
    }

    pub fn defaults(&self) -> &TaskInput {
        &self.defaults
    }

    pub fn state(&self) -> TaskState {
        lock(&self.state).state
    }

    /// Output of the last completed run.
    pub fn output(&self) -> Option<TaskOutput> {
        lock(&self.state).output.clone()
    }

    /// Error of the last failed or aborted run.
    pub fn error(&self) -> Option<TaskError> {
        lock(&self.state).error.clone()
    }

    /// Merges static inputs, `overrides` and schema defaults.
    pub fn resolve_input(&self, overrides: Option<&TaskInput>) -> TaskInput {
        let mut input = self.defaults.clone();
        if let Some(overrides) = overrides {
            for (port, value) in overrides {
                input.insert(port.clone(), value.clone());
            }
        }
        for port in self.task.input_schema().ports() {
            if input.contains_key(&port.id) {
                continue;
            }
            if let Some(default) = &port.default_value {
                input.insert(port.id.clone(), default.clone());
            }
        }
        input
    }

    /// Schema validation followed by the task's own checks.
    pub fn validate(&self, input: &TaskInput, engine: &EngineContext) -> Result<(), TaskError> {
        self.task
            .input_schema()
            .validate(input)
            .map_err(|e| TaskError::invalid_input(format!("task {}: {}", self.id, e)))?;
        self.task.validate_input(input)?;
        self.task.check_configuration(engine)
    }

    /// Runs the task to completion.
    pub async fn run(
        &self,
        engine: &Arc<EngineContext>,
        input: Option<TaskInput>,
    ) -> Result<TaskOutput, TaskError> {
        self.run_with(engine, input.unwrap_or_default(), RunOptions::new())
            .await
    }

    /// Runs the task with explicit input overrides and run options.
    ///
    /// Cacheable tasks consult the engine's output cache first and store a
    /// fresh result only once it has settled as completed.
    pub async fn run_with(
        &self,
        engine: &Arc<EngineContext>,
        overrides: TaskInput,
        options: RunOptions,
    ) -> Result<TaskOutput, TaskError> {
        let attempt = self.begin(engine, &overrides, &options, TaskState::Running)?;
        self.execute_attempt(engine, attempt).await
    }

    /// Fast preview of the output. Never caches and never changes state.
    pub fn run_reactive(&self, overrides: Option<&TaskInput>) -> Option<TaskOutput> {
        let input = self.resolve_input(overrides);
        let previous = self.output();
        self.task.execute_reactive(&input, previous.as_ref())
    }

    /// Runs the task as an event stream.
    ///
    /// Tasks without streaming support run to completion and yield a single
    /// [`TaskEvent::Finished`]. Streamed outputs are not cached.
    pub fn run_stream(
        self: &Arc<Self>,
        engine: &Arc<EngineContext>,
        overrides: TaskInput,
        options: RunOptions,
    ) -> TaskEventStream {
        let attempt = match self.begin(engine, &overrides, &options, TaskState::Streaming) {
            Ok(attempt) => attempt,
            Err(e) => return stream::failed(e),
        };

        let events = self
            .task
            .execute_stream(attempt.input.clone(), attempt.ctx.clone());
        let Some(events) = events else {
            self.set_running_state(attempt.generation, TaskState::Running);
            let guard = RunGuard {
                node: Arc::clone(self),
                generation: attempt.generation,
            };
            let engine = Arc::clone(engine);
            let fallback = futures_stream::once(async move {
                guard
                    .node
                    .execute_attempt(&engine, attempt)
                    .await
                    .map(TaskEvent::Finished)
            });
            return Box::pin(fallback);
        };

        let driver = StreamDriver {
            run: RunGuard {
                node: Arc::clone(self),
                generation: attempt.generation,
            },
            token: attempt.token,
            progress: attempt.ctx.progress,
            events,
        };
        Box::pin(futures_stream::unfold(Some(driver), |driver| async move {
            let mut driver = driver?;
            let next = race(&driver.token, driver.events.next()).await;
            let item = match next {
                Ok(Some(Ok(TaskEvent::Progress { progress, message }))) => {
                    driver.progress.report(progress, message.as_deref());
                    return Some((Ok(TaskEvent::Progress { progress, message }), Some(driver)));
                }
                Ok(Some(Ok(TaskEvent::Chunk(chunk)))) => {
                    return Some((Ok(TaskEvent::Chunk(chunk)), Some(driver)));
                }
                Ok(Some(Ok(TaskEvent::Finished(output)))) => driver
                    .run
                    .settle(Ok(output))
                    .map(TaskEvent::Finished),
                Ok(Some(Err(e))) | Err(e) => driver
                    .run
                    .settle(Err(e))
                    .map(TaskEvent::Finished),
                Ok(None) => driver
                    .run
                    .settle(Err(TaskError::permanent("stream ended without a final output")))
                    .map(TaskEvent::Finished),
            };
            Some((item, None))
        }))
    }

    /// Moves the task to Aborted from any non-terminal state and cancels its
    /// active run. Returns false if the task had already settled.
    pub fn abort(&self) -> bool {
        let engine = {
            let mut st = lock(&self.state);
            if st.state.is_terminal() {
                return false;
            }
            st.state = TaskState::Aborted;
            st.output = None;
            st.error = Some(TaskError::Aborted);
            if let Some(run) = st.run.take() {
                run.cancel();
            }
            st.engine.clone()
        };
        tracing::debug!(task_id = %self.id, "task aborted");
        if let Some(engine) = engine {
            self.emit(&engine, EventKind::Aborted);
        }
        true
    }

    /// Returns the task to Created, cancelling an active run.
    pub fn reset(&self) {
        let mut st = lock(&self.state);
        if let Some(run) = st.run.take() {
            run.cancel();
        }
        st.generation += 1;
        st.state = TaskState::Created;
        st.output = None;
        st.error = None;
    }

    pub(crate) fn bind(&self, engine: &Arc<EngineContext>) {
        lock(&self.state).engine = Some(Arc::clone(engine));
    }

    /// Fails the task without running it, e.g. when a required input can
    /// never arrive. No-op once settled.
    pub(crate) fn fail_without_running(&self, error: TaskError) -> bool {
        let engine = {
            let mut st = lock(&self.state);
            if st.state.is_terminal() {
                return false;
            }
            st.state = TaskState::Failed;
            st.output = None;
            st.error = Some(error.clone());
            st.engine.clone()
        };
        tracing::debug!(task_id = %self.id, error = %error, "task failed without running");
        if let Some(engine) = engine {
            self.emit(&engine, EventKind::Failed { error });
        }
        true
    }

    fn begin(
        &self,
        engine: &Arc<EngineContext>,
        overrides: &TaskInput,
        options: &RunOptions,
        running: TaskState,
    ) -> Result<Attempt, TaskError> {
        let input = self.resolve_input(Some(overrides));
        let source = options.cancellation.child_source();
        let token = source.token();

        let generation = {
            let mut st = lock(&self.state);
            if st.state.is_active() {
                return Err(TaskError::configuration(format!(
                    "task {} is already running",
                    self.id
                )));
            }
            st.generation += 1;
            st.state = TaskState::Validating;
            st.output = None;
            st.error = None;
            st.run = Some(source);
            st.engine = Some(Arc::clone(engine));
            st.generation
        };

        if let Err(e) = self.validate(&input, engine) {
            tracing::debug!(task_id = %self.id, error = %e, "task input rejected");
            // Failed with the validation error; the caller sees it directly.
            let _ = self.settle(generation, Err(e.clone()));
            return Err(e);
        }

        self.set_running_state(generation, running);
        tracing::debug!(task_id = %self.id, task_type = self.task_type(), "task started");
        self.emit(engine, EventKind::Started);

        let progress = {
            let engine = Arc::clone(engine);
            let scope = self.scope();
            ProgressReporter::new(move |progress, message| {
                engine.emit(LifecycleEvent::now(
                    scope.clone(),
                    EventKind::Progress {
                        progress,
                        message: message.map(str::to_string),
                    },
                ));
            })
        };
        let ctx = ExecutionContext {
            task_id: self.id.clone(),
            run_id: options.run_id.clone(),
            progress,
            cancellation: token.clone(),
            engine: Arc::clone(engine),
        };
        Ok(Attempt {
            generation,
            token,
            input,
            ctx,
        })
    }

    async fn execute_attempt(
        &self,
        engine: &Arc<EngineContext>,
        attempt: Attempt,
    ) -> Result<TaskOutput, TaskError> {
        let Attempt {
            generation,
            token,
            input,
            ctx,
        } = attempt;

        let cache = engine
            .cache()
            .filter(|_| self.task.cacheable() && engine.config().cache_enabled);
        let key = cache.map(|_| Fingerprint::compute(self.task_type(), &Value::Object(input.clone())));

        if let (Some(cache), Some(key)) = (cache, key.as_ref()) {
            if let Some(output) = cache.get(key).await {
                return self.settle(generation, Ok(output));
            }
            tracing::debug!(task_id = %self.id, fingerprint = %key, "output cache miss");
        }

        let task = Arc::clone(&self.task);
        let result = race_detached(&token, async move { task.execute(input, ctx).await })
            .await
            .and_then(|r| r);
        let output = self.settle(generation, result)?;

        if let (Some(cache), Some(key)) = (cache, key) {
            cache.insert(key, output.clone()).await;
        }
        Ok(output)
    }

    /// Aborts run `generation` if it is still active, cancelling its token.
    fn abandon(&self, generation: u64) {
        {
            let st = lock(&self.state);
            if st.generation != generation || !st.state.is_active() {
                return;
            }
            if let Some(run) = &st.run {
                run.cancel();
            }
        }
        tracing::debug!(task_id = %self.id, "run dropped before settling");
        let _ = self.settle(generation, Err(TaskError::Aborted));
    }

    fn set_running_state(&self, generation: u64, running: TaskState) {
        let mut st = lock(&self.state);
        if st.generation == generation && st.state.is_active() {
            st.state = running;
        }
    }

    /// Records the outcome of run `generation`.
    ///
    /// Cancellation observed before settling turns any result into an abort.
    /// A run superseded by abort or reset yields `Aborted` and changes nothing.
    fn settle(
        &self,
        generation: u64,
        result: Result<TaskOutput, TaskError>,
    ) -> Result<TaskOutput, TaskError> {
        let (result, engine) = {
            let mut st = lock(&self.state);
            if st.generation != generation || !st.state.is_active() {
                return Err(TaskError::Aborted);
            }
            let cancelled = st.run.take().is_some_and(|run| run.is_cancelled());
            let result = if cancelled {
                Err(TaskError::Aborted)
            } else {
                result
            };
            match &result {
                Ok(output) => {
                    st.state = TaskState::Completed;
                    st.output = Some(output.clone());
                    st.error = None;
                }
                Err(TaskError::Aborted) => {
                    st.state = TaskState::Aborted;
                    st.error = Some(TaskError::Aborted);
                }
                Err(e) => {
                    st.state = TaskState::Failed;
                    st.error = Some(e.clone());
                }
            }
            (result, st.engine.clone())
        };

        let kind = match &result {
            Ok(_) => {
                tracing::debug!(task_id = %self.id, "task completed");
                EventKind::Completed
            }
            Err(TaskError::Aborted) => {
                tracing::debug!(task_id = %self.id, "task aborted while running");
                EventKind::Aborted
            }
            Err(e) => {
                tracing::warn!(task_id = %self.id, error = %e, "task failed");
                EventKind::Failed { error: e.clone() }
            }
        };
        if let Some(engine) = engine {
            self.emit(&engine, kind);
        }
        result
    }

    fn scope(&self) -> EventScope {
        EventScope::Task {
            task_id: self.id.to_string(),
            task_type: self.task_type().to_string(),
        }
    }

    fn emit(&self, engine: &EngineContext, kind: EventKind) {
        engine.emit(LifecycleEvent::now(self.scope(), kind));
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("task_type", &self.task_type())
            .field("state", &self.state())
            .finish()
    }
}

/// Settles its run as aborted when dropped before the run settled.
struct RunGuard {
    node: Arc<TaskNode>,
    generation: u64,
}

impl RunGuard {
    fn settle(&self, result: Result<TaskOutput, TaskError>) -> Result<TaskOutput, TaskError> {
        self.node.settle(self.generation, result)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.node.abandon(self.generation);
    }
}

struct StreamDriver {
    run: RunGuard,
    token: CancellationToken,
    progress: ProgressReporter,
    events: TaskEventStream,
}
