//! Built-in task implementations.
//!
//! - [`FunctionTask`]: wraps an async closure
//! - [`ProviderTask`]: dispatches inline through the provider registry
//! - [`QueuedTask`]: submits a provider job to a named queue and waits for it

use crate::context::EngineContext;
use crate::provider::ProviderJob;
use crate::stream::{self, TaskEventStream};
use crate::task::{ExecutionContext, Task, TaskInput, TaskOutput};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{self as futures_stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use taskweave_core::{TaskError, TaskSchema};
use taskweave_queue::SubmitOptions;

type ExecuteFn =
    dyn Fn(TaskInput, ExecutionContext) -> BoxFuture<'static, Result<TaskOutput, TaskError>> + Send + Sync;
type ValidateFn = dyn Fn(&TaskInput) -> Result<(), TaskError> + Send + Sync;

/// Task backed by an async closure.
#[derive(Clone)]
pub struct FunctionTask {
    task_type: String,
    input: TaskSchema,
    output: TaskSchema,
    cacheable: bool,
    config: Value,
    func: Arc<ExecuteFn>,
    validator: Option<Arc<ValidateFn>>,
}

impl FunctionTask {
    pub fn new<F, Fut>(task_type: impl Into<String>, func: F) -> Self
    where
        F: Fn(TaskInput, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutput, TaskError>> + Send + 'static,
    {
        Self {
            task_type: task_type.into(),
            input: TaskSchema::new(),
            output: TaskSchema::new(),
            cacheable: false,
            config: Value::Null,
            func: Arc::new(
                move |input: TaskInput,
                      ctx: ExecutionContext|
                      -> BoxFuture<'static, Result<TaskOutput, TaskError>> {
                    Box::pin(func(input, ctx))
                },
            ),
            validator: None,
        }
    }

    pub fn input_schema(mut self, schema: TaskSchema) -> Self {
        self.input = schema;
        self
    }

    pub fn output_schema(mut self, schema: TaskSchema) -> Self {
        self.output = schema;
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Adds a semantic input check run after schema validation.
    pub fn validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&TaskInput) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }
}

impl fmt::Debug for FunctionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTask")
            .field("task_type", &self.task_type)
            .field("cacheable", &self.cacheable)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Task for FunctionTask {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    fn input_schema(&self) -> &TaskSchema {
        &self.input
    }

    fn output_schema(&self) -> &TaskSchema {
        &self.output
    }

    fn cacheable(&self) -> bool {
        self.cacheable
    }

    fn validate_input(&self, input: &TaskInput) -> Result<(), TaskError> {
        match &self.validator {
            Some(validator) => validator(input),
            None => Ok(()),
        }
    }

    fn config(&self) -> Value {
        self.config.clone()
    }

    async fn execute(&self, input: TaskInput, ctx: ExecutionContext) -> Result<TaskOutput, TaskError> {
        (self.func)(input, ctx).await
    }
}

/// Configuration record shared by [`ProviderTask`] and [`QueuedTask`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTaskConfig {
    pub provider: String,
    /// Resolved configuration handed to the run-function
    #[serde(default)]
    pub config: Value,
    /// Target queue; only used by queued tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl ProviderTaskConfig {
    pub fn from_value(value: &Value) -> Result<Self, TaskError> {
        serde_json::from_value(value.clone())
            .map_err(|e| TaskError::configuration(format!("invalid provider task config: {}", e)))
    }
}

/// Task dispatching inline to a registered run-function.
#[derive(Clone, Debug)]
pub struct ProviderTask {
    task_type: String,
    provider: String,
    config: Value,
    input: TaskSchema,
    output: TaskSchema,
    cacheable: bool,
}

impl ProviderTask {
    pub fn new(task_type: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            provider: provider.into(),
            config: Value::Null,
            input: TaskSchema::new(),
            output: TaskSchema::new(),
            cacheable: false,
        }
    }

    pub fn from_config(task_type: impl Into<String>, config: &Value) -> Result<Self, TaskError> {
        let parsed = ProviderTaskConfig::from_value(config)?;
        Ok(Self::new(task_type, parsed.provider).with_config(parsed.config))
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn input_schema(mut self, schema: TaskSchema) -> Self {
        self.input = schema;
        self
    }

    pub fn output_schema(mut self, schema: TaskSchema) -> Self {
        self.output = schema;
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }
}

#[async_trait]
impl Task for ProviderTask {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    fn input_schema(&self) -> &TaskSchema {
        &self.input
    }

    fn output_schema(&self) -> &TaskSchema {
        &self.output
    }

    fn cacheable(&self) -> bool {
        self.cacheable
    }

    fn check_configuration(&self, engine: &EngineContext) -> Result<(), TaskError> {
        if engine.providers().contains(&self.task_type, &self.provider) {
            Ok(())
        } else {
            Err(TaskError::configuration(format!(
                "no provider '{}' registered for task type '{}'",
                self.provider, self.task_type
            )))
        }
    }

    fn config(&self) -> Value {
        json!({ "provider": self.provider, "config": self.config })
    }

    async fn execute(&self, input: TaskInput, ctx: ExecutionContext) -> Result<TaskOutput, TaskError> {
        let value = ctx
            .engine
            .providers()
            .invoke(
                &self.task_type,
                &self.provider,
                Value::Object(input),
                self.config.clone(),
                ctx.progress.clone(),
                ctx.cancellation.clone(),
            )
            .await?;
        Ok(TaskOutput::from_value(value))
    }

    fn execute_stream(&self, input: TaskInput, ctx: ExecutionContext) -> Option<TaskEventStream> {
        let func = ctx
            .engine
            .providers()
            .stream_function(&self.task_type, &self.provider)?;
        Some(func.stream(Value::Object(input), self.config.clone(), ctx.cancellation))
    }
}

/// Task running its provider job through a named queue.
#[derive(Clone, Debug)]
pub struct QueuedTask {
    task_type: String,
    provider: String,
    queue: String,
    config: Value,
    priority: Option<i32>,
    input: TaskSchema,
    output: TaskSchema,
}

impl QueuedTask {
    pub fn new(
        task_type: impl Into<String>,
        provider: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            provider: provider.into(),
            queue: queue.into(),
            config: Value::Null,
            priority: None,
            input: TaskSchema::new(),
            output: TaskSchema::new(),
        }
    }

    /// Builds from a config record; the queue defaults to the task type.
    pub fn from_config(task_type: impl Into<String>, config: &Value) -> Result<Self, TaskError> {
        let task_type = task_type.into();
        let parsed = ProviderTaskConfig::from_value(config)?;
        let queue = parsed.queue.unwrap_or_else(|| task_type.clone());
        let mut task = Self::new(task_type, parsed.provider, queue).with_config(parsed.config);
        task.priority = parsed.priority;
        Ok(task)
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn input_schema(mut self, schema: TaskSchema) -> Self {
        self.input = schema;
        self
    }

    pub fn output_schema(mut self, schema: TaskSchema) -> Self {
        self.output = schema;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn payload(&self, input: TaskInput) -> Result<Value, TaskError> {
        Ok(serde_json::to_value(ProviderJob {
            task_type: self.task_type.clone(),
            provider: self.provider.clone(),
            input: Value::Object(input),
            config: self.config.clone(),
        })?)
    }

    fn options(&self, ctx: &ExecutionContext) -> SubmitOptions {
        let mut options = SubmitOptions::new().cancellation(ctx.cancellation.clone());
        if let Some(run_id) = &ctx.run_id {
            options = options.run_id(run_id.clone());
        }
        if let Some(priority) = self.priority {
            options = options.priority(priority);
        }
        options
    }
}

#[async_trait]
impl Task for QueuedTask {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    fn input_schema(&self) -> &TaskSchema {
        &self.input
    }

    fn output_schema(&self) -> &TaskSchema {
        &self.output
    }

    fn check_configuration(&self, engine: &EngineContext) -> Result<(), TaskError> {
        if engine.queues().contains(&self.queue) {
            Ok(())
        } else {
            Err(TaskError::configuration(format!(
                "queue '{}' is not registered",
                self.queue
            )))
        }
    }

    fn config(&self) -> Value {
        serde_json::to_value(ProviderTaskConfig {
            provider: self.provider.clone(),
            config: self.config.clone(),
            queue: Some(self.queue.clone()),
            priority: self.priority,
        })
        .unwrap_or(Value::Null)
    }

    async fn execute(&self, input: TaskInput, ctx: ExecutionContext) -> Result<TaskOutput, TaskError> {
        let queue = ctx.engine.queues().get(&self.queue)?;
        let handle = queue
            .client()
            .submit(self.payload(input)?, self.options(&ctx))
            .await?;
        tracing::debug!(task_id = %ctx.task_id, job_id = %handle.id(), queue = %self.queue, "job submitted");
        let value = handle.wait().await?;
        Ok(TaskOutput::from_value(value))
    }

    fn execute_stream(&self, input: TaskInput, ctx: ExecutionContext) -> Option<TaskEventStream> {
        let payload = match self.payload(input) {
            Ok(payload) => payload,
            Err(e) => return Some(stream::failed(e)),
        };
        let options = self.options(&ctx);
        let queue_name = self.queue.clone();
        let submitted = async move {
            let queue = ctx.engine.queues().get(&queue_name)?;
            let handle = queue.client().submit(payload, options).await?;
            Ok::<_, TaskError>(handle)
        };
        let events = futures_stream::once(submitted).flat_map(|submitted| match submitted {
            Ok(handle) => stream::from_job_events(handle.stream()),
            Err(e) => stream::failed(e),
        });
        Some(Box::pin(events))
    }
}
