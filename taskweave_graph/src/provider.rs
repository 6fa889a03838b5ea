//! Provider dispatch.
//!
//! Run-functions are registered per (task type, provider) pair and looked up
//! through a two-level table. A provider may register a plain run-function,
//! a streaming one, or both.

use crate::stream::{collect_output, TaskEvent, TaskEventStream};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use taskweave_core::{CancellationToken, ProgressReporter, TaskError};
use taskweave_queue::{Job, JobContext, JobEvent, JobEventStream, JobRunner};

/// Provider-side implementation of a task type.
#[async_trait]
pub trait RunFunction: Send + Sync {
    async fn run(
        &self,
        input: Value,
        config: Value,
        progress: ProgressReporter,
        cancellation: CancellationToken,
    ) -> Result<Value, TaskError>;
}

/// Streaming implementation of a task type.
pub trait StreamFunction: Send + Sync {
    fn stream(&self, input: Value, config: Value, cancellation: CancellationToken) -> TaskEventStream;
}

struct FnRun<F>(F);

#[async_trait]
impl<F, Fut> RunFunction for FnRun<F>
where
    F: Fn(Value, Value, ProgressReporter, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send,
{
    async fn run(
        &self,
        input: Value,
        config: Value,
        progress: ProgressReporter,
        cancellation: CancellationToken,
    ) -> Result<Value, TaskError> {
        (self.0)(input, config, progress, cancellation).await
    }
}

struct FnStream<F>(F);

impl<F> StreamFunction for FnStream<F>
where
    F: Fn(Value, Value, CancellationToken) -> TaskEventStream + Send + Sync,
{
    fn stream(&self, input: Value, config: Value, cancellation: CancellationToken) -> TaskEventStream {
        (self.0)(input, config, cancellation)
    }
}

#[derive(Default)]
struct ProviderEntry {
    run: Option<Arc<dyn RunFunction>>,
    stream: Option<Arc<dyn StreamFunction>>,
}

type ProviderTable = HashMap<String, HashMap<String, ProviderEntry>>;

/// task type → provider → run-functions.
#[derive(Default)]
pub struct ProviderRegistry {
    table: RwLock<ProviderTable>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a run-function. A previous registration for the same pair is
    /// replaced.
    pub fn register(&self, task_type: &str, provider: &str, func: Arc<dyn RunFunction>) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let entry = table
            .entry(task_type.to_string())
            .or_default()
            .entry(provider.to_string())
            .or_default();
        if entry.run.is_some() {
            tracing::warn!(task_type, provider, "replacing registered run-function");
        } else {
            tracing::debug!(task_type, provider, "run-function registered");
        }
        entry.run = Some(func);
    }

    /// Registers an async closure as run-function.
    pub fn register_fn<F, Fut>(&self, task_type: &str, provider: &str, func: F)
    where
        F: Fn(Value, Value, ProgressReporter, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.register(task_type, provider, Arc::new(FnRun(func)));
    }

    /// Registers a streaming function. A previous registration for the same
    /// pair is replaced.
    pub fn register_stream(&self, task_type: &str, provider: &str, func: Arc<dyn StreamFunction>) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let entry = table
            .entry(task_type.to_string())
            .or_default()
            .entry(provider.to_string())
            .or_default();
        if entry.stream.is_some() {
            tracing::warn!(task_type, provider, "replacing registered stream function");
        }
        entry.stream = Some(func);
    }

    pub fn register_stream_fn<F>(&self, task_type: &str, provider: &str, func: F)
    where
        F: Fn(Value, Value, CancellationToken) -> TaskEventStream + Send + Sync + 'static,
    {
        self.register_stream(task_type, provider, Arc::new(FnStream(func)));
    }

    /// Resolves the run-function for a pair.
    pub fn run_function(&self, task_type: &str, provider: &str) -> Result<Arc<dyn RunFunction>, TaskError> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_type)
            .and_then(|providers| providers.get(provider))
            .and_then(|entry| entry.run.clone())
            .ok_or_else(|| {
                TaskError::configuration(format!(
                    "no run-function registered for task type '{}' and provider '{}'",
                    task_type, provider
                ))
            })
    }

    pub fn stream_function(&self, task_type: &str, provider: &str) -> Option<Arc<dyn StreamFunction>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_type)
            .and_then(|providers| providers.get(provider))
            .and_then(|entry| entry.stream.clone())
    }

    /// Whether anything (run or stream) is registered for the pair.
    pub fn contains(&self, task_type: &str, provider: &str) -> bool {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_type)
            .and_then(|providers| providers.get(provider))
            .is_some_and(|entry| entry.run.is_some() || entry.stream.is_some())
    }

    /// Providers registered for a task type, sorted.
    pub fn providers(&self, task_type: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_type)
            .map(|providers| providers.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn remove(&self, task_type: &str, provider: &str) -> bool {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let Some(providers) = table.get_mut(task_type) else {
            return false;
        };
        let removed = providers.remove(provider).is_some();
        if providers.is_empty() {
            table.remove(task_type);
        }
        removed
    }

    /// Runs the pair's run-function, or drains its stream when only a
    /// streaming function is registered.
    pub async fn invoke(
        &self,
        task_type: &str,
        provider: &str,
        input: Value,
        config: Value,
        progress: ProgressReporter,
        cancellation: CancellationToken,
    ) -> Result<Value, TaskError> {
        match self.run_function(task_type, provider) {
            Ok(func) => func.run(input, config, progress, cancellation).await,
            Err(missing) => match self.stream_function(task_type, provider) {
                Some(func) => {
                    let output = collect_output(func.stream(input, config, cancellation)).await?;
                    Ok(output.to_value())
                }
                None => Err(missing),
            },
        }
    }
}

/// Job payload for provider dispatch through a queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderJob {
    pub task_type: String,
    pub provider: String,
    pub input: Value,
    #[serde(default)]
    pub config: Value,
}

impl ProviderJob {
    pub fn from_job(job: &Job) -> Result<Self, TaskError> {
        serde_json::from_value(job.input.clone())
            .map_err(|e| TaskError::invalid_input(format!("malformed provider job: {}", e)))
    }
}

/// [`JobRunner`] executing [`ProviderJob`] payloads through a registry.
pub struct ProviderJobRunner {
    providers: Arc<ProviderRegistry>,
}

impl ProviderJobRunner {
    pub fn new(providers: Arc<ProviderRegistry>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl JobRunner for ProviderJobRunner {
    async fn run(&self, job: &Job, ctx: JobContext) -> Result<Value, TaskError> {
        let payload = ProviderJob::from_job(job)?;
        self.providers
            .invoke(
                &payload.task_type,
                &payload.provider,
                payload.input,
                payload.config,
                ctx.progress,
                ctx.cancellation,
            )
            .await
    }

    fn run_stream(&self, job: &Job, ctx: JobContext) -> Option<JobEventStream> {
        let payload = ProviderJob::from_job(job).ok()?;
        let func = self.providers.stream_function(&payload.task_type, &payload.provider)?;
        let events = func.stream(payload.input, payload.config, ctx.cancellation);
        Some(Box::pin(events.map(|item| {
            item.map(|event| match event {
                TaskEvent::Progress { progress, message } => JobEvent::Progress { progress, message },
                TaskEvent::Chunk(chunk) => JobEvent::Chunk(chunk),
                TaskEvent::Finished(output) => JobEvent::Finished(output.to_value()),
            })
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream;
    use crate::task::TaskOutput;
    use serde_json::json;

    fn echo_registry() -> ProviderRegistry {
        let registry = ProviderRegistry::new();
        registry.register_fn("echo", "local", |input, _config, _progress, _cancel| async move {
            Ok::<_, TaskError>(input)
        });
        registry
    }

    #[tokio::test]
    async fn test_dispatch_by_type_and_provider() {
        let registry = echo_registry();
        let func = registry.run_function("echo", "local").unwrap();
        let out = func
            .run(json!({"x": 1}), Value::Null, ProgressReporter::noop(), CancellationToken::never())
            .await
            .unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[test]
    fn test_missing_provider_is_configuration_error() {
        let registry = echo_registry();
        let err = registry.run_function("echo", "remote").err().unwrap();
        assert!(matches!(err, TaskError::Configuration(_)));
        assert!(registry.run_function("other", "local").is_err());
    }

    #[tokio::test]
    async fn test_reregistration_last_writer_wins() {
        let registry = echo_registry();
        registry.register_fn("echo", "local", |_input, _config, _progress, _cancel| async move {
            Ok::<_, TaskError>(json!("replaced"))
        });
        let out = registry
            .invoke("echo", "local", json!(1), Value::Null, ProgressReporter::noop(), CancellationToken::never())
            .await
            .unwrap();
        assert_eq!(out, json!("replaced"));
        assert_eq!(registry.providers("echo"), vec!["local".to_string()]);
    }

    #[tokio::test]
    async fn test_invoke_drains_stream_only_provider() {
        let registry = ProviderRegistry::new();
        registry.register_stream_fn("chat", "local", |_input, _config, _cancel| {
            stream::finished(TaskOutput::new().with("text", json!("hi")))
        });
        assert!(registry.contains("chat", "local"));
        let out = registry
            .invoke("chat", "local", json!({}), Value::Null, ProgressReporter::noop(), CancellationToken::never())
            .await
            .unwrap();
        assert_eq!(out, json!({"text": "hi"}));
    }

    #[test]
    fn test_remove_drops_empty_task_type() {
        let registry = echo_registry();
        assert!(registry.remove("echo", "local"));
        assert!(!registry.remove("echo", "local"));
        assert!(registry.providers("echo").is_empty());
    }

    #[test]
    fn test_provider_job_payload_is_validated() {
        let job = Job::new("q", json!({"taskType": "echo"}));
        let err = ProviderJob::from_job(&job).unwrap_err();
        assert!(matches!(err, TaskError::InvalidInput(_)));
    }
}
