//! Integration tests for graph scheduling, queued tasks and streaming.

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::{stream, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskweave_core::events::{EventKind, EventLog, EventScope};
use taskweave_core::{
    CancellationToken, CancellationTokenSource, Compatibility, PortDefinition, PortSchema,
    QueueConfig, TaskError, TaskSchema,
};
use taskweave_graph::{
    EngineContext, FunctionTask, GraphStatus, ProviderJobRunner, ProviderRegistry, ProviderTask,
    QueuedTask, RunOptions, TaskEvent, TaskEventStream, TaskGraph, TaskInput, TaskNode,
    TaskOutput, TaskState,
};
use taskweave_queue::{InMemoryRateLimiterStorage, JobQueue, QueueRegistry, RateLimiter};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn engine() -> Arc<EngineContext> {
    init_tracing();
    Arc::new(EngineContext::default())
}

fn input(pairs: &[(&str, Value)]) -> TaskInput {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect::<Map<String, Value>>()
}

fn constant(value: Value) -> FunctionTask {
    FunctionTask::new("constant", move |_input: TaskInput, _ctx| {
        let value = value.clone();
        async move { Ok(TaskOutput::new().with("value", value)) }
    })
}

fn failing(message: &'static str) -> FunctionTask {
    FunctionTask::new("boom", move |_input: TaskInput, _ctx| async move {
        Err::<TaskOutput, _>(TaskError::permanent(message))
    })
}

/// Echoes every input port back, requiring `ports`.
fn requiring(ports: &[&str]) -> FunctionTask {
    let schema = ports.iter().fold(TaskSchema::new(), |schema, port| {
        schema.port(PortDefinition::required(*port, PortSchema::any()))
    });
    FunctionTask::new("echo", |input: TaskInput, _ctx| async move {
        Ok(TaskOutput::from_value(Value::Object(input)))
    })
    .input_schema(schema)
}

#[tokio::test]
async fn test_failure_fails_dependents_and_spares_other_branches() {
    // a -> b -> d <- c
    let mut graph = TaskGraph::with_context(engine());
    graph.add_task("a", failing("upstream broke")).unwrap();
    graph.add_task("b", requiring(&["value"])).unwrap();
    graph.add_task("c", constant(json!(1))).unwrap();
    graph.add_task("d", requiring(&["left", "right"])).unwrap();
    graph.connect("a", "value", "b", "value").unwrap();
    graph.connect("b", "value", "d", "left").unwrap();
    graph.connect("c", "value", "d", "right").unwrap();

    let result = graph.run().await.unwrap();

    assert_eq!(result.status(), GraphStatus::Failed);
    let (failed, err) = result.first_failure().unwrap();
    assert_eq!(failed.as_str(), "a");
    assert_eq!(err, &TaskError::permanent("upstream broke"));

    assert!(matches!(
        result.error("b"),
        Some(TaskError::DependencyFailed { dependency, .. }) if dependency == "a"
    ));
    assert!(matches!(
        result.error("d"),
        Some(TaskError::DependencyFailed { dependency, .. }) if dependency == "b"
    ));
    assert_eq!(result.output("c").unwrap().get("value"), Some(&json!(1)));

    assert_eq!(graph.node("b").unwrap().state(), TaskState::Failed);
    assert_eq!(graph.node("c").unwrap().state(), TaskState::Completed);
    assert_eq!(graph.node("d").unwrap().state(), TaskState::Failed);
}

#[tokio::test]
async fn test_abort_stops_running_task_and_dependents() {
    let started = Arc::new(AtomicUsize::new(0));
    let slow = {
        let started = started.clone();
        FunctionTask::new("slow", move |_input: TaskInput, _ctx| {
            started.fetch_add(1, Ordering::SeqCst);
            async move {
                // Ignores its token; the scheduler must not wait for it.
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(TaskOutput::new().with("value", json!("too late")))
            }
        })
    };

    let mut graph = TaskGraph::with_context(engine());
    graph.add_task("a", slow).unwrap();
    graph.add_task("b", requiring(&["value"])).unwrap();
    graph.connect("a", "value", "b", "value").unwrap();

    let (result, _) = tokio::join!(graph.run(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        graph.abort();
    });
    let result = result.unwrap();

    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(result.status(), GraphStatus::Aborted);
    assert!(result.aborted.iter().any(|id| id.as_str() == "a"));
    assert!(result.aborted.iter().any(|id| id.as_str() == "b"));
    assert_eq!(graph.node("a").unwrap().state(), TaskState::Aborted);
    assert_eq!(graph.node("b").unwrap().state(), TaskState::Aborted);
    assert_eq!(result.into_result().unwrap_err(), TaskError::Aborted);
}

#[tokio::test]
async fn test_external_cancellation_aborts_run() {
    let mut graph = TaskGraph::with_context(engine());
    graph
        .add_task(
            "wait",
            FunctionTask::new("wait", |_input: TaskInput, ctx| async move {
                ctx.cancellation.cancelled().await;
                Err::<TaskOutput, _>(TaskError::Aborted)
            }),
        )
        .unwrap();

    let source = CancellationTokenSource::new();
    source.cancel_after(Duration::from_millis(20));
    let result = graph.run_with(HashMap::new(), source.token()).await.unwrap();

    assert_eq!(result.status(), GraphStatus::Aborted);
    assert_eq!(graph.node("wait").unwrap().state(), TaskState::Aborted);
}

#[tokio::test]
async fn test_cacheable_task_executes_once_across_runs() {
    let calls = Arc::new(AtomicUsize::new(0));
    let square = {
        let calls = calls.clone();
        FunctionTask::new("square", move |input: TaskInput, _ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            let n = input.get("n").and_then(Value::as_i64).unwrap_or(0);
            async move { Ok(TaskOutput::new().with("value", json!(n * n))) }
        })
        .cacheable(true)
    };

    let mut graph = TaskGraph::with_context(engine());
    graph
        .add_node(TaskNode::new("sq", square).with_input(input(&[("n", json!(7))])))
        .unwrap();

    let first = graph.run().await.unwrap();
    let second = graph.run().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.output("sq"), second.output("sq"));
    assert_eq!(second.output("sq").unwrap().get("value"), Some(&json!(49)));
    assert_eq!(graph.engine().cache().unwrap().len().await, 1);
}

#[tokio::test]
async fn test_runtime_format_mismatch_fails_only_that_dataflow() {
    let model_port = |format: &str| {
        TaskSchema::new().port(PortDefinition::required(
            "model",
            PortSchema::string().try_with_format(format).unwrap(),
        ))
    };
    let loader = FunctionTask::new("load_model", |_input: TaskInput, _ctx| async move {
        Ok(TaskOutput::new()
            .with("model", json!("clip-vit"))
            .with_format("model", "model:ImageTask".parse().unwrap()))
    })
    .output_schema(TaskSchema::new().port(PortDefinition::required("model", PortSchema::string())));
    let any_model = requiring(&[]).input_schema(model_port("model"));
    let text_model = requiring(&[]).input_schema(model_port("model:TextEmbeddingTask"));

    let mut graph = TaskGraph::with_context(engine());
    graph.add_task("loader", loader).unwrap();
    graph.add_task("any", any_model).unwrap();
    graph.add_task("text", text_model).unwrap();
    graph.add_task("other", constant(json!("unrelated"))).unwrap();
    assert_eq!(
        graph.connect("loader", "model", "any", "model").unwrap(),
        Compatibility::Deferred
    );
    assert_eq!(
        graph.connect("loader", "model", "text", "model").unwrap(),
        Compatibility::Deferred
    );

    let result = graph.run().await.unwrap();

    assert_eq!(result.status(), GraphStatus::Failed);
    assert!(matches!(
        result.error("text"),
        Some(TaskError::RuntimeIncompatibility { source_format, target_format, .. })
            if source_format == "model:ImageTask" && target_format == "model:TextEmbeddingTask"
    ));
    assert_eq!(graph.node("text").unwrap().state(), TaskState::Failed);
    assert_eq!(result.output("any").unwrap().get("model"), Some(&json!("clip-vit")));
    assert!(result.output("other").is_some());
}

#[tokio::test]
async fn test_queued_tasks_respect_queue_rate_limit() {
    init_tracing();
    let starts: Arc<Mutex<Vec<DateTime<Utc>>>> = Arc::new(Mutex::new(Vec::new()));
    let providers = Arc::new(ProviderRegistry::new());
    {
        let starts = starts.clone();
        providers.register_fn("embed", "local", move |input, _config, _progress, _cancel| {
            starts.lock().unwrap().push(Utc::now());
            async move {
                let text = input.get("text").and_then(Value::as_str).unwrap_or_default();
                Ok(json!({ "length": text.len() }))
            }
        });
    }

    let window = Duration::from_millis(300);
    let queue = Arc::new(
        JobQueue::builder("embeddings")
            .limiter(Arc::new(RateLimiter::new(
                Arc::new(InMemoryRateLimiterStorage::new()),
                3,
                window,
            )))
            .runner(Arc::new(ProviderJobRunner::new(providers.clone())))
            .config(QueueConfig {
                poll_interval_ms: 5,
                ..QueueConfig::default()
            })
            .build()
            .unwrap(),
    );
    let queues = Arc::new(QueueRegistry::new());
    queues.register(queue.clone());
    queue.start().await.unwrap();

    let engine = Arc::new(
        EngineContext::default()
            .with_providers(providers)
            .with_queues(queues),
    );
    let mut graph = TaskGraph::with_context(engine);
    for (i, text) in ["a", "bb", "ccc", "dddd"].iter().enumerate() {
        let task = QueuedTask::new("embed", "local", "embeddings");
        let node = TaskNode::new(format!("embed{}", i), task).with_input(input(&[("text", json!(text))]));
        graph.add_node(node).unwrap();
    }

    let result = graph.run().await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.output("embed3").unwrap().get("length"), Some(&json!(4)));

    let mut starts = starts.lock().unwrap().clone();
    starts.sort();
    assert_eq!(starts.len(), 4);
    // Allow for scheduling latency between admission and the recorded start.
    assert!(starts[3] - starts[0] >= TimeDelta::milliseconds(250));
    queue.stop().await;
}

#[tokio::test]
async fn test_queued_task_without_queue_is_rejected_before_running() {
    let mut graph = TaskGraph::with_context(engine());
    graph
        .add_task("q", QueuedTask::new("embed", "local", "missing"))
        .unwrap();

    let err = graph.run().await.unwrap_err();
    assert!(err.is_caller_error());
    assert_eq!(graph.node("q").unwrap().state(), TaskState::Created);
}

#[tokio::test]
async fn test_provider_stream_yields_chunks_then_output() {
    init_tracing();
    let providers = Arc::new(ProviderRegistry::new());
    providers.register_stream_fn("generate", "local", |input, _config, _cancel| -> TaskEventStream {
        let prompt = input.get("prompt").and_then(Value::as_str).unwrap_or_default().to_string();
        let events: Vec<Result<TaskEvent, TaskError>> = vec![
            Ok(TaskEvent::Progress {
                progress: 50.0,
                message: None,
            }),
            Ok(TaskEvent::Chunk(json!("he"))),
            Ok(TaskEvent::Chunk(json!("llo"))),
            Ok(TaskEvent::Finished(TaskOutput::new().with("text", json!(prompt)))),
        ];
        Box::pin(stream::iter(events))
    });
    let log = EventLog::new("stream");
    let engine = Arc::new(
        EngineContext::default()
            .with_providers(providers)
            .with_events(Arc::new(log.clone())),
    );

    let node = Arc::new(TaskNode::new("gen", ProviderTask::new("generate", "local")));
    let events: Vec<_> = node
        .run_stream(&engine, input(&[("prompt", json!("hello"))]), RunOptions::new())
        .collect()
        .await;

    let chunks: Vec<&Value> = events
        .iter()
        .filter_map(|e| match e {
            Ok(TaskEvent::Chunk(chunk)) => Some(chunk),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec![&json!("he"), &json!("llo")]);
    match events.last() {
        Some(Ok(TaskEvent::Finished(output))) => assert_eq!(output.get("text"), Some(&json!("hello"))),
        other => panic!("expected final output, got {:?}", other),
    }
    assert_eq!(node.state(), TaskState::Completed);
    assert!(log
        .events()
        .iter()
        .any(|e| matches!(e.event, EventKind::Progress { progress, .. } if progress == 50.0)));

    // Without streaming, the same provider is drained to a single output.
    let plain = node
        .run(&engine, Some(input(&[("prompt", json!("again"))])))
        .await
        .unwrap();
    assert_eq!(plain.get("text"), Some(&json!("again")));
}

#[tokio::test]
async fn test_dropped_stream_aborts_task_and_cancels_provider() {
    init_tracing();
    let seen: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
    let providers = Arc::new(ProviderRegistry::new());
    {
        let seen = seen.clone();
        providers.register_stream_fn("generate", "local", move |_input, _config, cancel| -> TaskEventStream {
            *seen.lock().unwrap() = Some(cancel);
            Box::pin(stream::once(async { Ok(TaskEvent::Chunk(json!("he"))) }).chain(stream::pending()))
        });
    }
    let log = EventLog::new("dropped");
    let engine = Arc::new(
        EngineContext::default()
            .with_providers(providers)
            .with_events(Arc::new(log.clone())),
    );

    let node = Arc::new(TaskNode::new("gen", ProviderTask::new("generate", "local")));
    let mut events = node.run_stream(&engine, TaskInput::new(), RunOptions::new());
    assert_eq!(events.next().await, Some(Ok(TaskEvent::Chunk(json!("he")))));
    assert_eq!(node.state(), TaskState::Streaming);
    drop(events);

    assert_eq!(node.state(), TaskState::Aborted);
    assert_eq!(node.error(), Some(TaskError::Aborted));
    let token = seen.lock().unwrap().clone().unwrap();
    assert!(token.is_cancelled());
    assert_eq!(log.events().last().map(|e| e.event.clone()), Some(EventKind::Aborted));

    // The node can run again after the abandoned stream.
    node.reset();
    assert_eq!(node.state(), TaskState::Created);
}

#[tokio::test]
async fn test_graph_run_reports_lifecycle_events() {
    let log = EventLog::new("graph");
    let engine = Arc::new(EngineContext::default().with_events(Arc::new(log.clone())));
    let mut graph = TaskGraph::with_context(engine);
    graph.add_task("a", constant(json!(1))).unwrap();
    graph.add_task("b", requiring(&["value"])).unwrap();
    graph.connect("a", "value", "b", "value").unwrap();

    let result = graph.run().await.unwrap();
    let events = log.events();

    let graph_events: Vec<&EventKind> = events
        .iter()
        .filter(|e| matches!(&e.scope, EventScope::Graph { run_id } if *run_id == result.run_id))
        .map(|e| &e.event)
        .collect();
    assert_eq!(graph_events, vec![&EventKind::Started, &EventKind::Completed]);

    let task_b: Vec<&EventKind> = events
        .iter()
        .filter(|e| matches!(&e.scope, EventScope::Task { task_id, .. } if task_id == "b"))
        .map(|e| &e.event)
        .collect();
    assert_eq!(task_b, vec![&EventKind::Started, &EventKind::Completed]);
}
