//! Integration tests for queue admission, cancellation and streaming.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskweave_core::events::{EventKind, EventLog, EventScope};
use taskweave_core::{CancellationTokenSource, QueueConfig, TaskError};
use taskweave_queue::{
    CompositeLimiter, ConcurrencyLimiter, FnJobRunner, InMemoryRateLimiterStorage, Job,
    JobContext, JobEvent, JobEventStream, JobQueue, JobRunner, JobStatus, JsonFileJobStorage,
    Limiter, RateLimiter, SubmitOptions,
};
use tokio::sync::Notify;

fn fast_config() -> QueueConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
    QueueConfig {
        poll_interval_ms: 5,
        ..QueueConfig::default()
    }
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn recording_runner(starts: Arc<Mutex<Vec<(Value, DateTime<Utc>)>>>) -> Arc<dyn JobRunner> {
    Arc::new(FnJobRunner::new(move |job: Job, _ctx| {
        let starts = starts.clone();
        async move {
            starts.lock().unwrap().push((job.input.clone(), Utc::now()));
            Ok::<Value, TaskError>(job.input)
        }
    }))
}

#[tokio::test]
async fn test_rate_limit_delays_fourth_job() {
    let window = Duration::from_millis(300);
    let starts = Arc::new(Mutex::new(Vec::new()));
    let queue = JobQueue::builder("rated")
        .limiter(Arc::new(RateLimiter::new(
            Arc::new(InMemoryRateLimiterStorage::new()),
            3,
            window,
        )))
        .runner(recording_runner(starts.clone()))
        .config(fast_config())
        .build()
        .unwrap();
    queue.start().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..4 {
        handles.push(queue.client().submit(json!(i), SubmitOptions::new()).await.unwrap());
    }
    for handle in handles {
        handle.wait().await.unwrap();
    }

    let starts = starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 4);
    let first = starts[0].1;
    let fourth = starts[3].1;
    let elapsed = fourth - first;
    // Allow for scheduling latency between admission and the recorded start.
    assert!(elapsed >= TimeDelta::milliseconds(250), "fourth started after {elapsed}");
    assert!(starts[2].1 - first < TimeDelta::milliseconds(250));
    queue.stop().await;
}

#[tokio::test]
async fn test_priority_then_fifo_order() {
    let starts = Arc::new(Mutex::new(Vec::new()));
    let queue = JobQueue::builder("ordered")
        .limiter(Arc::new(ConcurrencyLimiter::new(1, Duration::from_millis(5))))
        .runner(recording_runner(starts.clone()))
        .config(fast_config())
        .build()
        .unwrap();

    let client = queue.client();
    let mut handles = Vec::new();
    handles.push(client.submit(json!("a"), SubmitOptions::new()).await.unwrap());
    handles.push(client.submit(json!("b"), SubmitOptions::new()).await.unwrap());
    handles.push(client.submit(json!("urgent"), SubmitOptions::new().priority(10)).await.unwrap());
    handles.push(client.submit(json!("c"), SubmitOptions::new()).await.unwrap());

    queue.start().await.unwrap();
    for handle in handles {
        handle.wait().await.unwrap();
    }

    let order: Vec<Value> = starts.lock().unwrap().iter().map(|(v, _)| v.clone()).collect();
    assert_eq!(order, vec![json!("urgent"), json!("a"), json!("b"), json!("c")]);
    queue.stop().await;
}

#[tokio::test]
async fn test_cancel_running_non_cooperative_job() {
    let concurrency = Arc::new(ConcurrencyLimiter::new(1, Duration::from_millis(5)));
    let queue = JobQueue::builder("stuck")
        .limiter(concurrency.clone())
        .runner(Arc::new(FnJobRunner::new(|_job: Job, _ctx| async move {
            // Ignores its token entirely.
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<Value, TaskError>(json!("too late"))
        })))
        .config(fast_config())
        .build()
        .unwrap();
    queue.start().await.unwrap();

    let source = CancellationTokenSource::new();
    let handle = queue
        .client()
        .submit(json!(null), SubmitOptions::new().cancellation(source.token()))
        .await
        .unwrap();
    let id = handle.id().clone();

    let client = queue.client().clone();
    wait_until(|| {
        let client = client.clone();
        let id = id.clone();
        async move { client.status(&id).await.unwrap() == JobStatus::Processing }
    })
    .await;

    source.cancel_after(Duration::from_millis(10));
    let result = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .expect("wait should return promptly");
    assert_eq!(result, Err(TaskError::Aborted));

    wait_until(|| {
        let client = client.clone();
        let id = id.clone();
        async move { client.status(&id).await.unwrap() == JobStatus::Aborted }
    })
    .await;
    assert_eq!(concurrency.running("stuck").await, 0);
    queue.stop().await;
}

#[tokio::test]
async fn test_abort_before_start_returns_rate_budget() {
    let gate = Arc::new(Notify::new());
    let rate = Arc::new(RateLimiter::new(
        Arc::new(InMemoryRateLimiterStorage::new()),
        2,
        Duration::from_secs(60),
    ));
    let limiter = CompositeLimiter::new()
        .with(Arc::new(ConcurrencyLimiter::new(1, Duration::from_millis(5))))
        .with(rate.clone());

    let runner_gate = gate.clone();
    let queue = JobQueue::builder("gated")
        .limiter(Arc::new(limiter))
        .runner(Arc::new(FnJobRunner::new(move |job: Job, _ctx| {
            let gate = runner_gate.clone();
            async move {
                if job.input == json!("block") {
                    gate.notified().await;
                }
                Ok::<Value, TaskError>(job.input)
            }
        })))
        .config(fast_config())
        .build()
        .unwrap();
    queue.start().await.unwrap();
    let client = queue.client().clone();

    let blocker = client.submit(json!("block"), SubmitOptions::new()).await.unwrap();
    let blocker_id = blocker.id().clone();
    wait_until(|| {
        let client = client.clone();
        let id = blocker_id.clone();
        async move { client.status(&id).await.unwrap() == JobStatus::Processing }
    })
    .await;

    // Cancelled while waiting for admission; nobody waits on the handle.
    let source = CancellationTokenSource::new();
    let cancelled = client
        .submit(json!("never"), SubmitOptions::new().cancellation(source.token()))
        .await
        .unwrap();
    let cancelled_id = cancelled.id().clone();
    drop(cancelled);
    source.cancel();

    gate.notify_one();
    assert_eq!(blocker.wait().await.unwrap(), json!("block"));

    wait_until(|| {
        let client = client.clone();
        let id = cancelled_id.clone();
        async move { client.status(&id).await.unwrap() == JobStatus::Aborted }
    })
    .await;

    // Only the blocker counts against the window, so one more job fits.
    let next = client.submit(json!("next"), SubmitOptions::new()).await.unwrap();
    let output = tokio::time::timeout(Duration::from_secs(2), next.wait())
        .await
        .expect("budget should be available");
    assert_eq!(output.unwrap(), json!("next"));
    assert!(rate.next_available("gated").await.unwrap().is_some());
    queue.stop().await;
}

struct CountingStreamRunner;

#[async_trait]
impl JobRunner for CountingStreamRunner {
    async fn run(&self, job: &Job, _ctx: JobContext) -> Result<Value, TaskError> {
        Ok(job.input.clone())
    }

    fn run_stream(&self, job: &Job, _ctx: JobContext) -> Option<JobEventStream> {
        let n = job.input.as_u64().unwrap_or(0);
        let mut events: Vec<Result<JobEvent, TaskError>> =
            (0..n).map(|i| Ok(JobEvent::Chunk(json!(i)))).collect();
        events.push(Ok(JobEvent::Finished(json!({"count": n}))));
        Some(Box::pin(stream::iter(events)))
    }
}

#[tokio::test]
async fn test_streaming_job_yields_chunks_then_final() {
    let queue = JobQueue::builder("stream")
        .runner(Arc::new(CountingStreamRunner))
        .config(fast_config())
        .build()
        .unwrap();
    queue.start().await.unwrap();

    let handle = queue.client().submit(json!(3), SubmitOptions::new()).await.unwrap();
    let events: Vec<JobEvent> = handle
        .stream()
        .map(|event| event.unwrap())
        .collect()
        .await;

    assert_eq!(
        events,
        vec![
            JobEvent::Chunk(json!(0)),
            JobEvent::Chunk(json!(1)),
            JobEvent::Chunk(json!(2)),
            JobEvent::Finished(json!({"count": 3})),
        ]
    );
    queue.stop().await;
}

#[tokio::test]
async fn test_non_streaming_runner_yields_single_final_event() {
    let queue = JobQueue::builder("plain")
        .runner(Arc::new(FnJobRunner::new(|job: Job, _ctx| async move {
            Ok::<Value, TaskError>(json!({"echo": job.input}))
        })))
        .config(fast_config())
        .build()
        .unwrap();
    queue.start().await.unwrap();

    let handle = queue.client().submit(json!(7), SubmitOptions::new()).await.unwrap();
    let events: Vec<Result<JobEvent, TaskError>> = handle.stream().collect().await;
    assert_eq!(events, vec![Ok(JobEvent::Finished(json!({"echo": 7})))]);
    queue.stop().await;
}

#[tokio::test]
async fn test_progress_is_streamed_and_persisted_on_failure() {
    let queue = JobQueue::builder("progress")
        .runner(Arc::new(FnJobRunner::new(|_job: Job, ctx: JobContext| async move {
            ctx.progress.report(40.0, Some("downloading"));
            Err::<Value, TaskError>(TaskError::transient("connection reset"))
        })))
        .config(fast_config())
        .build()
        .unwrap();
    queue.start().await.unwrap();

    let handle = queue.client().submit(json!(null), SubmitOptions::new()).await.unwrap();
    let id = handle.id().clone();
    let events: Vec<Result<JobEvent, TaskError>> = handle.stream().collect().await;
    assert_eq!(
        events[0],
        Ok(JobEvent::Progress {
            progress: 40.0,
            message: Some("downloading".into())
        })
    );
    let err = events[1].clone().unwrap_err();
    assert!(err.is_retryable());

    let job = queue.client().get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.progress, 40.0);
    assert_eq!(job.progress_message.as_deref(), Some("downloading"));
    queue.stop().await;
}

#[tokio::test]
async fn test_pending_jobs_survive_restart() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("jobs.json");

    let echo = || -> Arc<dyn JobRunner> {
        Arc::new(FnJobRunner::new(|job: Job, _ctx| async move {
            Ok::<Value, TaskError>(job.input)
        }))
    };

    let id = {
        let storage = Arc::new(JsonFileJobStorage::new(&path));
        let queue = JobQueue::builder("durable")
            .storage(storage.clone())
            .runner(echo())
            .build()
            .unwrap();
        // Set up storage without starting the server.
        storage_setup(&queue).await;
        let handle = queue.client().submit(json!("kept"), SubmitOptions::new()).await.unwrap();
        handle.id().clone()
    };

    let queue = JobQueue::builder("durable")
        .storage(Arc::new(JsonFileJobStorage::new(&path)))
        .runner(echo())
        .config(fast_config())
        .build()
        .unwrap();
    queue.start().await.unwrap();

    let client = queue.client().clone();
    wait_until(|| {
        let client = client.clone();
        let id = id.clone();
        async move { client.status(&id).await.unwrap() == JobStatus::Completed }
    })
    .await;
    let job = client.get(&id).await.unwrap().unwrap();
    assert_eq!(job.output, Some(json!("kept")));
    queue.stop().await;
}

async fn storage_setup(queue: &JobQueue) {
    queue.storage().setup().await.unwrap();
}

#[tokio::test]
async fn test_lifecycle_events_are_emitted() {
    let log = EventLog::new("jobs");
    let queue = JobQueue::builder("observed")
        .runner(Arc::new(FnJobRunner::new(|job: Job, _ctx| async move {
            Ok::<Value, TaskError>(job.input)
        })))
        .events(Arc::new(log.clone()))
        .config(fast_config())
        .build()
        .unwrap();
    queue.start().await.unwrap();

    let handle = queue.client().submit(json!(1), SubmitOptions::new()).await.unwrap();
    let id = handle.id().to_string();
    handle.wait().await.unwrap();

    let kinds: Vec<EventKind> = log
        .events()
        .into_iter()
        .filter(|e| {
            matches!(&e.scope, EventScope::Job { job_id, queue } if *job_id == id && queue == "observed")
        })
        .map(|e| e.event)
        .collect();
    assert_eq!(kinds, vec![EventKind::Started, EventKind::Completed]);
    queue.stop().await;
}
