//! Job server: claims admissible jobs and runs them.
//!
//! The server loop waits for pending work, asks the limiter for a permit,
//! claims the next job from storage and spawns its execution. Every claimed
//! job is settled exactly once with a success, a categorized failure or an
//! abort, and the outcome is written back to storage before clients are
//! notified.

use crate::error::Result;
use crate::job::{Job, JobEvent, JobEventStream, JobId, JobStatus, JobUpdateKind};
use crate::limiter::{Admission, Limiter, Permit, Release};
use crate::queue::{lock, QueueShared};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskweave_core::events::EventKind;
use taskweave_core::{
    race, race_detached, CancellationToken, CancellationTokenSource, ProgressReporter, TaskError,
};
use tokio::task::JoinHandle;

/// Per-execution context handed to a [`JobRunner`].
#[derive(Clone, Debug)]
pub struct JobContext {
    pub job_id: JobId,
    pub queue: String,
    pub progress: ProgressReporter,
    pub cancellation: CancellationToken,
}

/// The work a queue performs for each job.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Runs the job to completion.
    async fn run(&self, job: &Job, ctx: JobContext) -> std::result::Result<Value, TaskError>;

    /// Incremental variant. Returning `None` makes the server fall back to
    /// [`run`](Self::run).
    fn run_stream(&self, _job: &Job, _ctx: JobContext) -> Option<JobEventStream> {
        None
    }
}

/// [`JobRunner`] backed by an async closure.
pub struct FnJobRunner<F> {
    func: F,
}

impl<F> FnJobRunner<F> {
    pub fn new<Fut>(func: F) -> Self
    where
        F: Fn(Job, JobContext) -> Fut,
        Fut: Future<Output = std::result::Result<Value, TaskError>>,
    {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> JobRunner for FnJobRunner<F>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, TaskError>> + Send + 'static,
{
    async fn run(&self, job: &Job, ctx: JobContext) -> std::result::Result<Value, TaskError> {
        (self.func)(job.clone(), ctx).await
    }
}

struct ServerState {
    stop: CancellationTokenSource,
    handle: JoinHandle<()>,
}

/// Consumes a queue's storage.
pub struct JobServer {
    worker: Worker,
    state: Mutex<Option<ServerState>>,
}

impl JobServer {
    pub(crate) fn new(
        shared: Arc<QueueShared>,
        runner: Arc<dyn JobRunner>,
        limiter: Arc<dyn Limiter>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            worker: Worker {
                shared,
                runner,
                limiter,
                poll_interval,
            },
            state: Mutex::new(None),
        }
    }

    /// Spawns the server loop. Calling it while running is a no-op.
    pub fn start(&self) {
        let mut state = lock(&self.state);
        if state.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            return;
        }
        let stop = CancellationTokenSource::new();
        let worker = self.worker.clone();
        let token = stop.token();
        let handle = tokio::spawn(async move { worker.run_loop(token).await });
        *state = Some(ServerState { stop, handle });
    }

    /// Stops the loop and waits for it to exit.
    pub async fn stop(&self) {
        let state = lock(&self.state).take();
        if let Some(state) = state {
            state.stop.cancel();
            if let Err(e) = state.handle.await {
                tracing::warn!(queue = %self.worker.shared.name, error = %e, "server loop ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state)
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }
}

#[derive(Clone)]
struct Worker {
    shared: Arc<QueueShared>,
    runner: Arc<dyn JobRunner>,
    limiter: Arc<dyn Limiter>,
    poll_interval: Duration,
}

impl Worker {
    async fn run_loop(self, stop: CancellationToken) {
        let name = self.shared.name.clone();
        tracing::debug!(queue = %name, "server loop started");

        while !stop.is_cancelled() {
            match self.shared.storage.size(&name, Some(JobStatus::Pending)).await {
                Ok(0) => {
                    self.idle(&stop, self.poll_interval).await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(queue = %name, error = %e, "failed to inspect storage");
                    self.idle(&stop, self.poll_interval).await;
                    continue;
                }
            }

            let permit = Permit::new(name.as_str());
            match self.limiter.try_acquire(&permit).await {
                Ok(Admission::Granted) => {}
                Ok(Admission::Denied { retry_at }) => {
                    let wait = (retry_at - Utc::now())
                        .to_std()
                        .unwrap_or_default()
                        .max(Duration::from_millis(1));
                    tracing::debug!(queue = %name, %retry_at, "admission denied");
                    self.idle(&stop, wait).await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(queue = %name, error = %e, "limiter failed");
                    self.idle(&stop, self.poll_interval).await;
                    continue;
                }
            }

            match self.claim().await {
                Ok(Some((job, source))) => {
                    tracing::debug!(queue = %name, job_id = %job.id, priority = job.priority, "job admitted");
                    let worker = self.clone();
                    tokio::spawn(async move { worker.execute(job, permit, source).await });
                }
                Ok(None) => self.release(&permit, Release::NeverStarted).await,
                Err(e) => {
                    self.release(&permit, Release::NeverStarted).await;
                    tracing::warn!(queue = %name, error = %e, "failed to claim job");
                    self.idle(&stop, self.poll_interval).await;
                }
            }
        }

        tracing::debug!(queue = %name, "server loop stopped");
    }

    async fn idle(&self, stop: &CancellationToken, wait: Duration) {
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = self.shared.wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    async fn claim(&self) -> Result<Option<(Job, CancellationTokenSource)>> {
        let _claim = self.shared.claim_lock.lock().await;
        let Some(job) = self.shared.storage.claim_next(&self.shared.name).await? else {
            return Ok(None);
        };
        let source = match self.shared.submission_token(&job.id) {
            Some(token) => token.child_source(),
            None => CancellationTokenSource::new(),
        };
        self.shared.mark_running(job.id.clone(), source.clone());
        Ok(Some((job, source)))
    }

    async fn release(&self, permit: &Permit, release: Release) {
        if let Err(e) = self.limiter.release(permit, release).await {
            tracing::warn!(queue = %permit.queue, error = %e, "failed to release permit");
        }
    }

    async fn execute(self, job: Job, permit: Permit, source: CancellationTokenSource) {
        let token = source.token();
        let latest = Arc::new(Mutex::new(None::<(f32, Option<String>)>));

        let outcome = if token.is_cancelled() {
            self.release(&permit, Release::NeverStarted).await;
            tracing::debug!(queue = %self.shared.name, job_id = %job.id, "job aborted before start");
            Err(TaskError::Aborted)
        } else {
            self.shared.publish(&job.id, JobUpdateKind::Started);
            self.shared.emit(&job.id, EventKind::Started);

            let ctx = JobContext {
                job_id: job.id.clone(),
                queue: self.shared.name.clone(),
                progress: self.progress_reporter(&job.id, latest.clone()),
                cancellation: token.clone(),
            };
            let result = self.invoke(&job, ctx).await;
            self.release(&permit, Release::Finished).await;

            // Abort wins over whatever the run-function settled with.
            if token.is_cancelled() {
                Err(TaskError::Aborted)
            } else {
                result
            }
        };

        let progress = lock(&latest).take();
        self.settle(job, outcome, progress).await;
    }

    fn progress_reporter(
        &self,
        job_id: &JobId,
        latest: Arc<Mutex<Option<(f32, Option<String>)>>>,
    ) -> ProgressReporter {
        let shared = self.shared.clone();
        let job_id = job_id.clone();
        ProgressReporter::new(move |progress, message| {
            let message = message.map(str::to_string);
            *lock(&latest) = Some((progress, message.clone()));
            shared.emit(
                &job_id,
                EventKind::Progress {
                    progress,
                    message: message.clone(),
                },
            );
            shared.publish(&job_id, JobUpdateKind::Progress { progress, message });
        })
    }

    async fn invoke(&self, job: &Job, ctx: JobContext) -> std::result::Result<Value, TaskError> {
        let token = ctx.cancellation.clone();
        match self.runner.run_stream(job, ctx.clone()) {
            Some(stream) => self.drain(&job.id, stream, &ctx).await,
            None => {
                let runner = self.runner.clone();
                let job = job.clone();
                race_detached(&token, async move { runner.run(&job, ctx).await })
                    .await
                    .and_then(|result| result)
            }
        }
    }

    async fn drain(
        &self,
        job_id: &JobId,
        mut stream: JobEventStream,
        ctx: &JobContext,
    ) -> std::result::Result<Value, TaskError> {
        loop {
            match race(&ctx.cancellation, stream.next()).await? {
                None => {
                    return Err(TaskError::permanent(
                        "job stream ended without a final value",
                    ))
                }
                Some(Err(e)) => return Err(e),
                Some(Ok(JobEvent::Finished(output))) => return Ok(output),
                Some(Ok(JobEvent::Chunk(chunk))) => {
                    self.shared.publish(job_id, JobUpdateKind::Chunk(chunk))
                }
                Some(Ok(JobEvent::Progress { progress, message })) => {
                    ctx.progress.report(progress, message.as_deref())
                }
            }
        }
    }

    async fn settle(
        &self,
        mut job: Job,
        outcome: std::result::Result<Value, TaskError>,
        progress: Option<(f32, Option<String>)>,
    ) {
        if let Some((value, message)) = progress {
            job.progress = value;
            job.progress_message = message;
        }
        job.settle(outcome.clone());

        let job_id = job.id.clone();
        let status = job.status;
        if let Err(e) = self.shared.storage.put(job).await {
            tracing::error!(queue = %self.shared.name, %job_id, error = %e, "failed to persist job outcome");
        }
        self.shared.forget(&job_id);

        match &outcome {
            Ok(_) => self.shared.emit(&job_id, EventKind::Completed),
            Err(TaskError::Aborted) => self.shared.emit(&job_id, EventKind::Aborted),
            Err(error) => {
                tracing::warn!(queue = %self.shared.name, %job_id, %error, "job failed");
                self.shared.emit(&job_id, EventKind::Failed { error: error.clone() })
            }
        }
        tracing::debug!(queue = %self.shared.name, %job_id, ?status, "job settled");
        self.shared.publish(&job_id, JobUpdateKind::Settled(outcome));
        self.shared.wake.notify_one();
    }
}
