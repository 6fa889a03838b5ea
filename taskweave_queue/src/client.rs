//! Job client: submits jobs and observes their outcome.

use crate::error::{QueueError, Result};
use crate::job::{Job, JobEvent, JobEventStream, JobId, JobStatus, JobUpdate, JobUpdateKind};
use crate::queue::QueueShared;
use futures_util::stream;
use serde_json::Value;
use std::sync::Arc;
use taskweave_core::{CancellationToken, TaskError};
use tokio::sync::broadcast::{self, error::RecvError};

/// Per-submission options.
#[derive(Clone, Debug, Default)]
pub struct SubmitOptions {
    pub run_id: Option<String>,
    /// Overrides the queue's default priority
    pub priority: Option<i32>,
    /// Aborts the job and stops waiting when cancelled
    pub cancellation: Option<CancellationToken>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Submitting side of a queue.
#[derive(Clone)]
pub struct JobClient {
    shared: Arc<QueueShared>,
    default_priority: i32,
}

impl JobClient {
    pub(crate) fn new(shared: Arc<QueueShared>, default_priority: i32) -> Self {
        Self {
            shared,
            default_priority,
        }
    }

    pub fn queue(&self) -> &str {
        &self.shared.name
    }

    /// Persists a new job and returns a handle to its outcome.
    pub async fn submit(&self, input: Value, options: SubmitOptions) -> Result<JobHandle> {
        let mut job = Job::new(self.shared.name.as_str(), input)
            .with_priority(options.priority.unwrap_or(self.default_priority));
        if let Some(run_id) = options.run_id {
            job = job.with_run_id(run_id);
        }
        let cancellation = options.cancellation.unwrap_or_default();
        let id = job.id.clone();

        // Subscribe before the job becomes visible so no update is missed.
        let receiver = self.shared.subscribe();
        self.shared.register_submission(id.clone(), cancellation.clone());
        if let Err(e) = self.shared.storage.put(job).await {
            self.shared.forget(&id);
            return Err(e);
        }
        self.shared.wake.notify_one();
        tracing::debug!(queue = %self.shared.name, job_id = %id, "job submitted");

        Ok(JobHandle {
            id,
            shared: self.shared.clone(),
            receiver,
            cancellation,
        })
    }

    /// Aborts a job. Returns false if it had already settled.
    pub async fn abort(&self, id: &JobId) -> Result<bool> {
        self.shared.abort(id).await
    }

    pub async fn status(&self, id: &JobId) -> Result<JobStatus> {
        self.shared
            .storage
            .get(id)
            .await?
            .map(|job| job.status)
            .ok_or_else(|| QueueError::JobNotFound(id.clone()))
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        self.shared.storage.get(id).await
    }
}

/// Handle to a submitted job.
pub struct JobHandle {
    id: JobId,
    shared: Arc<QueueShared>,
    receiver: broadcast::Receiver<JobUpdate>,
    cancellation: CancellationToken,
}

impl JobHandle {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Waits for the job to settle.
    ///
    /// If the submission token is cancelled first, the job is aborted and
    /// `TaskError::Aborted` is returned without waiting further.
    pub async fn wait(self) -> std::result::Result<Value, TaskError> {
        let mut watch = Watch::from(self);
        loop {
            match watch.next_update().await? {
                Observed::Settled(outcome) => return outcome,
                Observed::Progress { .. } | Observed::Chunk(_) => {}
            }
        }
    }

    /// Consumes the job as an ordered event stream.
    ///
    /// The stream yields progress and chunk events, then ends with a single
    /// [`JobEvent::Finished`] or an error. Jobs run without streaming support
    /// yield only the final event.
    pub fn stream(self) -> JobEventStream {
        let state = Some(Watch::from(self));
        Box::pin(stream::unfold(state, |state| async move {
            let mut watch = state?;
            let item = match watch.next_update().await {
                Ok(Observed::Progress { progress, message }) => {
                    Ok(JobEvent::Progress { progress, message })
                }
                Ok(Observed::Chunk(chunk)) => Ok(JobEvent::Chunk(chunk)),
                Ok(Observed::Settled(outcome)) => outcome.map(JobEvent::Finished),
                Err(e) => Err(e),
            };
            let done = item.as_ref().map_or(true, JobEvent::is_terminal);
            Some((item, (!done).then_some(watch)))
        }))
    }
}

enum Observed {
    Progress { progress: f32, message: Option<String> },
    Chunk(Value),
    Settled(std::result::Result<Value, TaskError>),
}

struct Watch {
    id: JobId,
    shared: Arc<QueueShared>,
    receiver: broadcast::Receiver<JobUpdate>,
    cancellation: CancellationToken,
    checked_storage: bool,
}

impl From<JobHandle> for Watch {
    fn from(handle: JobHandle) -> Self {
        Self {
            id: handle.id,
            shared: handle.shared,
            receiver: handle.receiver,
            cancellation: handle.cancellation,
            checked_storage: false,
        }
    }
}

impl Watch {
    async fn next_update(&mut self) -> std::result::Result<Observed, TaskError> {
        if !self.checked_storage {
            self.checked_storage = true;
            if let Some(outcome) = self.shared.stored_outcome(&self.id).await? {
                return Ok(Observed::Settled(outcome));
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => {
                    if let Err(e) = self.shared.abort(&self.id).await {
                        tracing::debug!(job_id = %self.id, error = %e, "abort after cancellation failed");
                    }
                    return Err(TaskError::Aborted);
                }
                update = self.receiver.recv() => match update {
                    Ok(JobUpdate { job_id, kind }) if job_id == self.id => match kind {
                        JobUpdateKind::Started => {}
                        JobUpdateKind::Progress { progress, message } => {
                            return Ok(Observed::Progress { progress, message })
                        }
                        JobUpdateKind::Chunk(chunk) => return Ok(Observed::Chunk(chunk)),
                        JobUpdateKind::Settled(outcome) => return Ok(Observed::Settled(outcome)),
                    },
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(job_id = %self.id, skipped, "job watcher lagged");
                        if let Some(outcome) = self.shared.stored_outcome(&self.id).await? {
                            return Ok(Observed::Settled(outcome));
                        }
                    }
                    Err(RecvError::Closed) => {
                        return Err(QueueError::Closed(self.shared.name.clone()).into())
                    }
                },
            }
        }
    }
}
