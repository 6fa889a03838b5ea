//! Named queues and the registry that resolves them.
//!
//! A [`JobQueue`] bundles the client, server and storage of one queue name.
//! The [`QueueRegistry`] maps names to queues so queued tasks can resolve
//! their backend at run time.

use crate::client::JobClient;
use crate::error::{QueueError, Result};
use crate::job::{Job, JobId, JobStatus, JobUpdate, JobUpdateKind};
use crate::limiter::{Limiter, NullLimiter};
use crate::server::{JobRunner, JobServer};
use crate::storage::{InMemoryJobStorage, JobStorage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use taskweave_core::config::QueueConfig;
use taskweave_core::events::{EventKind, EventScope, EventSink, LifecycleEvent, NullSink};
use taskweave_core::{CancellationToken, CancellationTokenSource, TaskError};
use tokio::sync::{broadcast, Notify};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by the client and server of one queue.
pub(crate) struct QueueShared {
    pub(crate) name: String,
    pub(crate) storage: Arc<dyn JobStorage>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) wake: Notify,
    /// Serializes claiming against abort-by-id
    pub(crate) claim_lock: tokio::sync::Mutex<()>,
    updates: broadcast::Sender<JobUpdate>,
    submitted: Mutex<HashMap<JobId, CancellationToken>>,
    running: Mutex<HashMap<JobId, CancellationTokenSource>>,
}

impl QueueShared {
    fn new(
        name: String,
        storage: Arc<dyn JobStorage>,
        events: Arc<dyn EventSink>,
        channel_capacity: usize,
    ) -> Self {
        let (updates, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            name,
            storage,
            events,
            wake: Notify::new(),
            claim_lock: tokio::sync::Mutex::new(()),
            updates,
            submitted: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.updates.subscribe()
    }

    pub(crate) fn publish(&self, job_id: &JobId, kind: JobUpdateKind) {
        // No receivers just means nobody is waiting.
        let _ = self.updates.send(JobUpdate {
            job_id: job_id.clone(),
            kind,
        });
    }

    pub(crate) fn emit(&self, job_id: &JobId, kind: EventKind) {
        self.events.emit(LifecycleEvent::now(
            EventScope::Job {
                job_id: job_id.to_string(),
                queue: self.name.clone(),
            },
            kind,
        ));
    }

    pub(crate) fn register_submission(&self, job_id: JobId, token: CancellationToken) {
        lock(&self.submitted).insert(job_id, token);
    }

    pub(crate) fn submission_token(&self, job_id: &JobId) -> Option<CancellationToken> {
        lock(&self.submitted).get(job_id).cloned()
    }

    pub(crate) fn mark_running(&self, job_id: JobId, source: CancellationTokenSource) {
        lock(&self.running).insert(job_id, source);
    }

    pub(crate) fn forget(&self, job_id: &JobId) {
        lock(&self.submitted).remove(job_id);
        lock(&self.running).remove(job_id);
    }

    /// Aborts a job by id.
    ///
    /// Running jobs are signalled; pending jobs settle as aborted right away.
    /// Returns false if the job had already settled.
    pub(crate) async fn abort(&self, job_id: &JobId) -> Result<bool> {
        let _claim = self.claim_lock.lock().await;

        let running = lock(&self.running).get(job_id).cloned();
        if let Some(source) = running {
            source.cancel();
            tracing::debug!(queue = %self.name, %job_id, "running job signalled to abort");
            return Ok(true);
        }

        let Some(mut job) = self.storage.get(job_id).await? else {
            return Err(QueueError::JobNotFound(job_id.clone()));
        };
        if job.status != JobStatus::Pending {
            return Ok(false);
        }

        job.settle(Err(TaskError::Aborted));
        self.storage.put(job).await?;
        self.forget(job_id);
        tracing::debug!(queue = %self.name, %job_id, "pending job aborted");
        self.emit(job_id, EventKind::Aborted);
        self.publish(job_id, JobUpdateKind::Settled(Err(TaskError::Aborted)));
        Ok(true)
    }

    /// Terminal outcome recorded in storage, if the job has settled.
    pub(crate) async fn stored_outcome(
        &self,
        job_id: &JobId,
    ) -> std::result::Result<Option<std::result::Result<serde_json::Value, TaskError>>, TaskError>
    {
        match self.storage.get(job_id).await? {
            Some(job) => Ok(job.outcome()),
            None => Err(QueueError::JobNotFound(job_id.clone()).into()),
        }
    }
}

/// Job counts of a queue by status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub aborted: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.aborted
    }
}

/// A named (server, client, storage) triple.
pub struct JobQueue {
    shared: Arc<QueueShared>,
    client: JobClient,
    server: JobServer,
    limiter: Arc<dyn Limiter>,
}

impl JobQueue {
    pub fn builder(name: impl Into<String>) -> JobQueueBuilder {
        JobQueueBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn client(&self) -> &JobClient {
        &self.client
    }

    pub fn server(&self) -> &JobServer {
        &self.server
    }

    pub fn storage(&self) -> &Arc<dyn JobStorage> {
        &self.shared.storage
    }

    pub fn limiter(&self) -> &Arc<dyn Limiter> {
        &self.limiter
    }

    /// Initializes storage and starts the server loop.
    pub async fn start(&self) -> Result<()> {
        self.shared.storage.setup().await?;
        self.server.start();
        tracing::info!(queue = %self.shared.name, "queue started");
        Ok(())
    }

    /// Stops claiming new jobs. Jobs already running finish on their own.
    pub async fn stop(&self) {
        self.server.stop().await;
        tracing::info!(queue = %self.shared.name, "queue stopped");
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let storage = &self.shared.storage;
        let name = self.shared.name.as_str();
        Ok(QueueStats {
            pending: storage.size(name, Some(JobStatus::Pending)).await?,
            processing: storage.size(name, Some(JobStatus::Processing)).await?,
            completed: storage.size(name, Some(JobStatus::Completed)).await?,
            failed: storage.size(name, Some(JobStatus::Failed)).await?,
            aborted: storage.size(name, Some(JobStatus::Aborted)).await?,
        })
    }

    /// All jobs of this queue in submission order.
    pub async fn jobs(&self) -> Result<Vec<Job>> {
        self.shared.storage.get_all(&self.shared.name).await
    }

    /// Drops stored jobs and limiter accounting for this queue.
    pub async fn clear(&self) -> Result<()> {
        self.shared.storage.clear(&self.shared.name).await?;
        self.limiter.clear(&self.shared.name).await
    }
}

/// Builder for [`JobQueue`].
pub struct JobQueueBuilder {
    name: String,
    storage: Option<Arc<dyn JobStorage>>,
    limiter: Option<Arc<dyn Limiter>>,
    runner: Option<Arc<dyn JobRunner>>,
    events: Option<Arc<dyn EventSink>>,
    config: QueueConfig,
}

impl JobQueueBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: None,
            limiter: None,
            runner: None,
            events: None,
            config: QueueConfig::default(),
        }
    }

    /// Job storage; defaults to [`InMemoryJobStorage`].
    pub fn storage(mut self, storage: Arc<dyn JobStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Admission control; defaults to [`NullLimiter`].
    pub fn limiter(mut self, limiter: Arc<dyn Limiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn runner(mut self, runner: Arc<dyn JobRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<JobQueue> {
        if self.name.is_empty() {
            return Err(QueueError::Misconfigured("queue name is empty".to_string()));
        }
        let runner = self.runner.ok_or_else(|| {
            QueueError::Misconfigured(format!("queue '{}' has no job runner", self.name))
        })?;
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryJobStorage::new()));
        let limiter = self.limiter.unwrap_or_else(|| Arc::new(NullLimiter));
        let events = self.events.unwrap_or_else(|| Arc::new(NullSink));

        let shared = Arc::new(QueueShared::new(
            self.name,
            storage,
            events,
            self.config.channel_capacity,
        ));
        let client = JobClient::new(shared.clone(), self.config.default_priority);
        let server = JobServer::new(
            shared.clone(),
            runner,
            limiter.clone(),
            self.config.poll_interval(),
        );
        Ok(JobQueue {
            shared,
            client,
            server,
            limiter,
        })
    }
}

/// Name-to-queue lookup shared by everything that submits jobs.
#[derive(Default)]
pub struct QueueRegistry {
    queues: RwLock<HashMap<String, Arc<JobQueue>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `queue` under its name.
    ///
    /// Registering the same queue again is a no-op. A different queue under an
    /// existing name replaces it and the previous one is returned.
    pub fn register(&self, queue: Arc<JobQueue>) -> Option<Arc<JobQueue>> {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let name = queue.name().to_string();
        match queues.get(&name) {
            Some(existing) if Arc::ptr_eq(existing, &queue) => None,
            Some(_) => {
                tracing::warn!(queue = %name, "replacing registered queue");
                queues.insert(name, queue)
            }
            None => {
                tracing::debug!(queue = %name, "queue registered");
                queues.insert(name, queue)
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<JobQueue>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<JobQueue>> {
        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.queues.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops every registered queue.
    pub async fn stop_all(&self) {
        let queues: Vec<Arc<JobQueue>> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for queue in queues {
            queue.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::FnJobRunner;
    use serde_json::{json, Value};

    fn echo_queue(name: &str) -> JobQueue {
        JobQueue::builder(name)
            .runner(Arc::new(FnJobRunner::new(|job: Job, _ctx| async move {
                Ok::<Value, TaskError>(job.input)
            })))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_runner() {
        let result = JobQueue::builder("q").build();
        assert!(matches!(result, Err(QueueError::Misconfigured(_))));
    }

    #[test]
    fn test_registry_register_is_idempotent() {
        let registry = QueueRegistry::new();
        let queue = Arc::new(echo_queue("embeddings"));

        assert!(registry.register(queue.clone()).is_none());
        assert!(registry.register(queue.clone()).is_none());
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get("embeddings").unwrap(), &queue));
    }

    #[test]
    fn test_registry_replaces_different_queue() {
        let registry = QueueRegistry::new();
        let first = Arc::new(echo_queue("q"));
        let second = Arc::new(echo_queue("q"));

        registry.register(first.clone());
        let previous = registry.register(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&previous, &first));
        assert!(Arc::ptr_eq(&registry.get("q").unwrap(), &second));
    }

    #[test]
    fn test_registry_unknown_queue() {
        let registry = QueueRegistry::new();
        assert!(matches!(registry.get("missing"), Err(QueueError::QueueNotFound(_))));
        let err: TaskError = registry.get("missing").err().unwrap().into();
        assert!(matches!(err, TaskError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_stats_count_by_status() {
        let queue = echo_queue("q");
        queue.start().await.unwrap();
        let handle = queue.client().submit(json!(1), Default::default()).await.unwrap();
        handle.wait().await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total(), 1);

        queue.clear().await.unwrap();
        assert_eq!(queue.stats().await.unwrap().total(), 0);
        queue.stop().await;
    }
}
