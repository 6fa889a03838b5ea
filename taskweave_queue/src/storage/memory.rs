//! In-memory storage backends for dependency-free use and tests.

use super::{next_pending, JobStorage, RateLimiterStorage};
use crate::error::Result;
use crate::job::{Job, JobId, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct JobTable {
    jobs: HashMap<JobId, Job>,
    next_sequence: u64,
}

/// Job storage held in a process-local map.
#[derive(Default)]
pub struct InMemoryJobStorage {
    table: RwLock<JobTable>,
}

impl InMemoryJobStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStorage for InMemoryJobStorage {
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, mut job: Job) -> Result<JobId> {
        let mut table = self.table.write().await;
        match table.jobs.get(&job.id) {
            Some(existing) => job.sequence = existing.sequence,
            None => {
                table.next_sequence += 1;
                job.sequence = table.next_sequence;
            }
        }
        let id = job.id.clone();
        table.jobs.insert(id.clone(), job);
        Ok(id)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.table.read().await.jobs.get(id).cloned())
    }

    async fn delete(&self, id: &JobId) -> Result<bool> {
        Ok(self.table.write().await.jobs.remove(id).is_some())
    }

    async fn get_all(&self, queue: &str) -> Result<Vec<Job>> {
        let table = self.table.read().await;
        let mut jobs: Vec<Job> = table
            .jobs
            .values()
            .filter(|j| j.queue == queue)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.sequence);
        Ok(jobs)
    }

    async fn size(&self, queue: &str, status: Option<JobStatus>) -> Result<usize> {
        let table = self.table.read().await;
        Ok(table
            .jobs
            .values()
            .filter(|j| j.queue == queue && status.map_or(true, |s| j.status == s))
            .count())
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>> {
        let mut table = self.table.write().await;
        let Some(id) = next_pending(table.jobs.values(), queue).map(|j| j.id.clone()) else {
            return Ok(None);
        };
        let job = table.jobs.get_mut(&id).map(|job| {
            job.mark_processing();
            job.clone()
        });
        Ok(job)
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        self.table.write().await.jobs.retain(|_, j| j.queue != queue);
        Ok(())
    }
}

#[derive(Default)]
struct RateLog {
    executions: Vec<DateTime<Utc>>,
    next_available: Option<DateTime<Utc>>,
}

/// Rate-limiter execution log held in memory.
#[derive(Default)]
pub struct InMemoryRateLimiterStorage {
    logs: RwLock<HashMap<String, RateLog>>,
}

impl InMemoryRateLimiterStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimiterStorage for InMemoryRateLimiterStorage {
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn record_execution(&self, queue: &str, at: DateTime<Utc>) -> Result<()> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(queue.to_string()).or_default();
        // Keep sorted; records almost always arrive in order.
        let pos = log.executions.partition_point(|t| *t <= at);
        log.executions.insert(pos, at);
        Ok(())
    }

    async fn remove_execution(&self, queue: &str, at: DateTime<Utc>) -> Result<()> {
        let mut logs = self.logs.write().await;
        if let Some(log) = logs.get_mut(queue) {
            if let Some(pos) = log.executions.iter().rposition(|t| *t == at) {
                log.executions.remove(pos);
            }
        }
        Ok(())
    }

    async fn executions_since(&self, queue: &str, since: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>> {
        let logs = self.logs.read().await;
        Ok(logs
            .get(queue)
            .map(|log| log.executions.iter().copied().filter(|t| *t >= since).collect())
            .unwrap_or_default())
    }

    async fn prune_before(&self, queue: &str, before: DateTime<Utc>) -> Result<()> {
        let mut logs = self.logs.write().await;
        if let Some(log) = logs.get_mut(queue) {
            log.executions.retain(|t| *t >= before);
        }
        Ok(())
    }

    async fn next_available(&self, queue: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.logs.read().await.get(queue).and_then(|l| l.next_available))
    }

    async fn set_next_available(&self, queue: &str, at: Option<DateTime<Utc>>) -> Result<()> {
        self.logs
            .write()
            .await
            .entry(queue.to_string())
            .or_default()
            .next_available = at;
        Ok(())
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        self.logs.write().await.remove(queue);
        Ok(())
    }
}
