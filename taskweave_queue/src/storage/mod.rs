//! Storage abstraction for jobs and rate-limiter state.
//!
//! Storage is pluggable. Every backend must hand out pending jobs of a queue
//! in priority order, FIFO within the same priority, and claim them
//! atomically so one job is never executed twice.

use crate::error::Result;
use crate::job::{Job, JobId, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod file;
pub mod memory;

pub use file::JsonFileJobStorage;
pub use memory::{InMemoryJobStorage, InMemoryRateLimiterStorage};

/// Job persistence.
#[async_trait]
pub trait JobStorage: Send + Sync {
    /// One-time initialization (load files, create tables, ...).
    async fn setup(&self) -> Result<()>;

    /// Inserts or replaces a job. New jobs receive the next sequence number.
    async fn put(&self, job: Job) -> Result<JobId>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>>;

    /// Removes a job, returning true if it existed.
    async fn delete(&self, id: &JobId) -> Result<bool>;

    /// All jobs of a queue in submission order.
    async fn get_all(&self, queue: &str) -> Result<Vec<Job>>;

    /// Number of jobs of a queue, optionally filtered by status.
    async fn size(&self, queue: &str, status: Option<JobStatus>) -> Result<usize>;

    /// Atomically picks the next pending job and marks it processing.
    async fn claim_next(&self, queue: &str) -> Result<Option<Job>>;

    /// Removes every job of a queue.
    async fn clear(&self, queue: &str) -> Result<()>;
}

/// Sliding-window execution log used by the rate limiter.
#[async_trait]
pub trait RateLimiterStorage: Send + Sync {
    async fn setup(&self) -> Result<()>;

    /// Appends an execution record.
    async fn record_execution(&self, queue: &str, at: DateTime<Utc>) -> Result<()>;

    /// Removes one execution record with exactly this timestamp.
    async fn remove_execution(&self, queue: &str, at: DateTime<Utc>) -> Result<()>;

    /// Execution timestamps at or after `since`, oldest first.
    async fn executions_since(&self, queue: &str, since: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>>;

    /// Drops records older than `before`.
    async fn prune_before(&self, queue: &str, before: DateTime<Utc>) -> Result<()>;

    async fn next_available(&self, queue: &str) -> Result<Option<DateTime<Utc>>>;

    async fn set_next_available(&self, queue: &str, at: Option<DateTime<Utc>>) -> Result<()>;

    /// Drops the log and the next-available marker for a queue.
    async fn clear(&self, queue: &str) -> Result<()>;
}

/// Picks the claimable job: highest priority, then lowest sequence.
pub(crate) fn next_pending<'a, I>(jobs: I, queue: &str) -> Option<&'a Job>
where
    I: Iterator<Item = &'a Job>,
{
    jobs.filter(|j| j.queue == queue && j.status == JobStatus::Pending)
        .min_by(|a, b| b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence)))
}
