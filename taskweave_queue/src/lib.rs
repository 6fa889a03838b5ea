//! Taskweave queue - named job queues with admission control.
//!
//! A queue is a (server, client, storage) triple. Clients submit [`Job`]s
//! that storage hands out in priority order, FIFO within a priority. The
//! server admits each job through a [`Limiter`] (concurrency bound, sliding
//! window rate bound, or both) before running it.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use serde_json::{json, Value};
//! use taskweave_core::TaskError;
//! use taskweave_queue::{
//!     FnJobRunner, InMemoryRateLimiterStorage, Job, JobQueue, RateLimiter, SubmitOptions,
//! };
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let queue = JobQueue::builder("embeddings")
//!     .limiter(Arc::new(RateLimiter::new(
//!         Arc::new(InMemoryRateLimiterStorage::new()),
//!         3,
//!         Duration::from_secs(1),
//!     )))
//!     .runner(Arc::new(FnJobRunner::new(|job: Job, _ctx| async move {
//!         Ok::<Value, TaskError>(job.input)
//!     })))
//!     .build()?;
//! queue.start().await?;
//!
//! let handle = queue.client().submit(json!({"text": "hi"}), SubmitOptions::new()).await?;
//! let _output = handle.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod job;
pub mod limiter;
pub mod queue;
pub mod server;
pub mod storage;

pub use client::{JobClient, JobHandle, SubmitOptions};
pub use error::{QueueError, Result};
pub use job::{Job, JobEvent, JobEventStream, JobId, JobStatus, JobUpdate, JobUpdateKind};
pub use limiter::{
    Admission, CompositeLimiter, ConcurrencyLimiter, Limiter, NullLimiter, Permit, RateLimiter,
    Release,
};
pub use queue::{JobQueue, JobQueueBuilder, QueueRegistry, QueueStats};
pub use server::{FnJobRunner, JobContext, JobRunner, JobServer};
pub use storage::{
    InMemoryJobStorage, InMemoryRateLimiterStorage, JobStorage, JsonFileJobStorage,
    RateLimiterStorage,
};
