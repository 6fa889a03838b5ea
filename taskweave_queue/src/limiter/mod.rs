//! Admission control for job execution.
//!
//! The server asks its [`Limiter`] for admission before claiming a job and
//! releases the permit once the job settles. A permit released with
//! [`Release::NeverStarted`] is rolled back as if it had never been granted.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod composite;
pub mod concurrency;
pub mod rate;

pub use composite::{CompositeLimiter, NullLimiter};
pub use concurrency::ConcurrencyLimiter;
pub use rate::RateLimiter;

/// Admission ticket for one execution on a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Permit {
    pub queue: String,
    pub admitted_at: DateTime<Utc>,
}

impl Permit {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            admitted_at: Utc::now(),
        }
    }
}

/// Result of an admission attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Budget exhausted until `retry_at`
    Denied { retry_at: DateTime<Utc> },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// How a granted permit is given back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// The job ran; window accounting keeps the execution.
    Finished,
    /// The job never started; all accounting is rolled back.
    NeverStarted,
}

/// Gatekeeper deciding whether a queue may start another job.
#[async_trait]
pub trait Limiter: Send + Sync {
    async fn try_acquire(&self, permit: &Permit) -> Result<Admission>;

    async fn release(&self, permit: &Permit, release: Release) -> Result<()>;

    /// Earliest time a new job could be admitted, `None` if admissible now.
    async fn next_available(&self, queue: &str) -> Result<Option<DateTime<Utc>>>;

    /// Drops all accounting for `queue`.
    async fn clear(&self, queue: &str) -> Result<()>;
}
