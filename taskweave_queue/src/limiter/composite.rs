//! Limiter combinators.

use super::{Admission, Limiter, Permit, Release};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Requires admission from every inner limiter.
///
/// If one denies, admissions already granted by the others are rolled back
/// and the latest retry time among the denials is reported.
#[derive(Clone, Default)]
pub struct CompositeLimiter {
    limiters: Vec<Arc<dyn Limiter>>,
}

impl CompositeLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, limiter: Arc<dyn Limiter>) -> Self {
        self.limiters.push(limiter);
        self
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

#[async_trait]
impl Limiter for CompositeLimiter {
    async fn try_acquire(&self, permit: &Permit) -> Result<Admission> {
        let mut granted: Vec<&Arc<dyn Limiter>> = Vec::with_capacity(self.limiters.len());
        for limiter in &self.limiters {
            match limiter.try_acquire(permit).await? {
                Admission::Granted => granted.push(limiter),
                Admission::Denied { retry_at } => {
                    for prior in granted {
                        prior.release(permit, Release::NeverStarted).await?;
                    }
                    let mut latest = retry_at;
                    for other in &self.limiters {
                        if let Some(next) = other.next_available(&permit.queue).await? {
                            latest = latest.max(next);
                        }
                    }
                    return Ok(Admission::Denied { retry_at: latest });
                }
            }
        }
        Ok(Admission::Granted)
    }

    async fn release(&self, permit: &Permit, release: Release) -> Result<()> {
        for limiter in &self.limiters {
            limiter.release(permit, release).await?;
        }
        Ok(())
    }

    async fn next_available(&self, queue: &str) -> Result<Option<DateTime<Utc>>> {
        let mut latest = None;
        for limiter in &self.limiters {
            if let Some(next) = limiter.next_available(queue).await? {
                latest = Some(latest.map_or(next, |l: DateTime<Utc>| l.max(next)));
            }
        }
        Ok(latest)
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        for limiter in &self.limiters {
            limiter.clear(queue).await?;
        }
        Ok(())
    }
}

/// Admits everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullLimiter;

#[async_trait]
impl Limiter for NullLimiter {
    async fn try_acquire(&self, _permit: &Permit) -> Result<Admission> {
        Ok(Admission::Granted)
    }

    async fn release(&self, _permit: &Permit, _release: Release) -> Result<()> {
        Ok(())
    }

    async fn next_available(&self, _queue: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }

    async fn clear(&self, _queue: &str) -> Result<()> {
        Ok(())
    }
}
