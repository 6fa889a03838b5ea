//! Bounds simultaneous executions per queue.

use super::{Admission, Limiter, Permit, Release};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// Admits at most `max_concurrent` running jobs per queue.
///
/// When saturated, the reported retry time is `now + retry_interval`: running
/// jobs have no known end, so the server simply re-checks after that delay.
pub struct ConcurrencyLimiter {
    max_concurrent: usize,
    retry_interval: TimeDelta,
    running: Mutex<HashMap<String, usize>>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize, retry_interval: Duration) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            retry_interval: TimeDelta::from_std(retry_interval).unwrap_or(TimeDelta::MAX),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Jobs currently holding a permit on `queue`.
    pub async fn running(&self, queue: &str) -> usize {
        self.running.lock().await.get(queue).copied().unwrap_or(0)
    }

    fn retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.retry_interval)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[async_trait]
impl Limiter for ConcurrencyLimiter {
    async fn try_acquire(&self, permit: &Permit) -> Result<Admission> {
        let mut running = self.running.lock().await;
        let count = running.entry(permit.queue.clone()).or_insert(0);
        if *count >= self.max_concurrent {
            tracing::debug!(queue = %permit.queue, running = *count, "concurrency limit reached");
            return Ok(Admission::Denied {
                retry_at: self.retry_at(permit.admitted_at),
            });
        }
        *count += 1;
        Ok(Admission::Granted)
    }

    async fn release(&self, permit: &Permit, _release: Release) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(count) = running.get_mut(&permit.queue) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    async fn next_available(&self, queue: &str) -> Result<Option<DateTime<Utc>>> {
        let running = self.running(queue).await;
        Ok((running >= self.max_concurrent).then(|| self.retry_at(Utc::now())))
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        self.running.lock().await.remove(queue);
        Ok(())
    }
}
