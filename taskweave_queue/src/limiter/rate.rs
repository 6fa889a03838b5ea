//! Sliding-window rate limiter backed by a persisted execution log.
//!
//! Admission for a queue is granted while fewer than `max_executions`
//! records fall inside `[now - window, now]`. When the budget is exhausted the
//! limiter stores a next-available marker (oldest in-window record + window)
//! and denies every attempt until it passes.
//!
//! Each queue's check-then-record runs under its own lock so simultaneous
//! admission attempts cannot both observe the same free slot.

use super::{Admission, Limiter, Permit, Release};
use crate::error::Result;
use crate::storage::RateLimiterStorage;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct RateLimiter {
    storage: Arc<dyn RateLimiterStorage>,
    max_executions: usize,
    window: TimeDelta,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RateLimiter {
    pub fn new(storage: Arc<dyn RateLimiterStorage>, max_executions: usize, window: Duration) -> Self {
        Self {
            storage,
            max_executions: max_executions.max(1),
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_executions(&self) -> usize {
        self.max_executions
    }

    pub fn window(&self) -> TimeDelta {
        self.window
    }

    async fn queue_lock(&self, queue: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .clone()
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn window_end(&self, oldest: DateTime<Utc>) -> DateTime<Utc> {
        oldest
            .checked_add_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[async_trait]
impl Limiter for RateLimiter {
    async fn try_acquire(&self, permit: &Permit) -> Result<Admission> {
        let lock = self.queue_lock(&permit.queue).await;
        let _guard = lock.lock().await;

        let queue = permit.queue.as_str();
        let now = permit.admitted_at;

        if let Some(next) = self.storage.next_available(queue).await? {
            if next > now {
                return Ok(Admission::Denied { retry_at: next });
            }
        }

        let since = self.window_start(now);
        self.storage.prune_before(queue, since).await?;
        let recent = self.storage.executions_since(queue, since).await?;

        if recent.len() >= self.max_executions {
            let oldest = recent.first().copied().unwrap_or(now);
            let retry_at = self.window_end(oldest);
            self.storage.set_next_available(queue, Some(retry_at)).await?;
            tracing::debug!(queue, in_window = recent.len(), %retry_at, "rate limit reached");
            return Ok(Admission::Denied { retry_at });
        }

        self.storage.record_execution(queue, now).await?;
        self.storage.set_next_available(queue, None).await?;
        Ok(Admission::Granted)
    }

    async fn release(&self, permit: &Permit, release: Release) -> Result<()> {
        if release == Release::Finished {
            return Ok(());
        }
        let lock = self.queue_lock(&permit.queue).await;
        let _guard = lock.lock().await;
        self.storage
            .remove_execution(&permit.queue, permit.admitted_at)
            .await?;
        self.storage.set_next_available(&permit.queue, None).await
    }

    async fn next_available(&self, queue: &str) -> Result<Option<DateTime<Utc>>> {
        let now = Utc::now();
        if let Some(next) = self.storage.next_available(queue).await? {
            if next > now {
                return Ok(Some(next));
            }
        }
        let recent = self.storage.executions_since(queue, self.window_start(now)).await?;
        if recent.len() >= self.max_executions {
            Ok(recent.first().map(|oldest| self.window_end(*oldest)))
        } else {
            Ok(None)
        }
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        let lock = self.queue_lock(queue).await;
        let _guard = lock.lock().await;
        self.storage.clear(queue).await
    }
}
