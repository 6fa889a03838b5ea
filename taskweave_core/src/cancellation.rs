//! Async cancellation token system with parent-child hierarchy.
//!
//! Cancellation is cooperative. A [`CancellationTokenSource`] owns the right
//! to cancel; [`CancellationToken`]s observe it and are threaded through every
//! suspension point (run-functions, job waits, limiter admission).
//!
//! # Racing against cancellation
//!
//! Run-functions that never look at their token still have to appear to stop
//! promptly. [`race`] drops the losing future; [`race_detached`] spawns it so
//! it keeps running in the background with its result discarded.
//!
//! ```ignore
//! let source = CancellationTokenSource::new();
//! let token = source.token();
//!
//! let result = race(&token, slow_call()).await;
//! // Err(TaskError::Aborted) if source.cancel() ran first
//! ```

use crate::error::TaskError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();

        let children = match self.children.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for child in children.into_iter().filter_map(|w| w.upgrade()) {
            child.cancel();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn child(self: &Arc<Self>) -> Arc<Inner> {
        let child = Arc::new(Inner::default());
        if let Ok(mut children) = self.children.lock() {
            children.retain(|w| w.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        // Parent may have been cancelled before the child was registered.
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }
}

/// Thread-safe cancellation token.
///
/// Cloning creates a new reference to the same cancellation state.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
        }
    }

    /// Returns true if the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Completes when the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Returns an owned future that completes when the token is cancelled.
    pub fn wait_cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.clone();
        async move { token.cancelled().await }
    }

    /// Creates a child source: cancelled when this token is, and cancellable
    /// on its own without affecting this token.
    pub fn child_source(&self) -> CancellationTokenSource {
        CancellationTokenSource {
            token: CancellationToken {
                inner: self.inner.child(),
            },
        }
    }

    /// Returns `Err(TaskError::Aborted)` if cancelled.
    pub fn check(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Aborted)
        } else {
            Ok(())
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::never()
    }
}

/// Owner of a cancellation token.
///
/// Cloning creates another handle to the same token.
#[derive(Clone, Debug)]
pub struct CancellationTokenSource {
    token: CancellationToken,
}

impl CancellationTokenSource {
    /// Creates a source with a fresh token.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::never(),
        }
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancels the token and all child tokens. Idempotent.
    pub fn cancel(&self) {
        self.token.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Creates a child source linked to this one.
    pub fn child(&self) -> CancellationTokenSource {
        self.token.child_source()
    }

    /// Cancels the token once `delay` elapses.
    ///
    /// Callers derive deadlines from this; the core has no built-in timeout.
    pub fn cancel_after(&self, delay: Duration) {
        let source = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => source.cancel(),
                _ = source.token.cancelled() => {}
            }
        });
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Races `fut` against cancellation. The future is dropped if it loses.
pub async fn race<F, T>(token: &CancellationToken, fut: F) -> Result<T, TaskError>
where
    F: Future<Output = T>,
{
    if token.is_cancelled() {
        return Err(TaskError::Aborted);
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TaskError::Aborted),
        value = fut => Ok(value),
    }
}

/// Races `fut` against cancellation, running it on its own task.
///
/// If cancellation wins, the spawned task is left running and its eventual
/// result is discarded. A panic inside `fut` is reported as a permanent
/// execution failure.
pub async fn race_detached<F, T>(token: &CancellationToken, fut: F) -> Result<T, TaskError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    if token.is_cancelled() {
        return Err(TaskError::Aborted);
    }
    let handle = tokio::spawn(fut);
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TaskError::Aborted),
        joined = handle => joined.map_err(|e| TaskError::permanent(format!("Task panicked: {}", e))),
    }
}
