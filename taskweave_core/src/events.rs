//! Lifecycle event surface with serde-serializable events.
//!
//! Every task, job and graph run reports `Started`, `Progress`, `Completed`,
//! `Failed` and `Aborted` notifications through an [`EventSink`]. The payload
//! shape is stable so external loggers and UIs can consume it without
//! depending on engine internals.
//!
//! # Persistence
//!
//! [`EventLog`] keeps events in memory and can write them to
//! `{dir}/{log_id}.json` for later replay.

use crate::error::TaskError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;

/// Error types for event persistence.
#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error("Write failed: {0}")]
    WriteFailed(#[from] std::io::Error),
}

/// What an event is about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum EventScope {
    Task { task_id: String, task_type: String },
    Job { job_id: String, queue: String },
    Graph { run_id: String },
}

/// What happened.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Progress {
        /// 0.0 to 100.0
        progress: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Completed,
    Failed {
        error: TaskError,
    },
    Aborted,
}

/// A single lifecycle notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub scope: EventScope,
    pub event: EventKind,
}

impl LifecycleEvent {
    /// Creates an event stamped with the current time.
    pub fn now(scope: EventScope, event: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            scope,
            event,
        }
    }
}

/// Receiver of lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Sink discarding every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: LifecycleEvent) {}
}

/// In-memory event recorder with broadcast subscription.
///
/// Cloning shares the same log.
#[derive(Clone)]
pub struct EventLog {
    log_id: String,
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
    sender: broadcast::Sender<LifecycleEvent>,
    dir: Option<PathBuf>,
}

impl EventLog {
    pub fn new(log_id: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            log_id: log_id.into(),
            events: Arc::new(Mutex::new(Vec::new())),
            sender,
            dir: None,
        }
    }

    /// Enables persistence to `dir`.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Subscribes to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Returns a snapshot of all recorded events.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes all recorded events to `{dir}/{log_id}.json`.
    ///
    /// Returns the written path, or `None` if persistence is disabled.
    pub async fn persist(&self) -> Result<Option<PathBuf>, EventLogError> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.json", self.log_id));
        let json = serde_json::to_string_pretty(&self.events())?;
        tokio::fs::write(&path, json).await?;
        Ok(Some(path))
    }

    /// Loads events previously written by [`persist`](Self::persist).
    pub async fn replay(path: impl AsRef<Path>) -> Result<Vec<LifecycleEvent>, EventLogError> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&contents)?)
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: LifecycleEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}

/// Sink forwarding events to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: LifecycleEvent) {
        match &event.event {
            EventKind::Failed { error } => {
                tracing::warn!(scope = ?event.scope, %error, "lifecycle failed")
            }
            kind => tracing::debug!(scope = ?event.scope, ?kind, "lifecycle"),
        }
    }
}
