//! Job model.
//!
//! A [`Job`] is the serializable unit submitted to a named queue. Its status
//! is tracked independently from the task that submitted it.

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use taskweave_core::TaskError;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Job lifecycle status.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

/// Unit of work submitted to a named queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub input: Value,
    /// Correlates jobs submitted by the same graph run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Higher runs first; FIFO within the same priority
    #[serde(default)]
    pub priority: i32,
    /// Submission order, assigned by storage
    #[serde(default)]
    pub sequence: u64,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub progress: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a pending job for `queue`.
    pub fn new(queue: impl Into<String>, input: Value) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            input,
            run_id: None,
            priority: 0,
            sequence: 0,
            status: JobStatus::Pending,
            output: None,
            error: None,
            progress: 0.0,
            progress_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn mark_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.started_at = Some(Utc::now());
    }

    /// Records the final outcome. Aborts win over any other result.
    pub(crate) fn settle(&mut self, result: Result<Value, TaskError>) {
        match result {
            Ok(output) => {
                self.status = JobStatus::Completed;
                self.output = Some(output);
                self.error = None;
                self.progress = 100.0;
            }
            Err(TaskError::Aborted) => {
                self.status = JobStatus::Aborted;
                self.output = None;
                self.error = Some(TaskError::Aborted);
            }
            Err(err) => {
                self.status = JobStatus::Failed;
                self.output = None;
                self.error = Some(err);
            }
        }
        self.completed_at = Some(Utc::now());
    }

    /// Converts a terminal job into the result its client observes.
    ///
    /// Returns `None` while the job is still pending or processing.
    pub fn outcome(&self) -> Option<Result<Value, TaskError>> {
        match self.status {
            JobStatus::Completed => Some(Ok(self.output.clone().unwrap_or(Value::Null))),
            JobStatus::Aborted => Some(Err(TaskError::Aborted)),
            JobStatus::Failed => Some(Err(self
                .error
                .clone()
                .unwrap_or_else(|| TaskError::permanent("job failed without an error")))),
            JobStatus::Pending | JobStatus::Processing => None,
        }
    }
}

/// Incremental event produced by a streaming job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobEvent {
    /// Progress notification
    Progress { progress: f32, message: Option<String> },
    /// Partial result
    Chunk(Value),
    /// Final output; always the last event of a successful stream
    Finished(Value),
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

/// Ordered, finite stream of job events.
pub type JobEventStream = Pin<Box<dyn Stream<Item = Result<JobEvent, TaskError>> + Send>>;

/// Notification published by the server about a job.
#[derive(Clone, Debug, PartialEq)]
pub struct JobUpdate {
    pub job_id: JobId,
    pub kind: JobUpdateKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobUpdateKind {
    Started,
    Progress { progress: f32, message: Option<String> },
    Chunk(Value),
    /// Job reached a terminal status
    Settled(Result<Value, TaskError>),
}
