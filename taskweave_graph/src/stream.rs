//! Incremental task output.
//!
//! A task stream is a pull-based, finite sequence: zero or more progress and
//! chunk events followed by exactly one [`TaskEvent::Finished`] (or an
//! error). Dropping the stream stops consuming it.

use crate::task::TaskOutput;
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use taskweave_core::TaskError;
use taskweave_queue::{JobEvent, JobEventStream};

/// One item of a task stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TaskEvent {
    Progress { progress: f32, message: Option<String> },
    /// Partial output
    Chunk(Value),
    /// Terminal event carrying the complete output
    Finished(TaskOutput),
}

impl TaskEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

pub type TaskEventStream = Pin<Box<dyn Stream<Item = Result<TaskEvent, TaskError>> + Send>>;

/// A stream holding only the terminal event for `output`.
pub fn finished(output: TaskOutput) -> TaskEventStream {
    Box::pin(stream::once(async move { Ok(TaskEvent::Finished(output)) }))
}

/// A stream that fails immediately.
pub fn failed(error: TaskError) -> TaskEventStream {
    Box::pin(stream::once(async move { Err(error) }))
}

/// Adapts a job stream into a task stream.
pub fn from_job_events(events: JobEventStream) -> TaskEventStream {
    Box::pin(events.map(|item| {
        item.map(|event| match event {
            JobEvent::Progress { progress, message } => TaskEvent::Progress { progress, message },
            JobEvent::Chunk(chunk) => TaskEvent::Chunk(chunk),
            JobEvent::Finished(value) => TaskEvent::Finished(TaskOutput::from_value(value)),
        })
    }))
}

/// Drains a stream down to its terminal output.
///
/// A stream that ends without a `Finished` event is an execution failure.
pub async fn collect_output(mut events: TaskEventStream) -> Result<TaskOutput, TaskError> {
    while let Some(item) = events.next().await {
        if let TaskEvent::Finished(output) = item? {
            return Ok(output);
        }
    }
    Err(TaskError::permanent("stream ended without a final output"))
}
