//! Typed edges between task ports.

use crate::task::TaskId;
use serde::{Deserialize, Serialize};
use std::fmt;
use taskweave_core::Compatibility;

/// Directed edge from a source output port to a target input port.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataflow {
    pub source: TaskId,
    pub source_port: String,
    pub target: TaskId,
    pub target_port: String,
}

impl Dataflow {
    pub fn new(
        source: impl Into<TaskId>,
        source_port: impl Into<String>,
        target: impl Into<TaskId>,
        target_port: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            source_port: source_port.into(),
            target: target.into(),
            target_port: target_port.into(),
        }
    }
}

impl fmt::Display for Dataflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.source, self.source_port, self.target, self.target_port
        )
    }
}

/// A dataflow attached to a graph, with the verdict of the static check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WiredDataflow {
    pub dataflow: Dataflow,
    /// `Static` or `Deferred`; deferred edges are checked again on delivery
    pub compatibility: Compatibility,
}

impl WiredDataflow {
    pub fn is_deferred(&self) -> bool {
        matches!(self.compatibility, Compatibility::Deferred)
    }
}
