//! Event types streamed to task subscribers.
//!
//! A task produces zero or more `Log` events followed by exactly one
//! terminal `Result` event.

use serde::{Deserialize, Serialize};

use super::task::TaskId;

/// A single progress or result message for one task.
///
/// The serialized form is the wire format relayed to stream clients:
/// `{"status":"log","message":...}` or `{"status":"result","result":...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Human-readable progress line
    Log { message: String },

    /// Final pipeline output (terminal)
    Result { result: String },
}

impl StreamEvent {
    /// Create a log event
    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
        }
    }

    /// Create a terminal result event
    pub fn result(result: impl Into<String>) -> Self {
        Self::Result {
            result: result.into(),
        }
    }

    /// Whether this event ends the task's stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. })
    }

    /// Short kind label for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::Result { .. } => "result",
        }
    }
}

/// An event tagged with the task it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,

    #[serde(flatten)]
    pub event: StreamEvent,
}

impl TaskEvent {
    pub fn new(task_id: TaskId, event: StreamEvent) -> Self {
        Self { task_id, event }
    }
}
