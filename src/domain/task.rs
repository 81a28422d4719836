//! Submitted tasks and their identifiers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique task identifier.
///
/// Backed by a UUIDv7 so ids sort roughly by submission time while staying
/// unique for submissions within the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A unit of work submitted by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier returned to the submitter
    pub id: TaskId,

    /// Free-form description of what to research
    pub description: String,

    /// When the task was accepted
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    /// Create a task with a freshly generated id
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            description: description.into(),
            submitted_at: Utc::now(),
        }
    }
}
