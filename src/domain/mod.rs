//! Domain types for the agentrelay pipeline.
//!
//! This module contains the core data structures:
//! - Task: Submitted work item and its identifier
//! - Events: Progress and result messages streamed to subscribers
//! - Role: The agents in the fixed stage chain

pub mod events;
pub mod role;
pub mod task;

// Re-export commonly used types
pub use events::{StreamEvent, TaskEvent};
pub use role::AgentRole;
pub use task::{Task, TaskId};
