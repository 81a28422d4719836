//! Core execution engine.
//!
//! This module contains:
//! - Stage: the unit of work and its retry helper
//! - Pipeline: ordered stage chain for one task
//! - Scheduler: periodic batch draining
//! - Broadcaster: per-task event channels
//! - Gateway: submission and stream entry points

pub mod broadcaster;
pub mod gateway;
pub mod pipeline;
pub mod scheduler;
pub mod stage;

// Re-export commonly used types
pub use broadcaster::{BroadcastError, Broadcaster, EventSink, Subscription, SubscriptionKind};
pub use gateway::{Gateway, SubmissionLimits, SubmitError};
pub use pipeline::{failure_marker, Pipeline};
pub use scheduler::{BatchScheduler, SchedulerSettings, SchedulerStats};
pub use stage::{with_retry, RetryPolicy, Stage, StageError};
