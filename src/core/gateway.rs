//! Submission and stream gateway.
//!
//! Transport-independent entry points: `submit` hands a task to the
//! scheduler and returns its id immediately, `stream` opens a subscription
//! on the broadcaster.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::broadcaster::{Broadcaster, EventSink, Subscription};
use super::pipeline::Pipeline;
use super::scheduler::{BatchScheduler, SchedulerStats};
use crate::agents::standard_stages;
use crate::config::ResolvedConfig;
use crate::domain::{Task, TaskId};

/// Reasons a submission is rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Task description cannot be empty")]
    EmptyDescription,

    #[error("Task description is {actual} bytes (limit: {limit})")]
    DescriptionTooLarge { actual: usize, limit: usize },
}

/// Limits applied to incoming submissions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionLimits {
    /// Maximum description size in bytes (default: 10KB)
    #[serde(default = "default_max_description_bytes")]
    pub max_description_bytes: usize,
}

fn default_max_description_bytes() -> usize {
    10 * 1024
}

impl Default for SubmissionLimits {
    fn default() -> Self {
        Self {
            max_description_bytes: default_max_description_bytes(),
        }
    }
}

impl SubmissionLimits {
    /// Validate a description against the limits
    pub fn validate(&self, description: &str) -> Result<(), SubmitError> {
        if description.trim().is_empty() {
            return Err(SubmitError::EmptyDescription);
        }

        let actual = description.len();
        if actual > self.max_description_bytes {
            return Err(SubmitError::DescriptionTooLarge {
                actual,
                limit: self.max_description_bytes,
            });
        }

        Ok(())
    }
}

/// Front door of the pipeline
pub struct Gateway {
    scheduler: Arc<BatchScheduler>,
    broadcaster: Arc<Broadcaster>,
    limits: SubmissionLimits,
}

impl Gateway {
    /// Create a gateway over existing components
    pub fn new(scheduler: Arc<BatchScheduler>, broadcaster: Arc<Broadcaster>, limits: SubmissionLimits) -> Self {
        Self {
            scheduler,
            broadcaster,
            limits,
        }
    }

    /// Wire up broadcaster, stages, pipeline and scheduler from config
    pub fn from_config(config: &ResolvedConfig) -> Result<Self> {
        let broadcaster = Arc::new(Broadcaster::new(
            config.broadcast.channel_capacity,
            config.broadcast.result_ttl(),
        ));
        let sink: Arc<dyn EventSink> = broadcaster.clone();

        let pipeline = Pipeline::new(
            standard_stages(config)?,
            config.pipeline.outer_retry.clone(),
            sink.clone(),
        );
        pipeline.validate()?;

        let scheduler = Arc::new(BatchScheduler::new(
            Arc::new(pipeline),
            sink,
            config.scheduler.clone(),
        ));

        Ok(Self::new(scheduler, broadcaster, config.limits.clone()))
    }

    /// Accept a task; returns its id without waiting for execution
    pub fn submit(&self, description: &str) -> Result<TaskId, SubmitError> {
        self.limits.validate(description)?;

        let task = Task::new(description);
        let task_id = task.id;

        // Register before enqueueing so the channel exists for any
        // subscriber arriving ahead of the first event.
        self.broadcaster.register(task_id);
        self.scheduler.enqueue(task);

        info!(%task_id, "Task queued");
        Ok(task_id)
    }

    /// Open an event stream for a task
    pub fn stream(&self, task_id: TaskId) -> Subscription {
        self.broadcaster.subscribe(task_id)
    }

    /// Start the scheduler loop
    pub fn start(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.scheduler.spawn(shutdown)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn scheduler(&self) -> &Arc<BatchScheduler> {
        &self.scheduler
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::broadcaster::SubscriptionKind;

    fn mock_config() -> ResolvedConfig {
        let mut config = ResolvedConfig::default();
        config.backend.mock_mode = true;
        config.backend.simulated_latency_ms = 0;
        config.pipeline.retriever_latency_ms = 0;
        config
    }

    #[test]
    fn test_limits_validation() {
        let limits = SubmissionLimits {
            max_description_bytes: 8,
        };

        assert_eq!(limits.validate("  \n"), Err(SubmitError::EmptyDescription));
        assert_eq!(
            limits.validate("far too long"),
            Err(SubmitError::DescriptionTooLarge {
                actual: 12,
                limit: 8
            })
        );
        assert!(limits.validate("solar").is_ok());
    }

    #[tokio::test]
    async fn test_submit_returns_immediately_and_queues() {
        let gateway = Gateway::from_config(&mock_config()).unwrap();

        let a = gateway.submit("renewable energy in Germany").unwrap();
        let b = gateway.submit("renewable energy in Germany").unwrap();

        assert_ne!(a, b);
        assert_eq!(gateway.stats().pending, 2);
        assert_eq!(gateway.stream(a).kind(), SubscriptionKind::Live);
    }

    #[tokio::test]
    async fn test_rejected_submission_is_not_queued() {
        let gateway = Gateway::from_config(&mock_config()).unwrap();

        assert!(gateway.submit("").is_err());
        assert_eq!(gateway.stats().pending, 0);
        assert_eq!(gateway.broadcaster().open_channels(), 0);
    }

    #[tokio::test]
    async fn test_stream_follows_task_to_result() {
        let gateway = Gateway::from_config(&mock_config()).unwrap();

        let id = gateway.submit("geothermal heat").unwrap();
        let mut subscription = gateway.stream(id);

        gateway.scheduler().tick().await;

        let mut logs = 0;
        while let Some(event) = subscription.next().await {
            if event.is_terminal() {
                break;
            }
            logs += 1;
        }
        assert_eq!(logs, 3);
        assert!(subscription.next().await.is_none());
    }
}
