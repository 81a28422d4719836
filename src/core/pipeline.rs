//! Pipeline runner.
//!
//! Runs a task through an ordered list of stages, forwarding each stage's
//! output as the next stage's input and publishing progress to the task's
//! channel. A pipeline never aborts: a stage that keeps failing is replaced
//! by a failure marker and the run continues, so every task ends with
//! exactly one result event.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, error, info, instrument, warn};

use super::broadcaster::EventSink;
use super::stage::{with_retry, RetryPolicy, Stage};
use crate::domain::{StreamEvent, Task, TaskId};

/// Output substituted for a stage whose outer retries are exhausted
pub fn failure_marker(stage: &str, attempts: u32) -> String {
    format!("Error: {} failed after {} retries.", stage, attempts)
}

/// An ordered chain of stages bound to an event sink
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    outer_retry: RetryPolicy,
    sink: Arc<dyn EventSink>,
}

impl Pipeline {
    /// Create a pipeline
    pub fn new(stages: Vec<Arc<dyn Stage>>, outer_retry: RetryPolicy, sink: Arc<dyn EventSink>) -> Self {
        Self {
            stages,
            outer_retry,
            sink,
        }
    }

    /// Validate the stage chain
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            anyhow::bail!("Pipeline must have at least one stage");
        }

        let mut seen = HashSet::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name().is_empty() {
                anyhow::bail!("Stage {} has an empty name", i);
            }
            if !seen.insert(stage.name()) {
                anyhow::bail!("Duplicate stage name '{}'", stage.name());
            }
        }

        Ok(())
    }

    /// Stage names in execution order
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run a task through every stage and publish its result.
    ///
    /// Returns the final output, which is also the payload of the
    /// published `Result` event.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn run(&self, task: &Task) -> String {
        let started = Instant::now();
        let queued_ms = (chrono::Utc::now() - task.submitted_at).num_milliseconds();
        info!(stages = self.stages.len(), queued_ms, "Starting pipeline");

        let mut payload = task.description.clone();

        for stage in &self.stages {
            self.emit(task.id, StreamEvent::log(stage.status_message())).await;
            payload = self.run_stage(stage.as_ref(), &payload).await;
        }

        self.emit(task.id, StreamEvent::result(payload.clone())).await;

        info!(
            duration_ms = started.elapsed().as_millis() as u64,
            "Pipeline completed"
        );

        payload
    }

    /// Run one stage under the outer retry layer
    async fn run_stage(&self, stage: &dyn Stage, input: &str) -> String {
        let stage_start = Instant::now();

        match with_retry(&self.outer_retry, stage.name(), |_| stage.process(input)).await {
            Ok(output) => {
                debug!(
                    stage = stage.name(),
                    duration_ms = stage_start.elapsed().as_millis() as u64,
                    output_bytes = output.len(),
                    "Stage completed"
                );
                output
            }
            Err(e) => {
                let attempts = self.outer_retry.attempts();
                error!(
                    stage = stage.name(),
                    attempts,
                    error = %e,
                    "Stage failed permanently, continuing with failure marker"
                );
                failure_marker(stage.name(), attempts)
            }
        }
    }

    /// Publish an event, swallowing substrate failures
    async fn emit(&self, task_id: TaskId, event: StreamEvent) {
        let kind = event.kind();
        if let Err(e) = self.sink.publish(task_id, event).await {
            warn!(%task_id, kind, error = %e, "Failed to publish event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::broadcaster::BroadcastError;
    use crate::core::stage::StageError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(TaskId, StreamEvent)>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish(&self, task_id: TaskId, event: StreamEvent) -> Result<(), BroadcastError> {
            self.events.lock().unwrap().push((task_id, event));
            Ok(())
        }
    }

    struct DownSink;

    #[async_trait]
    impl EventSink for DownSink {
        async fn publish(&self, _task_id: TaskId, _event: StreamEvent) -> Result<(), BroadcastError> {
            Err(BroadcastError::Unavailable("connection refused".to_string()))
        }
    }

    struct Suffix(&'static str);

    #[async_trait]
    impl Stage for Suffix {
        fn name(&self) -> &str {
            self.0
        }

        fn status_message(&self) -> &str {
            self.0
        }

        async fn process(&self, input: &str) -> Result<String, StageError> {
            Ok(format!("{input}+{}", self.0))
        }
    }

    struct Broken {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Stage for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn status_message(&self) -> &str {
            "broken: trying"
        }

        async fn process(&self, _input: &str) -> Result<String, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StageError::Failed {
                stage: "broken".to_string(),
                message: "always".to_string(),
            })
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_output_forwarded_between_stages() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::new(
            vec![Arc::new(Suffix("a")), Arc::new(Suffix("b")), Arc::new(Suffix("c"))],
            fast_retry(),
            sink.clone(),
        );
        let task = Task::new("start");

        let output = pipeline.run(&task).await;
        assert_eq!(output, "start+a+b+c");

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|(id, _)| *id == task.id));
        assert_eq!(events[0].1, StreamEvent::log("a"));
        assert_eq!(events[3].1, StreamEvent::result("start+a+b+c"));
    }

    #[tokio::test]
    async fn test_failing_stage_degrades_and_continues() {
        let sink = Arc::new(RecordingSink::default());
        let broken = Arc::new(Broken {
            calls: AtomicU32::new(0),
        });
        let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(Suffix("a")), broken.clone(), Arc::new(Suffix("c"))];
        let pipeline = Pipeline::new(stages, fast_retry(), sink.clone());

        let output = pipeline.run(&Task::new("x")).await;

        assert_eq!(output, "Error: broken failed after 3 retries.+c");
        assert_eq!(broken.calls.load(Ordering::SeqCst), 3);

        let events = sink.events.lock().unwrap();
        let results = events.iter().filter(|(_, e)| e.is_terminal()).count();
        assert_eq!(results, 1);
    }

    #[tokio::test]
    async fn test_unavailable_sink_does_not_abort() {
        let pipeline = Pipeline::new(vec![Arc::new(Suffix("a"))], fast_retry(), Arc::new(DownSink));
        assert_eq!(pipeline.run(&Task::new("x")).await, "x+a");
    }

    #[test]
    fn test_validate_rejects_bad_chains() {
        let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());

        let empty = Pipeline::new(vec![], fast_retry(), sink.clone());
        assert!(empty.validate().is_err());

        let dup = Pipeline::new(
            vec![Arc::new(Suffix("a")), Arc::new(Suffix("a"))],
            fast_retry(),
            sink.clone(),
        );
        assert!(dup.validate().is_err());

        let ok = Pipeline::new(vec![Arc::new(Suffix("a"))], fast_retry(), sink);
        assert!(ok.validate().is_ok());
        assert_eq!(ok.stage_names(), vec!["a"]);
    }
}
