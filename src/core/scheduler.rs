//! Batch scheduler.
//!
//! Submissions accumulate in a lock-guarded queue. On every tick the whole
//! queue is swapped out into a batch and each task is run through the
//! pipeline. The swap happens under the same lock that `enqueue` takes, so
//! a task submitted during a drain lands in the next batch: never lost and
//! never processed twice.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::broadcaster::EventSink;
use super::pipeline::Pipeline;
use crate::domain::{StreamEvent, Task, TaskId};

/// Scheduler tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Time between drains in milliseconds (default: 3000)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Tasks run concurrently within one batch (1 = sequential)
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
}

fn default_tick_interval() -> u64 {
    3000
}
fn default_batch_concurrency() -> usize {
    1
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            batch_concurrency: default_batch_concurrency(),
        }
    }
}

impl SchedulerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// Counters exposed for health reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Tasks waiting for the next drain
    pub pending: usize,
    /// Non-empty batches drained so far
    pub batches: u64,
    /// Tasks whose pipeline ran to completion
    pub processed: u64,
    /// Tasks whose pipeline panicked
    pub aborted: u64,
}

/// Periodic batching orchestrator
pub struct BatchScheduler {
    queue: Mutex<Vec<Task>>,
    pipeline: Arc<Pipeline>,
    sink: Arc<dyn EventSink>,
    settings: SchedulerSettings,
    batches: AtomicU64,
    processed: AtomicU64,
    aborted: AtomicU64,
}

impl BatchScheduler {
    /// Create a scheduler.
    ///
    /// `sink` receives a failure result for any task whose pipeline aborts.
    pub fn new(pipeline: Arc<Pipeline>, sink: Arc<dyn EventSink>, settings: SchedulerSettings) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            pipeline,
            sink,
            settings,
            batches: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    // Queue operations are a single push or swap, so a poisoned lock
    // still holds a consistent Vec.
    fn lock_queue(&self) -> MutexGuard<'_, Vec<Task>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a task to the next batch. Never waits on a running batch.
    pub fn enqueue(&self, task: Task) {
        let task_id = task.id;
        let pending = {
            let mut queue = self.lock_queue();
            queue.push(task);
            queue.len()
        };
        debug!(%task_id, pending, "Task enqueued");
    }

    /// Atomically take every queued task, leaving the queue empty
    pub fn drain(&self) -> Vec<Task> {
        std::mem::take(&mut *self.lock_queue())
    }

    /// Number of tasks waiting for the next drain
    pub fn pending(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            pending: self.pending(),
            batches: self.batches.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }

    /// Drain the queue and run the resulting batch to completion.
    ///
    /// Returns the number of tasks in the batch (0 when idle).
    pub async fn tick(&self) -> usize {
        let batch = self.drain();
        if batch.is_empty() {
            return 0;
        }

        let size = batch.len();
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.process_batch(batch).await;
        size
    }

    /// Run every task of a batch through the pipeline
    #[instrument(skip(self, batch), fields(size = batch.len()))]
    pub async fn process_batch(&self, batch: Vec<Task>) {
        info!("Processing batch");

        stream::iter(batch)
            .for_each_concurrent(self.settings.batch_concurrency.max(1), |task| self.run_task(task))
            .await;

        debug!("Batch finished");
    }

    /// Run one task in its own tokio task so a panic stays contained
    async fn run_task(&self, task: Task) {
        let task_id = task.id;
        let pipeline = Arc::clone(&self.pipeline);

        match tokio::spawn(async move { pipeline.run(&task).await }).await {
            Ok(_) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.aborted.fetch_add(1, Ordering::Relaxed);
                error!(%task_id, error = %e, "Pipeline aborted unexpectedly");
                self.publish_abort(task_id).await;
            }
        }
    }

    /// Make sure subscribers of an aborted task still see a terminal event
    async fn publish_abort(&self, task_id: TaskId) {
        let event = StreamEvent::result(format!(
            "Error: pipeline for task {} aborted unexpectedly.",
            task_id
        ));

        // Rejected if the pipeline got as far as publishing its own result
        if let Err(e) = self.sink.publish(task_id, event).await {
            debug!(%task_id, error = %e, "Abort result not published");
        }
    }

    /// Tick forever until `shutdown` is cancelled.
    ///
    /// A batch in progress always finishes before shutdown is observed.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let tick_interval = self.settings.tick_interval();
        info!(
            tick_ms = tick_interval.as_millis() as u64,
            concurrency = self.settings.batch_concurrency,
            "Scheduler started and watching for tasks"
        );

        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            // A panicking batch must never end the loop
            if let Err(panic) = AssertUnwindSafe(self.tick()).catch_unwind().await {
                error!(panic = panic_message(&*panic), "Batch processing panicked, scheduler continues");
            }
        }

        let abandoned = self.pending();
        if abandoned > 0 {
            warn!(abandoned, "Scheduler stopped with tasks still queued");
        } else {
            info!("Scheduler stopped");
        }
    }

    /// Spawn the scheduler loop onto the runtime
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::broadcaster::{BroadcastError, Broadcaster};
    use crate::core::stage::{RetryPolicy, Stage, StageError};
    use async_trait::async_trait;

    struct Upper;

    #[async_trait]
    impl Stage for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn status_message(&self) -> &str {
            "upper: working"
        }

        async fn process(&self, input: &str) -> Result<String, StageError> {
            if input == "panic" {
                panic!("stage exploded");
            }
            Ok(input.to_uppercase())
        }
    }

    fn scheduler(sink: Arc<Broadcaster>) -> BatchScheduler {
        let pipeline = Arc::new(Pipeline::new(
            vec![Arc::new(Upper)],
            RetryPolicy::fixed(1, Duration::ZERO),
            sink.clone(),
        ));
        BatchScheduler::new(pipeline, sink, SchedulerSettings::default())
    }

    #[test]
    fn test_drain_swaps_queue() {
        let scheduler = scheduler(Arc::new(Broadcaster::default()));
        scheduler.enqueue(Task::new("a"));
        scheduler.enqueue(Task::new("b"));

        let batch = scheduler.drain();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].description, "a");
        assert_eq!(scheduler.pending(), 0);
        assert!(scheduler.drain().is_empty());
    }

    #[tokio::test]
    async fn test_empty_tick_is_noop() {
        let scheduler = scheduler(Arc::new(Broadcaster::default()));
        assert_eq!(scheduler.tick().await, 0);
        assert_eq!(scheduler.stats().batches, 0);
    }

    #[tokio::test]
    async fn test_tick_runs_every_task() {
        let broadcaster = Arc::new(Broadcaster::default());
        let scheduler = scheduler(broadcaster.clone());

        let task = Task::new("solar");
        let id = task.id;
        broadcaster.register(id);
        scheduler.enqueue(task);
        scheduler.enqueue(Task::new("wind"));

        assert_eq!(scheduler.tick().await, 2);

        let stats = scheduler.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.processed, 2);

        let mut replay = broadcaster.subscribe(id);
        assert_eq!(replay.next().await, Some(StreamEvent::result("SOLAR")));
    }

    #[tokio::test]
    async fn test_panicking_task_still_gets_terminal_event() {
        let broadcaster = Arc::new(Broadcaster::default());
        let scheduler = scheduler(broadcaster.clone());

        let bad = Task::new("panic");
        let bad_id = bad.id;
        broadcaster.register(bad_id);
        let mut subscription = broadcaster.subscribe(bad_id);

        scheduler.enqueue(bad);
        scheduler.enqueue(Task::new("fine"));
        scheduler.tick().await;

        let stats = scheduler.stats();
        assert_eq!(stats.aborted, 1);
        assert_eq!(stats.processed, 1);

        assert_eq!(subscription.next().await, Some(StreamEvent::log("upper: working")));
        match subscription.next().await {
            Some(StreamEvent::Result { result }) => assert!(result.contains("aborted unexpectedly")),
            other => panic!("expected result, got {other:?}"),
        }
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_processes_and_stops() {
        let broadcaster = Arc::new(Broadcaster::default());
        let scheduler = Arc::new(scheduler(broadcaster.clone()));
        let shutdown = CancellationToken::new();
        let handle = scheduler.spawn(shutdown.clone());

        scheduler.enqueue(Task::new("tidal"));
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(scheduler.stats().processed, 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_result_rejected_after_real_result() {
        let broadcaster = Broadcaster::default();
        let id = TaskId::new();
        broadcaster.send(id, StreamEvent::result("real")).unwrap();
        assert!(matches!(
            broadcaster.send(id, StreamEvent::result("abort")),
            Err(BroadcastError::Terminated(_))
        ));
    }
}
