//! Per-task publish/subscribe channels.
//!
//! Each task id maps to a broadcast channel that lives from submission
//! until its terminal `Result` event. The terminal result is retained for
//! a short TTL so that a subscriber joining after completion still
//! receives it instead of waiting forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::domain::{StreamEvent, TaskId};

/// Default number of events buffered per channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Default retention of terminal results
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(60);

/// Errors from the broadcast substrate
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Broadcaster is unavailable: {0}")]
    Unavailable(String),

    #[error("Task {0} already published its result")]
    Terminated(TaskId),
}

/// Destination for task events.
///
/// Publishing is fire-and-forget: having no subscribers is not an error.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, task_id: TaskId, event: StreamEvent) -> Result<(), BroadcastError>;
}

struct RetainedResult {
    result: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Registry {
    channels: HashMap<TaskId, broadcast::Sender<StreamEvent>>,
    results: HashMap<TaskId, RetainedResult>,
}

impl Registry {
    fn prune_expired(&mut self, now: Instant) {
        self.results.retain(|_, retained| retained.expires_at > now);
    }
}

/// In-process broadcaster keyed by task id
pub struct Broadcaster {
    registry: Mutex<Registry>,
    capacity: usize,
    result_ttl: Duration,
    closed: AtomicBool,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY, DEFAULT_RESULT_TTL)
    }
}

impl Broadcaster {
    /// Create a broadcaster
    pub fn new(capacity: usize, result_ttl: Duration) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            capacity: capacity.max(1),
            result_ttl,
            closed: AtomicBool::new(false),
        }
    }

    // The registry is never left half-updated, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open the channel for a task so early subscribers attach to it
    pub fn register(&self, task_id: TaskId) {
        let mut registry = self.lock();
        let capacity = self.capacity;
        registry
            .channels
            .entry(task_id)
            .or_insert_with(|| broadcast::channel(capacity).0);
        trace!(%task_id, "Channel registered");
    }

    /// Publish an event for a task.
    ///
    /// A `Result` event closes the channel and is retained for late
    /// subscribers. Events after the result are rejected.
    pub fn send(&self, task_id: TaskId, event: StreamEvent) -> Result<(), BroadcastError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BroadcastError::Unavailable("broadcaster closed".to_string()));
        }

        let mut registry = self.lock();
        registry.prune_expired(Instant::now());

        if registry.results.contains_key(&task_id) {
            return Err(BroadcastError::Terminated(task_id));
        }

        debug!(%task_id, kind = event.kind(), "Publishing event");

        match event {
            StreamEvent::Result { result } => {
                if let Some(sender) = registry.channels.remove(&task_id) {
                    // Err only means nobody is listening right now
                    let _ = sender.send(StreamEvent::result(result.clone()));
                }
                registry.results.insert(
                    task_id,
                    RetainedResult {
                        result,
                        expires_at: Instant::now() + self.result_ttl,
                    },
                );
            }
            log => {
                let capacity = self.capacity;
                let sender = registry
                    .channels
                    .entry(task_id)
                    .or_insert_with(|| broadcast::channel(capacity).0);
                if sender.send(log).is_err() {
                    trace!(%task_id, "No subscribers for event");
                }
            }
        }

        Ok(())
    }

    /// Subscribe to a task's events from now on
    pub fn subscribe(&self, task_id: TaskId) -> Subscription {
        let mut registry = self.lock();
        registry.prune_expired(Instant::now());

        let state = if let Some(retained) = registry.results.get(&task_id) {
            SubscriptionState::Replay(retained.result.clone())
        } else if let Some(sender) = registry.channels.get(&task_id) {
            SubscriptionState::Live(sender.subscribe())
        } else {
            SubscriptionState::Done
        };

        let kind = match state {
            SubscriptionState::Live(_) => SubscriptionKind::Live,
            SubscriptionState::Replay(_) => SubscriptionKind::Replay,
            SubscriptionState::Done => SubscriptionKind::Unknown,
        };

        debug!(%task_id, ?kind, "Subscribed");

        Subscription {
            task_id,
            kind,
            state,
        }
    }

    /// Close every channel; open subscriptions end and publishes fail
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut registry = self.lock();
        let open = registry.channels.len();
        registry.channels.clear();
        debug!(open, "Broadcaster closed");
    }

    /// Number of channels still awaiting a result
    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    /// Number of retained (unexpired) results
    pub fn retained_results(&self) -> usize {
        let mut registry = self.lock();
        registry.prune_expired(Instant::now());
        registry.results.len()
    }
}

#[async_trait]
impl EventSink for Broadcaster {
    async fn publish(&self, task_id: TaskId, event: StreamEvent) -> Result<(), BroadcastError> {
        self.send(task_id, event)
    }
}

/// How a subscription was attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Attached to a running task's channel
    Live,
    /// Task already finished; only the retained result will be delivered
    Replay,
    /// No channel or retained result exists for the id
    Unknown,
}

enum SubscriptionState {
    Live(broadcast::Receiver<StreamEvent>),
    Replay(String),
    Done,
}

/// A finite sequence of events for one task.
///
/// Ends after the `Result` event. Dropping it releases the receiver
/// without affecting the running pipeline.
pub struct Subscription {
    task_id: TaskId,
    kind: SubscriptionKind,
    state: SubscriptionState,
}

impl Subscription {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// Next event, or `None` once the stream is finished
    pub async fn next(&mut self) -> Option<StreamEvent> {
        let event = match &mut self.state {
            SubscriptionState::Done => return None,
            SubscriptionState::Replay(result) => Some(StreamEvent::result(std::mem::take(result))),
            SubscriptionState::Live(receiver) => loop {
                match receiver.recv().await {
                    Ok(event) => break Some(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(task_id = %self.task_id, skipped, "Subscriber lagged, events skipped");
                    }
                    Err(RecvError::Closed) => break None,
                }
            },
        };

        if !matches!(&event, Some(e) if !e.is_terminal()) {
            self.state = SubscriptionState::Done;
        }

        event
    }

    /// Convert into a `Stream` of events
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send {
        stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|event| (event, subscription))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_live_subscription_sees_events_then_ends() {
        let broadcaster = Broadcaster::default();
        let id = TaskId::new();
        broadcaster.register(id);

        let subscription = broadcaster.subscribe(id);
        assert_eq!(subscription.kind(), SubscriptionKind::Live);

        broadcaster.send(id, StreamEvent::log("one")).unwrap();
        broadcaster.send(id, StreamEvent::log("two")).unwrap();
        broadcaster.send(id, StreamEvent::result("done")).unwrap();

        let events: Vec<_> = subscription.into_stream().collect().await;
        assert_eq!(
            events,
            vec![
                StreamEvent::log("one"),
                StreamEvent::log("two"),
                StreamEvent::result("done"),
            ]
        );
        assert_eq!(broadcaster.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let broadcaster = Broadcaster::default();
        let id = TaskId::new();

        assert!(broadcaster.send(id, StreamEvent::log("nobody")).is_ok());
        assert!(broadcaster.send(id, StreamEvent::result("done")).is_ok());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_retained_result_only() {
        let broadcaster = Broadcaster::default();
        let id = TaskId::new();
        broadcaster.register(id);
        broadcaster.send(id, StreamEvent::log("missed")).unwrap();
        broadcaster.send(id, StreamEvent::result("final")).unwrap();

        let subscription = broadcaster.subscribe(id);
        assert_eq!(subscription.kind(), SubscriptionKind::Replay);

        let events: Vec<_> = subscription.into_stream().collect().await;
        assert_eq!(events, vec![StreamEvent::result("final")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retained_result_expires() {
        let broadcaster = Broadcaster::new(8, Duration::from_secs(5));
        let id = TaskId::new();
        broadcaster.send(id, StreamEvent::result("final")).unwrap();
        assert_eq!(broadcaster.retained_results(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;

        let subscription = broadcaster.subscribe(id);
        assert_eq!(subscription.kind(), SubscriptionKind::Unknown);
        let events: Vec<_> = subscription.into_stream().collect().await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_events_after_result_rejected() {
        let broadcaster = Broadcaster::default();
        let id = TaskId::new();
        broadcaster.send(id, StreamEvent::result("final")).unwrap();

        assert!(matches!(
            broadcaster.send(id, StreamEvent::log("late")),
            Err(BroadcastError::Terminated(_))
        ));
        assert!(matches!(
            broadcaster.send(id, StreamEvent::result("again")),
            Err(BroadcastError::Terminated(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_task_ends_immediately() {
        let broadcaster = Broadcaster::default();
        let mut subscription = broadcaster.subscribe(TaskId::new());

        assert_eq!(subscription.kind(), SubscriptionKind::Unknown);
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_ends_live_subscriptions() {
        let broadcaster = Broadcaster::default();
        let id = TaskId::new();
        broadcaster.register(id);
        let mut subscription = broadcaster.subscribe(id);

        broadcaster.close();

        assert!(subscription.next().await.is_none());
        assert!(matches!(
            broadcaster.send(id, StreamEvent::log("x")),
            Err(BroadcastError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_lagged_subscriber_still_sees_result() {
        let broadcaster = Broadcaster::new(2, DEFAULT_RESULT_TTL);
        let id = TaskId::new();
        broadcaster.register(id);
        let subscription = broadcaster.subscribe(id);

        for i in 0..10 {
            broadcaster.send(id, StreamEvent::log(format!("log {i}"))).unwrap();
        }
        broadcaster.send(id, StreamEvent::result("final")).unwrap();

        let events: Vec<_> = subscription.into_stream().collect().await;
        assert_eq!(events.last(), Some(&StreamEvent::result("final")));
        assert!(events.len() <= 2);
    }

    #[tokio::test]
    async fn test_dropping_subscription_does_not_affect_publisher() {
        let broadcaster = Broadcaster::default();
        let id = TaskId::new();
        broadcaster.register(id);

        drop(broadcaster.subscribe(id));

        assert!(broadcaster.send(id, StreamEvent::log("still fine")).is_ok());
        assert!(broadcaster.send(id, StreamEvent::result("done")).is_ok());
    }
}
