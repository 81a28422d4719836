//! Pipeline Integration Tests
//!
//! Event ordering per task, backend degradation and task isolation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentrelay::adapters::{Backend, BackendError, GenerationRequest};
use agentrelay::agents::GenerativeStage;
use agentrelay::config::ResolvedConfig;
use agentrelay::core::{Gateway, RetryPolicy, Stage, Subscription};
use agentrelay::domain::{AgentRole, StreamEvent};
use async_trait::async_trait;

fn mock_config() -> ResolvedConfig {
    let mut config = ResolvedConfig::default();
    config.backend.mock_mode = true;
    config.backend.simulated_latency_ms = 0;
    config.pipeline.retriever_latency_ms = 0;
    config
}

async fn collect(mut subscription: Subscription) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = subscription.next().await {
        events.push(event);
    }
    events
}

struct AlwaysDown {
    calls: AtomicU32,
}

#[async_trait]
impl Backend for AlwaysDown {
    fn name(&self) -> &str {
        "always-down"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BackendError::Unavailable("503 Service Unavailable".to_string()))
    }
}

#[tokio::test]
async fn test_every_task_gets_three_logs_then_one_result() {
    let gateway = Gateway::from_config(&mock_config()).unwrap();

    let ids: Vec<_> = ["solar power", "wind farms", "'hydrogen': storage"]
        .iter()
        .map(|d| gateway.submit(d).unwrap())
        .collect();
    let subscriptions: Vec<_> = ids.iter().map(|id| gateway.stream(*id)).collect();

    assert_eq!(gateway.scheduler().tick().await, 3);

    for subscription in subscriptions {
        let events = collect(subscription).await;
        assert_eq!(events.len(), 4, "unexpected events: {events:?}");

        assert_eq!(events[0], StreamEvent::log(AgentRole::Retriever.status_message()));
        assert_eq!(events[1], StreamEvent::log(AgentRole::Analyzer.status_message()));
        assert_eq!(events[2], StreamEvent::log(AgentRole::Writer.status_message()));

        match &events[3] {
            StreamEvent::Result { result } => assert!(!result.is_empty()),
            other => panic!("expected result, got {other:?}"),
        }
    }

    assert_eq!(gateway.broadcaster().open_channels(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failing_backend_falls_back_after_three_attempts() {
    let backend = Arc::new(AlwaysDown {
        calls: AtomicU32::new(0),
    });
    let stage = GenerativeStage::new(AgentRole::Analyzer, backend.clone(), RetryPolicy::default());

    let started = tokio::time::Instant::now();
    let output = stage.process("renewable energy in Germany").await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    assert!(output.starts_with("Analysis of"), "got: {output}");
    assert!(elapsed >= Duration::from_secs(3), "elapsed: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3100), "elapsed: {elapsed:?}");
}

#[tokio::test]
async fn test_identical_descriptions_are_independent() {
    let gateway = Gateway::from_config(&mock_config()).unwrap();

    let a = gateway.submit("renewable energy in Germany").unwrap();
    let b = gateway.submit("renewable energy in Germany").unwrap();
    assert_ne!(a, b);

    let stream_a = gateway.stream(a);
    let stream_b = gateway.stream(b);
    gateway.scheduler().tick().await;

    let events_a = collect(stream_a).await;
    let events_b = collect(stream_b).await;

    assert_eq!(events_a.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(events_b.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(events_a.len(), 4);
    assert_eq!(events_b.len(), 4);
}
