//! Stage contract and retry policy.
//!
//! A stage is a named `input -> output` text transform. Stages carry their
//! own internal retry and fallback; the pipeline wraps them in a second,
//! outer retry layer.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::adapters::BackendError;

/// Errors a stage may surface to the pipeline
#[derive(Debug, Error)]
pub enum StageError {
    /// The local fallback itself failed; nothing left to degrade to
    #[error("Fallback generation failed for stage '{stage}': {source}")]
    Fallback {
        stage: String,
        #[source]
        source: BackendError,
    },

    #[error("Stage '{stage}' failed: {message}")]
    Failed { stage: String, message: String },
}

/// A single named unit of work in the pipeline
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name (used in logs and failure markers)
    fn name(&self) -> &str;

    /// Progress line published before the stage runs
    fn status_message(&self) -> &str;

    /// Transform the input into this stage's output
    async fn process(&self, input: &str) -> Result<String, StageError>;
}

/// Retry policy for a retry layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay after a failed attempt in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (1.0 = fixed backoff)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    1.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Fixed delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            initial_delay_ms: ms,
            max_delay_ms: ms,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate delay after a specific failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Effective attempt count (at least one)
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `op` until it succeeds or the policy's attempts are used up.
///
/// Every failed attempt is followed by the policy delay, including the
/// last one, so an exhausted layer costs `attempts × delay`. The error of
/// the last attempt is returned.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    stage = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed"
                );

                tokio::time::sleep(delay).await;

                if attempt >= max_attempts {
                    return Err(e);
                }
            }
        }
    }
}
