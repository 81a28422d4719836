//! Adapter interfaces for generative-text backends.
//!
//! Adapters provide a unified interface for producing stage output,
//! either from a remote generative model or from the local simulator.

pub mod gemini;
pub mod simulation;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::BackendSettings;
use crate::domain::AgentRole;

// Re-export the concrete backends
pub use gemini::GeminiBackend;
pub use simulation::SimulatedBackend;

/// Errors a backend can raise for a single generation attempt
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Backend returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Backend returned no text")]
    EmptyResponse,

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// A single generation request
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Which agent is asking
    pub role: AgentRole,

    /// Raw stage input (output of the previous stage)
    pub input: String,

    /// Role prompt built from the input
    pub prompt: String,
}

impl GenerationRequest {
    pub fn new(role: AgentRole, input: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            role,
            input: input.into(),
            prompt: prompt.into(),
        }
    }
}

/// Trait for generative backends
#[async_trait]
pub trait Backend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Whether output is produced locally rather than by a model
    fn is_local(&self) -> bool {
        false
    }

    /// Produce text for a request
    async fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError>;
}

/// Choose the primary backend for generative stages
pub fn build_backend(settings: &BackendSettings) -> Result<Arc<dyn Backend>> {
    if settings.use_simulation() {
        if !settings.mock_mode {
            warn!("GOOGLE_API_KEY not set, using local simulation");
        }
        info!(latency_ms = settings.simulated_latency_ms, "Using simulated backend");
        return Ok(Arc::new(SimulatedBackend::new(settings.simulated_latency())));
    }

    let api_key = settings.api_key.clone().unwrap_or_default();
    let mut backend = GeminiBackend::new(api_key, settings.model.clone(), settings.request_timeout())?;
    if let Some(ref base_url) = settings.base_url {
        backend = backend.with_base_url(base_url.clone());
    }

    info!(model = %settings.model, "Using generative backend");
    Ok(Arc::new(backend))
}
