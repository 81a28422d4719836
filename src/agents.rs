//! The concrete agents of the retrieve → analyze → write chain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use anyhow::Result;

use crate::adapters::simulation::{references_section, writer_topic};
use crate::adapters::{build_backend, Backend, BackendError, GenerationRequest, SimulatedBackend};
use crate::config::ResolvedConfig;
use crate::core::stage::{with_retry, RetryPolicy, Stage, StageError};
use crate::domain::AgentRole;

/// The fixed retriever → analyzer → writer chain
pub fn standard_stages(config: &ResolvedConfig) -> Result<Vec<Arc<dyn Stage>>> {
    let backend = build_backend(&config.backend)?;
    let retry = config.pipeline.stage_retry.clone();

    let stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(RetrieverStage::new(config.pipeline.retriever_latency())),
        Arc::new(GenerativeStage::new(AgentRole::Analyzer, backend.clone(), retry.clone())),
        Arc::new(GenerativeStage::new(AgentRole::Writer, backend, retry)),
    ];
    Ok(stages)
}

/// Retriever: a pure local transform with fixed simulated latency.
///
/// Has no fallible path, so it does not retry.
pub struct RetrieverStage {
    latency: Duration,
}

impl RetrieverStage {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl Stage for RetrieverStage {
    fn name(&self) -> &str {
        AgentRole::Retriever.name()
    }

    fn status_message(&self) -> &str {
        AgentRole::Retriever.status_message()
    }

    async fn process(&self, input: &str) -> Result<String, StageError> {
        debug!(stage = self.name(), "Processing");
        tokio::time::sleep(self.latency).await;
        Ok(input.trim().to_string())
    }
}

/// Analyzer or Writer backed by a generative backend.
///
/// Backend faults are retried per `retry`; once attempts are exhausted the
/// stage degrades to the fallback backend instead of failing.
pub struct GenerativeStage {
    role: AgentRole,
    backend: Arc<dyn Backend>,
    fallback: Arc<dyn Backend>,
    retry: RetryPolicy,
}

impl GenerativeStage {
    /// Stage using the deterministic simulator as fallback
    pub fn new(role: AgentRole, backend: Arc<dyn Backend>, retry: RetryPolicy) -> Self {
        Self {
            role,
            backend,
            fallback: Arc::new(SimulatedBackend::instant()),
            retry,
        }
    }

    /// Replace the fallback backend
    pub fn with_fallback(mut self, fallback: Arc<dyn Backend>) -> Self {
        self.fallback = fallback;
        self
    }

    async fn generate_primary(&self, request: &GenerationRequest) -> Result<String, BackendError> {
        let output = self.backend.generate(request).await?;

        // The simulator already includes reference links
        if self.role == AgentRole::Writer && !self.backend.is_local() {
            return Ok(format!("{}{}", output, references_section(&writer_topic(&request.input))));
        }

        Ok(output)
    }
}

#[async_trait]
impl Stage for GenerativeStage {
    fn name(&self) -> &str {
        self.role.name()
    }

    fn status_message(&self) -> &str {
        self.role.status_message()
    }

    async fn process(&self, input: &str) -> Result<String, StageError> {
        debug!(stage = self.name(), backend = self.backend.name(), "Processing");

        let request = GenerationRequest::new(self.role, input, build_prompt(self.role, input));

        match with_retry(&self.retry, self.name(), |_| self.generate_primary(&request)).await {
            Ok(output) => Ok(output),
            Err(e) => {
                warn!(
                    stage = self.name(),
                    error = %e,
                    "Max retries reached, switching to fallback"
                );

                let output = self
                    .fallback
                    .generate(&request)
                    .await
                    .map_err(|source| StageError::Fallback {
                        stage: self.name().to_string(),
                        source,
                    })?;

                info!(stage = self.name(), fallback = self.fallback.name(), "Fallback output produced");
                Ok(output)
            }
        }
    }
}

/// Build the role prompt for a generative stage
pub fn build_prompt(role: AgentRole, input: &str) -> String {
    match role {
        AgentRole::Analyzer => format!(
            "You are a Data Analyst. Topic: {input}. \
             Start your response EXACTLY with 'Analysis of {input}:'. \
             Then provide 3 short, punchy bullet points on key trends."
        ),
        AgentRole::Writer => format!(
            "You are a Chief of Staff. Summarize these analytics: {input}. \
             Write a VERY SHORT Executive Summary (max 100 words). \
             Use two headers: '### 🚀 Key Insights' and '### ⚡ Strategic Actions'. \
             Use bullet points. Be professional."
        ),
        AgentRole::Retriever => input.to_string(),
    }
}
