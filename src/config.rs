//! Configuration for agentrelay.
//!
//! Configuration sources (highest priority first):
//! 1. CLI flags (applied by the caller)
//! 2. Environment variables (AGENTRELAY_ADDRESS, AGENTRELAY_TICK_MS,
//!    AGENTRELAY_MOCK, GOOGLE_API_KEY)
//! 3. Config file (.agentrelay/config.yaml)
//! 4. Defaults
//!
//! Config file discovery:
//! - AGENTRELAY_CONFIG, if set, names the file directly
//! - Otherwise searches the current directory and parents for .agentrelay/config.yaml
//! - Falls back to ~/.agentrelay/config.yaml

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::broadcaster::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_RESULT_TTL};
use crate::core::gateway::SubmissionLimits;
use crate::core::scheduler::SchedulerSettings;
use crate::core::stage::RetryPolicy;

/// Directory holding the config file
pub const CONFIG_DIR: &str = ".agentrelay";

/// Config file name inside [`CONFIG_DIR`]
pub const CONFIG_FILE: &str = "config.yaml";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub broadcast: BroadcastSettings,
    #[serde(default)]
    pub limits: SubmissionLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Socket address for the HTTP gateway
    #[serde(default = "default_address")]
    pub address: String,
}

fn default_address() -> String {
    "127.0.0.1:8000".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Simulated retriever latency in milliseconds
    #[serde(default = "default_latency")]
    pub retriever_latency_ms: u64,

    /// Retry policy inside generative stages
    #[serde(default)]
    pub stage_retry: RetryPolicy,

    /// Retry policy the pipeline wraps around each stage
    #[serde(default)]
    pub outer_retry: RetryPolicy,
}

fn default_latency() -> u64 {
    1000
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retriever_latency_ms: default_latency(),
            stage_retry: RetryPolicy::default(),
            outer_retry: RetryPolicy::default(),
        }
    }
}

impl PipelineSettings {
    pub fn retriever_latency(&self) -> Duration {
        Duration::from_millis(self.retriever_latency_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Use the local simulator instead of the generative model
    #[serde(default)]
    pub mock_mode: bool,

    /// Generative model name
    #[serde(default = "default_model")]
    pub model: String,

    /// Override for the API root
    #[serde(default)]
    pub base_url: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Latency of the simulator when it is the primary backend
    #[serde(default = "default_latency")]
    pub simulated_latency_ms: u64,

    /// API key (environment only, never read from or written to files)
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_model() -> String {
    "gemini-flash-latest".to_string()
}
fn default_request_timeout() -> u64 {
    30
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            mock_mode: false,
            model: default_model(),
            base_url: None,
            request_timeout_secs: default_request_timeout(),
            simulated_latency_ms: default_latency(),
            api_key: None,
        }
    }
}

impl BackendSettings {
    /// Whether stages should use the simulator as their primary backend
    pub fn use_simulation(&self) -> bool {
        self.mock_mode || self.api_key.as_deref().map_or(true, str::is_empty)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn simulated_latency(&self) -> Duration {
        Duration::from_millis(self.simulated_latency_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastSettings {
    /// Events buffered per task channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// How long a finished task's result stays available to late subscribers
    #[serde(default = "default_result_ttl")]
    pub result_ttl_secs: u64,
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}
fn default_result_ttl() -> u64 {
    DEFAULT_RESULT_TTL.as_secs()
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            result_ttl_secs: default_result_ttl(),
        }
    }
}

impl BroadcastSettings {
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

/// Resolved configuration
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolvedConfig {
    pub server: ServerSettings,
    pub scheduler: SchedulerSettings,
    pub pipeline: PipelineSettings,
    pub backend: BackendSettings,
    pub broadcast: BroadcastSettings,
    pub limits: SubmissionLimits,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    fn from_file(file: ConfigFile, config_file: Option<PathBuf>) -> Self {
        Self {
            server: file.server,
            scheduler: file.scheduler,
            pipeline: file.pipeline,
            backend: file.backend,
            broadcast: file.broadcast,
            limits: file.limits,
            config_file,
        }
    }

    /// Apply environment overrides using `lookup` to read variables
    fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup("AGENTRELAY_ADDRESS") {
            self.server.address = address;
        }

        if let Some(tick) = lookup("AGENTRELAY_TICK_MS") {
            self.scheduler.tick_interval_ms = tick
                .trim()
                .parse()
                .with_context(|| format!("Invalid AGENTRELAY_TICK_MS: {}", tick))?;
        }

        if let Some(mock) = lookup("AGENTRELAY_MOCK") {
            self.backend.mock_mode = parse_flag(&mock)
                .with_context(|| format!("Invalid AGENTRELAY_MOCK: {}", mock))?;
        }

        if let Some(key) = lookup("GOOGLE_API_KEY") {
            if !key.trim().is_empty() {
                self.backend.api_key = Some(key.trim().to_string());
            }
        }

        Ok(())
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("expected a boolean, got '{}'", other),
    }
}

/// Find config file by searching `start` and its parents, then the home directory
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    let home_config = dirs::home_dir()?.join(CONFIG_DIR).join(CONFIG_FILE);
    home_config.exists().then_some(home_config)
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Load configuration from all sources
pub fn load_config() -> Result<ResolvedConfig> {
    let explicit = std::env::var("AGENTRELAY_CONFIG").ok().map(PathBuf::from);
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;

    load_config_from(explicit, &cwd, |key| std::env::var(key).ok())
}

fn load_config_from<F>(explicit: Option<PathBuf>, cwd: &Path, lookup: F) -> Result<ResolvedConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let config_file = match explicit {
        Some(path) => Some(path),
        None => find_config_file(cwd),
    };

    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    let mut config = ResolvedConfig::from_file(file, config_file);
    config.apply_env(lookup)?;
    Ok(config)
}
