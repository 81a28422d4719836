//! Command-line interface for agentrelay.
//!
//! Provides commands for serving the HTTP gateway, running a single task
//! locally, submitting to a running gateway and inspecting configuration.

use std::io::{self, Read};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{self, ResolvedConfig};
use crate::core::Gateway;
use crate::domain::{StreamEvent, TaskEvent};
use crate::server::{self, handlers::SubmitResponse};

/// agentrelay - Batching multi-agent task pipeline
#[derive(Parser, Debug)]
#[command(name = "agentrelay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP gateway and batch scheduler
    Serve {
        /// Address to bind to (overrides config)
        #[arg(short, long)]
        address: Option<String>,

        /// Scheduler tick interval in milliseconds (overrides config)
        #[arg(long)]
        tick_ms: Option<u64>,

        /// Use the local simulator instead of the generative backend
        #[arg(long)]
        mock: bool,
    },

    /// Run one task through the pipeline locally and print its events
    Run {
        /// Task description (reads from stdin if not provided)
        description: Option<String>,

        /// Use the local simulator instead of the generative backend
        #[arg(long)]
        mock: bool,

        /// Print every event as a JSON line tagged with the task id
        #[arg(long)]
        json: bool,
    },

    /// Submit a task to a running gateway and follow its stream
    Submit {
        /// Task description
        description: String,

        /// Gateway base URL
        #[arg(short, long, env = "AGENTRELAY_SERVER", default_value = "http://127.0.0.1:8000")]
        server: String,

        /// Print the task id and exit without streaming
        #[arg(long)]
        no_follow: bool,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve { address, tick_ms, mock } => {
                let mut cfg = config::load_config()?;
                if let Some(address) = address {
                    cfg.server.address = address;
                }
                if let Some(tick_ms) = tick_ms {
                    cfg.scheduler.tick_interval_ms = tick_ms;
                }
                cfg.backend.mock_mode |= mock;
                serve(cfg).await
            }
            Commands::Run {
                description,
                mock,
                json,
            } => {
                let mut cfg = config::load_config()?;
                cfg.backend.mock_mode |= mock;
                let description = match description {
                    Some(d) => d,
                    None => read_stdin()?,
                };
                run_local(&cfg, &description, json).await
            }
            Commands::Submit {
                description,
                server,
                no_follow,
            } => submit_remote(&server, &description, !no_follow).await,
            Commands::Config => show_config(),
        }
    }
}

fn read_stdin() -> Result<String> {
    let mut buffer = String::new();
    io::stdin()
        .read_to_string(&mut buffer)
        .context("Failed to read from stdin")?;
    Ok(buffer)
}

/// Serve until Ctrl-C
async fn serve(cfg: ResolvedConfig) -> Result<()> {
    if cfg.backend.use_simulation() {
        info!("Generative stages will use the local simulator");
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
        signal.cancel();
    });

    server::serve(&cfg, shutdown).await
}

/// Run a single task in-process, printing logs to stderr and the result to stdout
async fn run_local(cfg: &ResolvedConfig, description: &str, json: bool) -> Result<()> {
    let gateway = Gateway::from_config(cfg)?;

    let task_id = gateway.submit(description)?;
    let mut subscription = gateway.stream(task_id);
    eprintln!("[Task {} queued]", task_id);

    let (_, outcome) = tokio::join!(gateway.scheduler().tick(), async {
        let mut result = None;
        while let Some(event) = subscription.next().await {
            if json {
                match serde_json::to_string(&TaskEvent::new(task_id, event.clone())) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(error = %e, "Failed to encode event"),
                }
            }
            match event {
                StreamEvent::Log { message } if !json => eprintln!("  {}", message),
                StreamEvent::Log { .. } => {}
                StreamEvent::Result { result: output } => result = Some(output),
            }
        }
        result
    });

    match outcome {
        Some(result) => {
            if !json {
                println!("{}", result);
            }
            eprintln!("\n[Task {} completed]", task_id);
            Ok(())
        }
        None => anyhow::bail!("Task {} ended without a result", task_id),
    }
}

/// Submit to a running gateway and optionally follow the event stream
async fn submit_remote(server: &str, description: &str, follow: bool) -> Result<()> {
    let base = server.trim_end_matches('/');
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/submit-task", base))
        .json(&serde_json::json!({ "task_description": description }))
        .send()
        .await
        .with_context(|| format!("Failed to reach gateway at {}", base))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Submission rejected ({}): {}", status, body);
    }

    let ack: SubmitResponse = response.json().await.context("Invalid submission response")?;
    if !follow {
        println!("{}", ack.task_id);
        return Ok(());
    }
    eprintln!("[Task {} {}]", ack.task_id, ack.status);

    let response = client
        .get(format!("{}/stream/{}", base, ack.task_id))
        .send()
        .await
        .context("Failed to open event stream")?
        .error_for_status()
        .context("Event stream refused")?;

    let mut body = response.bytes_stream();
    let mut parser = SseParser::default();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("Event stream interrupted")?;
        for event in parser.feed(&chunk) {
            match event {
                StreamEvent::Log { message } => eprintln!("  {}", message),
                StreamEvent::Result { result } => {
                    println!("{}", result);
                    return Ok(());
                }
            }
        }
    }

    anyhow::bail!("Event stream closed before a result arrived")
}

/// Incremental decoder for `data:` lines of a server-sent event stream
#[derive(Default)]
struct SseParser {
    buffer: String,
}

impl SseParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\r', '\n']);

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            match serde_json::from_str(data.trim_start()) {
                Ok(event) => events.push(event),
                Err(e) => warn!(error = %e, "Skipping malformed event"),
            }
        }
        events
    }
}

fn show_config() -> Result<()> {
    let cfg = config::load_config()?;

    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!(
        "API key:     {}",
        if cfg.backend.api_key.is_some() { "set" } else { "not set" }
    );
    println!(
        "Backend:     {}",
        if cfg.backend.use_simulation() { "simulation" } else { "gemini" }
    );
    println!();
    print!("{}", serde_yaml::to_string(&cfg).context("Failed to render config")?);

    Ok(())
}
