//! agentrelay - Batching multi-agent task pipeline
//!
//! Tasks are submitted over HTTP, collected into batches by a periodic
//! scheduler and run through a fixed chain of agents (Retriever, Analyzer,
//! Writer). Progress and results are pushed to subscribers as they happen.
//!
//! # Architecture
//!
//! - Submissions land in a queue and return a task id immediately
//! - Every tick the queue is swapped out and processed as one batch
//! - Each agent retries its backend and falls back to a local simulator
//! - Events fan out through one broadcast channel per task
//!
//! # Modules
//!
//! - `adapters`: Generative backends (Gemini, local simulation)
//! - `agents`: The standard Retriever/Analyzer/Writer stages
//! - `core`: Scheduler, pipeline, broadcaster and gateway
//! - `domain`: Data structures (Task, StreamEvent, AgentRole)
//! - `server`: HTTP and SSE routes
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Start the gateway
//! agentrelay serve --mock
//!
//! # Submit a task and follow its progress
//! agentrelay submit "renewable energy in Germany"
//! ```

pub mod adapters;
pub mod agents;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod server;

// Re-export main types at crate root for convenience
pub use config::ResolvedConfig;
pub use core::{Broadcaster, Gateway, Pipeline};
pub use domain::{AgentRole, StreamEvent, Task, TaskId};
