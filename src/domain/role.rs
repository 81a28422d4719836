//! Agent roles in the fixed retrieve → analyze → write chain.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The role an agent plays in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Gathers the raw material (pure local transform)
    Retriever,

    /// Extracts key trends from retrieved material
    Analyzer,

    /// Drafts the final executive report
    Writer,
}

impl AgentRole {
    /// Display name used in logs and failure markers
    pub fn name(&self) -> &'static str {
        match self {
            Self::Retriever => "Retriever",
            Self::Analyzer => "Analyzer",
            Self::Writer => "Writer",
        }
    }

    /// Progress line published when this stage starts
    pub fn status_message(&self) -> &'static str {
        match self {
            Self::Retriever => "Retriever: Searching for information...",
            Self::Analyzer => "Analyzer: Reading data...",
            Self::Writer => "Writer: Drafting final report...",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
