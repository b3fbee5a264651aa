//! Execution mode for task dispatch.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How the pipeline treats tasks that have no registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Unregistered tasks fail with `UnregisteredTask`
    #[default]
    Strict,

    /// Unregistered tasks return a result explicitly flagged as simulated
    Simulated,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Strict => write!(f, "strict"),
            ExecutionMode::Simulated => write!(f, "simulated"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(ExecutionMode::Strict),
            "simulated" | "simulation" => Ok(ExecutionMode::Simulated),
            other => Err(format!("Unknown execution mode: {}", other)),
        }
    }
}
