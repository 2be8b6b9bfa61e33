//! Declarative task agents.
//!
//! Agents are data: an ordered list of commands with pattern-based success
//! and error detection, optional container execution, and an error-recovery
//! loop that learns which remediations work.

pub mod container;
pub mod patterns;
pub mod recovery;
pub mod registry;
pub mod runner;

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use container::{BuildCacheEntry, DockerBuildCache, WaterfallSpec};
pub use patterns::{ErrorSolution, PatternLibrary};
pub use recovery::{LearnedSolution, LearnedSolutionStore, SolutionSource};
pub use registry::AgentRegistry;
pub use runner::{AgentRunResult, AgentRunner, ExecutionBackend, RunOptions, ShellBackend};

fn default_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_tag() -> String {
    "latest".to_string()
}

/// One command inside an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentCommand {
    pub command: String,
    pub working_dir: Option<PathBuf>,
    /// Informational patterns expected somewhere in the output.
    pub expected_patterns: Vec<String>,
    /// Patterns that mark the command as failed and trigger recovery.
    pub error_patterns: Vec<String>,
    /// Patterns that confirm success (informational).
    pub success_patterns: Vec<String>,
    pub timeout_secs: u64,
    pub retry_count: u32,
    pub retry_delay_secs: u64,
    pub interactive: bool,
    pub env: HashMap<String, String>,
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self {
            command: String::new(),
            working_dir: None,
            expected_patterns: Vec::new(),
            error_patterns: Vec::new(),
            success_patterns: Vec::new(),
            timeout_secs: default_timeout_secs(),
            retry_count: 0,
            retry_delay_secs: 1,
            interactive: false,
            env: HashMap::new(),
        }
    }
}

impl AgentCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }
}

/// Container execution settings for an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerConfig {
    pub image: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    pub build_context: Option<PathBuf>,
    pub containerfile: Option<PathBuf>,
    pub volumes: Vec<String>,
    pub networks: Vec<String>,
    pub env: HashMap<String, String>,
    pub build_args: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    /// Multi-stage build specification.
    pub waterfall: Option<WaterfallSpec>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            tag: default_tag(),
            build_context: None,
            containerfile: None,
            volumes: Vec::new(),
            networks: Vec::new(),
            env: HashMap::new(),
            build_args: HashMap::new(),
            use_cache: true,
            waterfall: None,
        }
    }
}

/// A declarative task agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub description: String,
    pub task_types: Vec<String>,
    pub commands: Vec<AgentCommand>,
    pub container: Option<ContainerConfig>,
    /// Input patterns that suggest this agent.
    pub trigger_patterns: Vec<String>,
    /// Variables available to placeholder resolution.
    pub context: HashMap<String, String>,
    pub tags: Vec<String>,
    pub enabled: bool,
    pub run_count: u64,
    pub success_rate: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Default for Agent {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: String::new(),
            description: String::new(),
            task_types: Vec::new(),
            commands: Vec::new(),
            container: None,
            trigger_patterns: Vec::new(),
            context: HashMap::new(),
            tags: Vec::new(),
            enabled: true,
            run_count: 0,
            success_rate: 0.0,
            created_at: now,
            updated_at: now,
            last_run_at: None,
        }
    }
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Fold one run outcome into the aggregates (running average).
    pub fn record_run(&mut self, success: bool) {
        let sample = if success { 1.0 } else { 0.0 };
        let runs = self.run_count as f64;
        self.success_rate = (self.success_rate * runs + sample) / (runs + 1.0);
        self.run_count += 1;
        self.last_run_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }
}

/// Orchestrator-level settings, persisted inside `system_config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Whether agents declaring a container actually run inside one.
    pub container_enabled: bool,
    pub container_runtime: String,
    /// Worker-pool width; agents touch shared filesystems, so default 1.
    pub max_concurrent: usize,
    /// Run results retained per agent.
    pub result_buffer: usize,
    /// Reject unknown top-level keys in agent declaration files.
    pub strict_yaml: bool,
    /// How many recovery candidates to try per failed command.
    pub max_recovery_attempts: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            container_enabled: false,
            container_runtime: "docker".to_string(),
            max_concurrent: 1,
            result_buffer: 20,
            strict_yaml: false,
            max_recovery_attempts: 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent '{0}' not found")]
    NotFound(String),

    #[error("agent '{0}' is disabled")]
    Disabled(String),

    #[error("agent '{0}' is already running")]
    AlreadyRunning(String),

    #[error("dependency cycle involving stage '{0}'")]
    CycleDetected(String),

    #[error("unknown stage '{0}' in dependency map")]
    UnknownStage(String),

    #[error("command '{command}' failed with exit code {exit_code}")]
    CommandFailed { command: String, exit_code: i32 },

    #[error("malformed agent declaration: {0}")]
    Declaration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_run_keeps_a_running_average() {
        let mut agent = Agent::new("a1", "builder");
        agent.record_run(true);
        assert_eq!(agent.run_count, 1);
        assert!((agent.success_rate - 1.0).abs() < 1e-9);

        agent.record_run(false);
        assert_eq!(agent.run_count, 2);
        assert!((agent.success_rate - 0.5).abs() < 1e-9);

        agent.record_run(true);
        assert!((agent.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(agent.last_run_at.is_some());
    }

    #[test]
    fn agent_command_defaults_are_sane() {
        let command = AgentCommand::new("make build");
        assert_eq!(command.timeout_secs, 300);
        assert_eq!(command.retry_count, 0);
        assert!(!command.interactive);
    }

    #[test]
    fn agent_serializes_round_trip() {
        let mut agent = Agent::new("a1", "builder");
        agent.commands.push(AgentCommand::new("cargo build"));
        agent.container = Some(ContainerConfig {
            image: "rust".to_string(),
            ..ContainerConfig::default()
        });

        let json = serde_json::to_string(&agent).unwrap();
        let parsed: Agent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "a1");
        assert_eq!(parsed.commands.len(), 1);
        assert_eq!(parsed.container.as_ref().unwrap().tag, "latest");
    }
}
