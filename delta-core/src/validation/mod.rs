//! Command validation and safety engine.
//!
//! A raw command line flows through the syntax checker, the obfuscation
//! decoder, the safety rule set, and the domain validators, producing an
//! immutable [`risk::ValidationResult`]. The interactive prompter then turns
//! that result into a recorded decision before anything reaches the shell.

pub mod cicd;
pub mod decisions;
pub mod engine;
pub mod git;
pub mod obfuscation;
pub mod prompter;
pub mod risk;
pub mod rules;
pub mod syntax;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use decisions::{DecisionChoice, DecisionLog, DecisionRecord};
pub use engine::ValidationEngine;
pub use prompter::{PromptVerdict, ReviewOutcome, SafetyPrompt, SafetyPrompter, TerminalPrompt};
pub use risk::{ErrorKind, Finding, RiskLevel, ValidationResult};

/// User-tunable validation policy, persisted inside `system_config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Aggregate risk at or above which the prompter denies without asking.
    pub auto_deny_level: RiskLevel,
    /// Allow bypassing prompts for commands confined to trusted paths.
    pub bypass_for_trusted_paths: bool,
    /// Filesystem prefixes below which prompts may be bypassed.
    pub trusted_paths: Vec<PathBuf>,
    /// Whether silent Low-risk approvals write a decision record.
    pub log_low_risk_approvals: bool,
    /// Budget for one validation call; past it the result is degraded.
    pub max_validation_time_ms: u64,
    /// Recursion bound for the obfuscation decoder.
    pub max_decode_depth: usize,
    /// Branches the git validator treats as protected (glob `*` suffix ok).
    pub protected_branches: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            auto_deny_level: RiskLevel::Critical,
            bypass_for_trusted_paths: false,
            trusted_paths: Vec::new(),
            log_low_risk_approvals: false,
            max_validation_time_ms: 5_000,
            max_decode_depth: 3,
            protected_branches: vec![
                "main".to_string(),
                "master".to_string(),
                "develop".to_string(),
                "release/*".to_string(),
            ],
        }
    }
}
