//! Learned error solutions.
//!
//! Every recovery attempt is recorded with its outcome and origin, and
//! candidates are ranked by success ratio with a small recency bonus so a
//! remediation that stopped working drifts down the list.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::utils::fs::atomic_write;

/// Where a solution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolutionSource {
    System,
    Ai,
    User,
}

/// A remediation with tracked outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedSolution {
    /// Substring matched against the failing command's output.
    pub pattern: String,
    pub solution: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_pattern: Option<String>,
    pub success_count: u64,
    pub failure_count: u64,
    pub source: SolutionSource,
    /// Directory the solution was learned in.
    #[serde(default)]
    pub directory: String,
    pub last_used_at: DateTime<Utc>,
}

impl LearnedSolution {
    /// Success ratio with a Laplace pseudo-failure for solutions that have
    /// never failed, so an untested one-hit wonder does not outrank a
    /// well-proven remediation.
    pub fn success_ratio(&self) -> f64 {
        let successes = self.success_count as f64;
        if self.failure_count == 0 {
            successes / (successes + 1.0)
        } else {
            successes / (successes + self.failure_count as f64)
        }
    }

    /// Ranking score: ratio plus a recency bonus that decays over the days
    /// since last use (half-life one week).
    pub fn score(&self, now: DateTime<Utc>) -> f64 {
        let days = (now - self.last_used_at).num_seconds().max(0) as f64 / 86_400.0;
        let recency_bonus = 0.05 * (0.5f64).powf(days / 7.0);
        self.success_ratio() + recency_bonus
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SolutionFile {
    #[serde(default)]
    solutions: Vec<LearnedSolution>,
}

/// Durable store of learned solutions.
pub struct LearnedSolutionStore {
    path: PathBuf,
    solutions: Vec<LearnedSolution>,
}

impl LearnedSolutionStore {
    pub fn load(path: &Path) -> Self {
        let solutions = std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str::<SolutionFile>(&text).ok())
            .map(|file| file.solutions)
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            solutions,
        }
    }

    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&SolutionFile {
            solutions: self.solutions.clone(),
        })
        .context("Failed to serialize learned solutions")?;
        atomic_write(&self.path, json.as_bytes())
    }

    pub fn solutions(&self) -> &[LearnedSolution] {
        &self.solutions
    }

    /// Record one attempt's outcome, creating the entry on first sight.
    pub fn record_outcome(
        &mut self,
        pattern: &str,
        solution: &str,
        source: SolutionSource,
        directory: &str,
        success: bool,
    ) {
        let now = Utc::now();
        if let Some(entry) = self
            .solutions
            .iter_mut()
            .find(|entry| entry.pattern == pattern && entry.solution == solution)
        {
            if success {
                entry.success_count += 1;
            } else {
                entry.failure_count += 1;
            }
            entry.last_used_at = now;
            return;
        }
        debug!(pattern, solution, "learning new solution");
        self.solutions.push(LearnedSolution {
            pattern: pattern.to_string(),
            solution: solution.to_string(),
            description: String::new(),
            file_pattern: None,
            success_count: u64::from(success),
            failure_count: u64::from(!success),
            source,
            directory: directory.to_string(),
            last_used_at: now,
        });
    }

    /// Solutions matching the error output, best score first; ties broken by
    /// absolute success count.
    pub fn ranked_for(&self, output: &str) -> Vec<&LearnedSolution> {
        let now = Utc::now();
        let mut matching: Vec<&LearnedSolution> = self
            .solutions
            .iter()
            .filter(|entry| output.contains(&entry.pattern))
            .collect();
        matching.sort_by(|a, b| {
            b.score(now)
                .partial_cmp(&a.score(now))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.success_count.cmp(&a.success_count))
        });
        matching
    }
}

/// Optional AI-suggested remediation, an external collaborator behind a
/// minimal contract.
#[async_trait::async_trait]
pub trait RemediationSuggester: Send + Sync {
    async fn suggest(&self, command: &str, error_output: &str) -> Option<String>;
}

/// Suggester for configurations with no AI backend.
pub struct NoSuggestions;

#[async_trait::async_trait]
impl RemediationSuggester for NoSuggestions {
    async fn suggest(&self, _command: &str, _error_output: &str) -> Option<String> {
        None
    }
}
