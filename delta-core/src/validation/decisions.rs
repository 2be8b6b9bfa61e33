//! Append-only log of safety decisions.
//!
//! Every command that reaches the shell has a decision record with choice
//! Proceed, Modify, or Bypass written *before* execution; denials are
//! recorded too. The log is line-delimited JSON for easy audit tooling.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::validation::risk::RiskLevel;

/// The user's (or policy's) choice for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionChoice {
    Proceed,
    Modify,
    Cancel,
    AutoDeny,
    Bypass,
}

impl DecisionChoice {
    /// Choices that permit the command to reach the shell.
    pub fn allows_execution(self) -> bool {
        matches!(self, Self::Proceed | Self::Modify | Self::Bypass)
    }
}

/// One audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    /// SHA-256 of the original command text.
    pub command_hash: String,
    pub aggregate_risk: RiskLevel,
    pub choice: DecisionChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_command: Option<String>,
}

impl DecisionRecord {
    pub fn new(command: &str, aggregate_risk: RiskLevel, choice: DecisionChoice) -> Self {
        Self {
            timestamp: Utc::now(),
            command_hash: hash_command(command),
            aggregate_risk,
            choice,
            modified_command: None,
        }
    }

    pub fn with_modified(mut self, modified: impl Into<String>) -> Self {
        self.modified_command = Some(modified.into());
        self
    }
}

/// Stable hash used to correlate decisions with memory records.
pub fn hash_command(command: &str) -> String {
    let digest = Sha256::digest(command.as_bytes());
    format!("{digest:x}")
}

/// Append-only decision log.
pub struct DecisionLog {
    log_path: PathBuf,
    writer: BufWriter<std::fs::File>,
    records_written: usize,
}

impl DecisionLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::utils::fs::ensure_dir_exists(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open decision log at {}", path.display()))?;
        Ok(Self {
            log_path: path.to_path_buf(),
            writer: BufWriter::new(file),
            records_written: 0,
        })
    }

    /// Write one record and flush; the record must be durable before the
    /// command executes.
    pub fn record(&mut self, record: &DecisionRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize decision record")?;
        writeln!(self.writer, "{json}").context("Failed to append decision record")?;
        self.writer.flush().context("Failed to flush decision log")?;
        self.records_written += 1;
        Ok(())
    }

    pub fn records_written(&self) -> usize {
        self.records_written
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Read the full history back, skipping unparsable lines.
    pub fn read_all(&self) -> Result<Vec<DecisionRecord>> {
        let file = std::fs::File::open(&self.log_path)
            .with_context(|| format!("Failed to read {}", self.log_path.display()))?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.context("Failed to read decision log line")?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(err) => tracing::warn!(%err, "skipping malformed decision record"),
            }
        }
        Ok(records)
    }

    /// Counts per choice over the whole log.
    pub fn statistics(&self) -> Result<DecisionStatistics> {
        let mut stats = DecisionStatistics::default();
        for record in self.read_all()? {
            stats.total += 1;
            match record.choice {
                DecisionChoice::Proceed => stats.proceeded += 1,
                DecisionChoice::Modify => stats.modified += 1,
                DecisionChoice::Cancel => stats.cancelled += 1,
                DecisionChoice::AutoDeny => stats.auto_denied += 1,
                DecisionChoice::Bypass => stats.bypassed += 1,
            }
        }
        Ok(stats)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DecisionStatistics {
    pub total: usize,
    pub proceeded: usize,
    pub modified: usize,
    pub cancelled: usize,
    pub auto_denied: usize,
    pub bypassed: usize,
}

impl DecisionStatistics {
    pub fn format(&self) -> String {
        format!(
            "{} decisions | {} proceeded | {} modified | {} cancelled | {} auto-denied | {} bypassed",
            self.total,
            self.proceeded,
            self.modified,
            self.cancelled,
            self.auto_denied,
            self.bypassed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn records_append_and_read_back() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("decisions.log");
        let mut log = DecisionLog::open(&path)?;

        log.record(&DecisionRecord::new(
            "rm -rf /tmp/x",
            RiskLevel::High,
            DecisionChoice::Proceed,
        ))?;
        log.record(
            &DecisionRecord::new("rm -rf /", RiskLevel::Critical, DecisionChoice::AutoDeny),
        )?;

        let records = log.read_all()?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].choice, DecisionChoice::Proceed);
        assert_eq!(records[1].choice, DecisionChoice::AutoDeny);
        assert_eq!(records[1].aggregate_risk, RiskLevel::Critical);
        Ok(())
    }

    #[test]
    fn hash_is_stable_and_hex() {
        let a = hash_command("ls -la");
        let b = hash_command("ls -la");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash_command("ls -l"));
    }

    #[test]
    fn statistics_count_choices() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("decisions.log");
        let mut log = DecisionLog::open(&path)?;

        for choice in [
            DecisionChoice::Proceed,
            DecisionChoice::Proceed,
            DecisionChoice::Cancel,
            DecisionChoice::Bypass,
        ] {
            log.record(&DecisionRecord::new("cmd", RiskLevel::Medium, choice))?;
        }

        let stats = log.statistics()?;
        assert_eq!(stats.total, 4);
        assert_eq!(stats.proceeded, 2);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.bypassed, 1);
        Ok(())
    }

    #[test]
    fn execution_allowing_choices() {
        assert!(DecisionChoice::Proceed.allows_execution());
        assert!(DecisionChoice::Modify.allows_execution());
        assert!(DecisionChoice::Bypass.allows_execution());
        assert!(!DecisionChoice::Cancel.allows_execution());
        assert!(!DecisionChoice::AutoDeny.allows_execution());
    }
}
