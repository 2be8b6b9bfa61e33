//! Append-only update history.
//!
//! Line-delimited JSON in `updates/history.log`; records are durable before
//! the engine reports a terminal state. Audit export renders CSV or plain
//! text.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Manual,
    Scheduled,
    Automatic,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Success,
    Failed,
    Partial,
}

/// One update attempt, terminal state included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    pub from_version: String,
    pub to_version: String,
    pub status: UpdateStatus,
    pub duration_ms: u64,
    pub download_time_ms: u64,
    pub install_time_ms: u64,
    pub channel: String,
    pub trigger_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub validation_results: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl UpdateRecord {
    pub fn new(
        update_type: UpdateType,
        from_version: &str,
        to_version: &str,
        channel: &str,
        trigger_method: &str,
    ) -> Self {
        Self {
            id: new_record_id(),
            timestamp: Utc::now(),
            update_type,
            from_version: from_version.to_string(),
            to_version: to_version.to_string(),
            status: UpdateStatus::Partial,
            duration_ms: 0,
            download_time_ms: 0,
            install_time_ms: 0,
            channel: channel.to_string(),
            trigger_method: trigger_method.to_string(),
            error_message: None,
            validation_results: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }
}

fn new_record_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let noise: u32 = rand::random::<u32>() % 10_000;
    format!("upd-{millis}-{noise:04}")
}

/// The append-only log file.
pub struct UpdateHistory {
    path: PathBuf,
}

impl UpdateHistory {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record; the write is flushed and synced before returning
    /// so terminal states are durable.
    pub fn append(&self, record: &UpdateRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            crate::utils::fs::ensure_dir_exists(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open update history {}", self.path.display()))?;
        let json = serde_json::to_string(record).context("Failed to serialize update record")?;
        writeln!(file, "{json}").context("Failed to append update record")?;
        file.sync_all().context("Failed to sync update history")?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<UpdateRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.context("Failed to read history line")?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(err) => tracing::warn!(%err, "skipping malformed update record"),
            }
        }
        Ok(records)
    }

    /// Render the history as CSV for audit export.
    pub fn export_csv(&self) -> Result<String> {
        let mut out = String::from(
            "id,timestamp,type,from_version,to_version,status,duration_ms,channel,trigger,error\n",
        );
        for record in self.read_all()? {
            out.push_str(&format!(
                "{},{},{:?},{},{},{:?},{},{},{},{}\n",
                record.id,
                record.timestamp.to_rfc3339(),
                record.update_type,
                record.from_version,
                record.to_version,
                record.status,
                record.duration_ms,
                record.channel,
                record.trigger_method,
                record
                    .error_message
                    .as_deref()
                    .unwrap_or("")
                    .replace(',', ";"),
            ));
        }
        Ok(out)
    }

    /// Render the history as readable text.
    pub fn export_text(&self) -> Result<String> {
        let mut out = String::new();
        for record in self.read_all()? {
            out.push_str(&format!(
                "{} {} {} -> {} [{:?}/{:?}] via {}{}\n",
                record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                record.id,
                record.from_version,
                record.to_version,
                record.update_type,
                record.status,
                record.trigger_method,
                record
                    .error_message
                    .as_deref()
                    .map(|msg| format!(" — {msg}"))
                    .unwrap_or_default(),
            ));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(status: UpdateStatus) -> UpdateRecord {
        let mut record =
            UpdateRecord::new(UpdateType::Manual, "1.0.0", "1.1.0", "stable", "cli");
        record.status = status;
        record
    }

    #[test]
    fn append_and_read_back() -> Result<()> {
        let dir = TempDir::new()?;
        let history = UpdateHistory::new(dir.path().join("history.log"));

        history.append(&record(UpdateStatus::Success))?;
        history.append(&record(UpdateStatus::Failed))?;

        let records = history.read_all()?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, UpdateStatus::Success);
        assert_eq!(records[1].status, UpdateStatus::Failed);
        Ok(())
    }

    #[test]
    fn record_ids_are_unique() {
        let a = UpdateRecord::new(UpdateType::Manual, "1.0.0", "1.1.0", "stable", "cli");
        let b = UpdateRecord::new(UpdateType::Manual, "1.0.0", "1.1.0", "stable", "cli");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn empty_history_reads_empty() -> Result<()> {
        let dir = TempDir::new()?;
        let history = UpdateHistory::new(dir.path().join("history.log"));
        assert!(history.read_all()?.is_empty());
        Ok(())
    }

    #[test]
    fn csv_export_has_header_and_rows() -> Result<()> {
        let dir = TempDir::new()?;
        let history = UpdateHistory::new(dir.path().join("history.log"));
        let mut rec = record(UpdateStatus::Failed);
        rec.error_message = Some("version mismatch, rolled back".to_string());
        history.append(&rec)?;

        let csv = history.export_csv()?;
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("id,timestamp"));
        // Commas in error messages must not break the row shape.
        assert_eq!(lines[1].split(',').count(), lines[0].split(',').count());
        Ok(())
    }

    #[test]
    fn text_export_mentions_versions() -> Result<()> {
        let dir = TempDir::new()?;
        let history = UpdateHistory::new(dir.path().join("history.log"));
        history.append(&record(UpdateStatus::Success))?;
        let text = history.export_text()?;
        assert!(text.contains("1.0.0 -> 1.1.0"));
        Ok(())
    }
}
