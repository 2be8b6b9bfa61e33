//! Persistent command-embedding store on an embedded SQL database.
//!
//! One `command_embeddings` table keyed on `command_id` with a byte-packed
//! f32 embedding column. Similarity search runs over an in-memory index
//! rebuilt on a staging copy and swapped in atomically; when the index is
//! stale the store falls back to a full table scan pre-filtered by the
//! optional directory substring, which is correctness-preserving, only
//! slower.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::memory::metric::SimilarityMetric;
use crate::memory::MemoryError;
use crate::validation::decisions::hash_command;

/// One stored command with its usage statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRecord {
    pub command_id: String,
    pub command: String,
    pub directory: String,
    pub timestamp: DateTime<Utc>,
    pub exit_code: i32,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub frequency: u64,
    pub last_used: DateTime<Utc>,
    pub success_rate: f64,
}

impl CommandRecord {
    pub fn new(
        command: impl Into<String>,
        directory: impl Into<String>,
        exit_code: i32,
        embedding: Vec<f32>,
    ) -> Self {
        let command = command.into();
        let now = Utc::now();
        Self {
            command_id: hash_command(&command),
            command,
            directory: directory.into(),
            timestamp: now,
            exit_code,
            embedding,
            metadata: serde_json::Value::Object(Default::default()),
            frequency: 1,
            last_used: now,
            success_rate: if exit_code == 0 { 1.0 } else { 0.0 },
        }
    }
}

/// A search result with its similarity score.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: CommandRecord,
    pub score: f32,
}

/// How `import` reconciles incoming records with existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStrategy {
    /// Drop the current contents and take the snapshot wholesale.
    Replace,
    /// Sum frequencies, take the max last_used, average success rates.
    Merge,
    /// Keep whichever record was used more recently.
    KeepNewer,
}

#[derive(Debug, Clone)]
pub struct StoreStats {
    pub record_count: u64,
    pub disk_size_bytes: u64,
    pub last_index_build: Option<DateTime<Utc>>,
    pub unindexed_inserts: u64,
    pub dimension: usize,
    pub metric: SimilarityMetric,
}

/// Snapshot file shape for export/import.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    dimension: usize,
    records: Vec<CommandRecord>,
}

struct IndexEntry {
    command_id: String,
    directory: String,
    embedding: Vec<f32>,
}

#[derive(Default)]
struct MemoryIndex {
    entries: Vec<IndexEntry>,
    built_at: Option<(Instant, DateTime<Utc>)>,
}

pub struct VectorMemoryStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    dimension: usize,
    metric: SimilarityMetric,
    index_build_interval: u64,
    index_max_age_secs: u64,
    index: RwLock<MemoryIndex>,
    unindexed_inserts: Mutex<u64>,
    read_only: bool,
}

impl VectorMemoryStore {
    /// Open (or create) the store at `path` with the configured dimension.
    /// A dimension recorded in an existing database must match; changing it
    /// is an administrative rebuild.
    pub fn open(
        path: &Path,
        dimension: usize,
        metric: SimilarityMetric,
        index_build_interval: u64,
        index_max_age_secs: u64,
    ) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;

        let stored_dimension: Option<String> = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'dimension'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored_dimension {
            Some(value) => {
                let stored: usize = value
                    .parse()
                    .map_err(|_| MemoryError::Corrupt(format!("bad dimension meta '{value}'")))?;
                if stored != dimension {
                    return Err(MemoryError::DimensionMismatch {
                        expected: stored,
                        actual: dimension,
                    });
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO store_meta (key, value) VALUES ('dimension', ?1)",
                    params![dimension.to_string()],
                )?;
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
            dimension,
            metric,
            index_build_interval,
            index_max_age_secs,
            index: RwLock::new(MemoryIndex::default()),
            unindexed_inserts: Mutex::new(0),
            read_only: false,
        })
    }

    /// Open in degraded read-only mode after a corruption event. Searches
    /// fail soft (empty results); writes return [`MemoryError::ReadOnly`].
    pub fn mark_read_only(&mut self) {
        warn!("memory store entering degraded read-only mode");
        self.read_only = true;
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn init_schema(conn: &Connection) -> Result<(), MemoryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS command_embeddings (
                command_id   TEXT PRIMARY KEY,
                command      TEXT NOT NULL,
                directory    TEXT NOT NULL,
                timestamp    TEXT NOT NULL,
                exit_code    INTEGER NOT NULL,
                embedding    BLOB NOT NULL,
                metadata     TEXT NOT NULL DEFAULT '{}',
                frequency    INTEGER NOT NULL DEFAULT 1,
                last_used    TEXT NOT NULL,
                success_rate REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_embeddings_directory
                ON command_embeddings(directory);
            CREATE TABLE IF NOT EXISTS store_meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<(), MemoryError> {
        if embedding.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        Ok(())
    }

    /// Insert a new record or fold a repeat execution into the existing one:
    /// frequency increments, last_used advances, and the success rate takes
    /// a running average with the new exit-code sample.
    pub fn upsert(&self, record: &CommandRecord) -> Result<(), MemoryError> {
        if self.read_only {
            return Err(MemoryError::ReadOnly);
        }
        self.check_dimension(&record.embedding)?;

        let conn = self.conn.lock();
        let existing: Option<(u64, f64)> = conn
            .query_row(
                "SELECT frequency, success_rate FROM command_embeddings WHERE command_id = ?1",
                params![record.command_id],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get(1)?)),
            )
            .optional()?;

        match existing {
            Some((frequency, success_rate)) => {
                let sample = if record.exit_code == 0 { 1.0 } else { 0.0 };
                let new_frequency = frequency + 1;
                let new_rate =
                    (success_rate * frequency as f64 + sample) / new_frequency as f64;
                conn.execute(
                    "UPDATE command_embeddings
                     SET frequency = ?2, success_rate = ?3, last_used = ?4,
                         exit_code = ?5, directory = ?6
                     WHERE command_id = ?1",
                    params![
                        record.command_id,
                        new_frequency as i64,
                        new_rate,
                        record.last_used.to_rfc3339(),
                        record.exit_code,
                        record.directory,
                    ],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO command_embeddings
                     (command_id, command, directory, timestamp, exit_code,
                      embedding, metadata, frequency, last_used, success_rate)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        record.command_id,
                        record.command,
                        record.directory,
                        record.timestamp.to_rfc3339(),
                        record.exit_code,
                        pack_embedding(&record.embedding),
                        serde_json::to_string(&record.metadata)?,
                        record.frequency.max(1) as i64,
                        record.last_used.to_rfc3339(),
                        record.success_rate.clamp(0.0, 1.0),
                    ],
                )?;
            }
        }
        drop(conn);

        *self.unindexed_inserts.lock() += 1;
        Ok(())
    }

    pub fn get(&self, command_id: &str) -> Result<Option<CommandRecord>, MemoryError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT command_id, command, directory, timestamp, exit_code,
                        embedding, metadata, frequency, last_used, success_rate
                 FROM command_embeddings WHERE command_id = ?1",
                params![command_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Top-k records ranked by the configured metric, optionally pre-filtered
    /// to directories containing `context`. Rank ties keep first-seen
    /// (insertion) order.
    pub fn search(
        &self,
        query: &[f32],
        context: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        self.check_dimension(query)?;

        // Fast path: the in-memory index, when fresh.
        if self.index_is_fresh() {
            let index = self.index.read();
            let mut hits: Vec<(String, f32)> = index
                .entries
                .iter()
                .filter(|entry| {
                    context
                        .map(|needle| entry.directory.contains(needle))
                        .unwrap_or(true)
                })
                .map(|entry| {
                    (
                        entry.command_id.clone(),
                        self.metric.score(query, &entry.embedding),
                    )
                })
                .collect();
            // Stable sort keeps first-seen order for equal scores.
            hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            hits.truncate(limit);

            let mut results = Vec::with_capacity(hits.len());
            for (command_id, score) in hits {
                if let Some(record) = self.get(&command_id)? {
                    results.push(SearchHit { record, score });
                }
            }
            return Ok(results);
        }

        // Fallback: scan the table in rowid order.
        debug!("memory index stale; scanning table");
        let records = self.scan(context)?;
        let mut hits: Vec<SearchHit> = records
            .into_iter()
            .map(|record| {
                let score = self.metric.score(query, &record.embedding);
                SearchHit { record, score }
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    fn scan(&self, context: Option<&str>) -> Result<Vec<CommandRecord>, MemoryError> {
        let conn = self.conn.lock();
        let mut records = Vec::new();
        match context {
            Some(needle) => {
                let mut stmt = conn.prepare(
                    "SELECT command_id, command, directory, timestamp, exit_code,
                            embedding, metadata, frequency, last_used, success_rate
                     FROM command_embeddings
                     WHERE directory LIKE '%' || ?1 || '%'
                     ORDER BY rowid",
                )?;
                let rows = stmt.query_map(params![needle], row_to_record)?;
                for row in rows {
                    records.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT command_id, command, directory, timestamp, exit_code,
                            embedding, metadata, frequency, last_used, success_rate
                     FROM command_embeddings ORDER BY rowid",
                )?;
                let rows = stmt.query_map([], row_to_record)?;
                for row in rows {
                    records.push(row?);
                }
            }
        }
        Ok(records)
    }

    fn index_is_fresh(&self) -> bool {
        let index = self.index.read();
        let Some((built_instant, _)) = index.built_at else {
            return false;
        };
        if built_instant.elapsed().as_secs() > self.index_max_age_secs {
            return false;
        }
        *self.unindexed_inserts.lock() < self.index_build_interval
    }

    /// Whether accumulated inserts or elapsed time call for a rebuild.
    pub fn index_rebuild_due(&self) -> bool {
        !self.index_is_fresh()
    }

    /// Rebuild the in-memory index from the table. The new index is staged
    /// off to the side and swapped in atomically from readers' perspective.
    pub fn rebuild_index(&self) -> Result<usize, MemoryError> {
        let records = self.scan(None)?;
        let staged: Vec<IndexEntry> = records
            .into_iter()
            .map(|record| IndexEntry {
                command_id: record.command_id,
                directory: record.directory,
                embedding: record.embedding,
            })
            .collect();
        let count = staged.len();

        let mut index = self.index.write();
        index.entries = staged;
        index.built_at = Some((Instant::now(), Utc::now()));
        drop(index);

        *self.unindexed_inserts.lock() = 0;
        info!(count, "memory index rebuilt");
        Ok(count)
    }

    /// Full snapshot out, as length-prefixed JSON.
    pub fn export(&self, path: &Path) -> Result<u64, MemoryError> {
        let records = self.scan(None)?;
        let count = records.len() as u64;
        let snapshot = Snapshot {
            dimension: self.dimension,
            records,
        };
        let json = serde_json::to_vec(&snapshot)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(&(json.len() as u64).to_le_bytes())?;
        file.write_all(&json)?;
        file.sync_all()?;
        Ok(count)
    }

    /// Snapshot in, reconciled per the strategy.
    pub fn import(&self, path: &Path, strategy: ImportStrategy) -> Result<u64, MemoryError> {
        if self.read_only {
            return Err(MemoryError::ReadOnly);
        }

        let mut file = fs::File::open(path)?;
        let mut prefix = [0u8; 8];
        file.read_exact(&mut prefix)?;
        let length = u64::from_le_bytes(prefix) as usize;
        let mut json = vec![0u8; length];
        file.read_exact(&mut json)?;

        let snapshot: Snapshot = serde_json::from_slice(&json)?;
        if snapshot.dimension != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                actual: snapshot.dimension,
            });
        }

        if strategy == ImportStrategy::Replace {
            self.conn.lock().execute("DELETE FROM command_embeddings", [])?;
        }

        let mut imported = 0u64;
        for incoming in snapshot.records {
            self.check_dimension(&incoming.embedding)?;
            let existing = self.get(&incoming.command_id)?;
            let resolved = match (existing, strategy) {
                (None, _) | (Some(_), ImportStrategy::Replace) => incoming,
                (Some(current), ImportStrategy::Merge) => merge_records(current, incoming),
                (Some(current), ImportStrategy::KeepNewer) => {
                    if incoming.last_used > current.last_used {
                        incoming
                    } else {
                        current
                    }
                }
            };
            self.write_record(&resolved)?;
            imported += 1;
        }

        *self.unindexed_inserts.lock() += imported;
        Ok(imported)
    }

    /// Write a record verbatim (no merge arithmetic); used by import.
    fn write_record(&self, record: &CommandRecord) -> Result<(), MemoryError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO command_embeddings
             (command_id, command, directory, timestamp, exit_code,
              embedding, metadata, frequency, last_used, success_rate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.command_id,
                record.command,
                record.directory,
                record.timestamp.to_rfc3339(),
                record.exit_code,
                pack_embedding(&record.embedding),
                serde_json::to_string(&record.metadata)?,
                record.frequency.max(1) as i64,
                record.last_used.to_rfc3339(),
                record.success_rate.clamp(0.0, 1.0),
            ],
        )?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats, MemoryError> {
        let record_count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM command_embeddings", [], |row| {
                row.get(0)
            })?;
        let disk_size_bytes = fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0);
        let last_index_build = self.index.read().built_at.map(|(_, at)| at);
        Ok(StoreStats {
            record_count: record_count as u64,
            disk_size_bytes,
            last_index_build,
            unindexed_inserts: *self.unindexed_inserts.lock(),
            dimension: self.dimension,
            metric: self.metric,
        })
    }
}

fn merge_records(current: CommandRecord, incoming: CommandRecord) -> CommandRecord {
    CommandRecord {
        frequency: current.frequency + incoming.frequency,
        last_used: current.last_used.max(incoming.last_used),
        success_rate: (current.success_rate + incoming.success_rate) / 2.0,
        ..current
    }
}

fn pack_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn unpack_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommandRecord> {
    let timestamp: String = row.get(3)?;
    let metadata: String = row.get(6)?;
    let last_used: String = row.get(8)?;
    let blob: Vec<u8> = row.get(5)?;
    Ok(CommandRecord {
        command_id: row.get(0)?,
        command: row.get(1)?,
        directory: row.get(2)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        exit_code: row.get(4)?,
        embedding: unpack_embedding(&blob),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        frequency: row.get::<_, i64>(7)? as u64,
        last_used: DateTime::parse_from_rfc3339(&last_used)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        success_rate: row.get(9)?,
    })
}
