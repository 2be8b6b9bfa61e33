//! Vector-backed command memory.
//!
//! Every executed command is recorded with its embedding, directory, exit
//! code, and usage statistics, then served back through similarity search
//! for AI-assisted suggestion.

pub mod embedding;
pub mod metric;
pub mod store;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use embedding::{EmbeddingProvider, HashingEmbeddings, HttpEmbeddings};
pub use metric::SimilarityMetric;
pub use store::{CommandRecord, ImportStrategy, SearchHit, StoreStats, VectorMemoryStore};

/// Memory subsystem configuration, persisted inside `system_config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Embedding dimension; part of the schema, changing it requires rebuild.
    pub dimension: usize,
    pub metric: SimilarityMetric,
    /// Unindexed inserts tolerated before the in-memory index rebuilds.
    pub index_build_interval: u64,
    /// Seconds after which the index rebuilds regardless of insert count.
    pub index_max_age_secs: u64,
    /// Base URL of the local embedding endpoint.
    pub endpoint: String,
    /// Embedding model identifier (overridable via `DELTA_AI_MODEL`).
    pub model: String,
    /// Use the HTTP endpoint instead of the offline hashing embedder.
    pub prefer_endpoint: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            metric: SimilarityMetric::Cosine,
            index_build_interval: 128,
            index_max_age_secs: 3_600,
            endpoint: "http://127.0.0.1:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            prefer_endpoint: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("embedding dimension {actual} does not match store dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("memory store is corrupt: {0}")]
    Corrupt(String),
    #[error("memory store is in degraded read-only mode")]
    ReadOnly,
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
