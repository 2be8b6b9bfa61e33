//! Embedding providers.
//!
//! The inference backend is an external collaborator behind a minimal
//! contract: text in, fixed-dimension vector out. A local HTTP endpoint is
//! the production implementation; a deterministic feature-hashing provider
//! keeps the memory usable offline and in tests.

use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Turns command text into a fixed-dimension vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// The dimension every returned vector has.
    fn dimension(&self) -> usize;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Client for a local generation endpoint exposing `POST /api/embeddings`
/// with `{model, prompt}` in and `{embedding}` out.
pub struct HttpEmbeddings {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl HttpEmbeddings {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            dimension,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .context("Failed to reach the embedding endpoint")?
            .error_for_status()
            .context("Embedding endpoint returned an error status")?;

        let body: EmbeddingResponse = response
            .json()
            .await
            .context("Malformed embedding response")?;

        ensure!(
            body.embedding.len() == self.dimension,
            "embedding endpoint returned dimension {} (expected {})",
            body.embedding.len(),
            self.dimension
        );
        Ok(body.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic fallback: hash token n-grams into a fixed number of
/// buckets, then L2-normalise. Similar command lines land in overlapping
/// buckets, which is enough for nearest-neighbour suggestion without a
/// model.
pub struct HashingEmbeddings {
    dimension: usize,
}

impl HashingEmbeddings {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn bucket(&self, feature: &str) -> usize {
        let digest = Sha256::digest(feature.as_bytes());
        let raw = u64::from_le_bytes(digest[..8].try_into().unwrap_or_default());
        (raw % self.dimension as u64) as usize
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];

        let tokens: Vec<&str> = text.split_whitespace().collect();
        for token in &tokens {
            vector[self.bucket(token)] += 1.0;
        }
        // Token bigrams capture argument order.
        for pair in tokens.windows(2) {
            let feature = format!("{} {}", pair[0], pair[1]);
            vector[self.bucket(&feature)] += 1.0;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for component in &mut vector {
                *component /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
