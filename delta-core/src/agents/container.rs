//! Multi-stage ("waterfall") container builds.
//!
//! Stages are built in dependency order computed up front; a cycle refuses
//! the whole build before anything runs. Cache hits and misses are counted
//! from known tokens in the build output and folded into a build cache with
//! a max age.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agents::{AgentError, ContainerConfig};
use crate::utils::fs::atomic_write;

/// Multi-stage build specification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WaterfallSpec {
    /// Stage names, in declaration order.
    pub stages: Vec<String>,
    /// stage -> stages it depends on.
    #[serde(default)]
    pub dependencies: HashMap<String, Vec<String>>,
}

/// Topological order over the declared stages. Declaration order is kept
/// among stages whose dependencies are already satisfied. Cycles and
/// references to undeclared stages refuse the build.
pub fn build_order(spec: &WaterfallSpec) -> Result<Vec<String>, AgentError> {
    for (stage, deps) in &spec.dependencies {
        if !spec.stages.contains(stage) {
            return Err(AgentError::UnknownStage(stage.clone()));
        }
        for dep in deps {
            if !spec.stages.contains(dep) {
                return Err(AgentError::UnknownStage(dep.clone()));
            }
        }
    }

    let mut order = Vec::with_capacity(spec.stages.len());
    let mut placed: Vec<&str> = Vec::new();
    let mut remaining: Vec<&String> = spec.stages.iter().collect();

    while !remaining.is_empty() {
        let ready_idx = remaining.iter().position(|stage| {
            spec.dependencies
                .get(*stage)
                .map(|deps| deps.iter().all(|dep| placed.contains(&dep.as_str())))
                .unwrap_or(true)
        });
        match ready_idx {
            Some(idx) => {
                let stage = remaining.remove(idx);
                placed.push(stage.as_str());
                order.push(stage.clone());
            }
            // Nothing is ready but stages remain: a cycle.
            None => return Err(AgentError::CycleDetected(remaining[0].clone())),
        }
    }
    Ok(order)
}

/// Emit a compose file for the waterfall: one service per stage, sharing the
/// agent's build context.
pub fn generate_compose(config: &ContainerConfig, spec: &WaterfallSpec) -> Result<String> {
    #[derive(Serialize)]
    struct ComposeBuild<'a> {
        context: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        dockerfile: Option<String>,
        target: &'a str,
        #[serde(skip_serializing_if = "HashMap::is_empty")]
        args: HashMap<String, String>,
    }

    #[derive(Serialize)]
    struct ComposeService<'a> {
        image: String,
        build: ComposeBuild<'a>,
        #[serde(skip_serializing_if = "HashMap::is_empty")]
        environment: HashMap<String, String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        depends_on: Vec<String>,
    }

    #[derive(Serialize)]
    struct ComposeFile<'a> {
        services: IndexMap<&'a str, ComposeService<'a>>,
    }

    let context = config
        .build_context
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| ".".to_string());

    let mut services = IndexMap::new();
    for stage in &spec.stages {
        services.insert(
            stage.as_str(),
            ComposeService {
                image: format!("{}-{}:{}", config.image, stage, config.tag),
                build: ComposeBuild {
                    context: context.clone(),
                    dockerfile: config
                        .containerfile
                        .as_ref()
                        .map(|path| path.display().to_string()),
                    target: stage,
                    args: config.build_args.clone(),
                },
                environment: config.env.clone(),
                depends_on: spec.dependencies.get(stage).cloned().unwrap_or_default(),
            },
        );
    }

    serde_yaml::to_string(&ComposeFile { services }).context("Failed to render compose file")
}

/// Tokens the build output is scanned for when counting cache activity.
const CACHE_HIT_TOKENS: &[&str] = &["Using cache", "CACHED"];
const CACHE_MISS_TOKENS: &[&str] = &["Running in", "exporting layers"];

/// Count cache hits and misses from raw build output.
pub fn count_cache_tokens(output: &str) -> (u64, u64) {
    let mut hits = 0;
    let mut misses = 0;
    for line in output.lines() {
        if CACHE_HIT_TOKENS.iter().any(|token| line.contains(token)) {
            hits += 1;
        } else if CACHE_MISS_TOKENS.iter().any(|token| line.contains(token)) {
            misses += 1;
        }
    }
    (hits, misses)
}

/// Per-waterfall cache bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildCacheEntry {
    pub name: String,
    pub stages: Vec<String>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub last_built_at: DateTime<Utc>,
    pub size: u64,
}

/// On-disk aggregate of build cache entries.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DockerBuildCache {
    #[serde(default)]
    pub entries: HashMap<String, BuildCacheEntry>,
    /// Entries older than this are dropped on load.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

fn default_max_age_secs() -> u64 {
    7 * 86_400
}

impl DockerBuildCache {
    pub fn load(path: &Path) -> Self {
        let mut cache: Self = std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        let cutoff = Utc::now() - chrono::Duration::seconds(cache.max_age_secs as i64);
        let before = cache.entries.len();
        cache.entries.retain(|_, entry| entry.last_built_at > cutoff);
        if cache.entries.len() != before {
            debug!(
                dropped = before - cache.entries.len(),
                "expired build cache entries dropped"
            );
        }
        cache
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize build cache")?;
        atomic_write(path, json.as_bytes())
    }

    /// Fold one build's counters into the named entry.
    pub fn record_build(&mut self, name: &str, stages: &[String], hits: u64, misses: u64) {
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| BuildCacheEntry {
                name: name.to_string(),
                stages: stages.to_vec(),
                cache_hits: 0,
                cache_misses: 0,
                last_built_at: Utc::now(),
                size: 0,
            });
        entry.stages = stages.to_vec();
        entry.cache_hits += hits;
        entry.cache_misses += misses;
        entry.last_built_at = Utc::now();
    }
}
