//! Agent storage and discovery.
//!
//! Agents live as one JSON file per id under `agents/agents/`. Repositories
//! can also declare agents in a YAML file at a well-known path; declaration
//! files may `import:` further files relative to themselves.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::agents::{Agent, AgentCommand, AgentError, ContainerConfig};
use crate::utils::fs::{atomic_write, ensure_dir_exists};

/// Well-known declaration file locations, checked in order.
const DECLARATION_PATHS: &[&str] = &[
    ".delta/agents.yml",
    ".delta/agents.yaml",
    "delta-agents.yml",
];

/// Import chains deeper than this are rejected.
const MAX_IMPORT_DEPTH: usize = 4;

/// Top-level shape of an agent declaration file (v1.0).
#[derive(Debug, Default, Deserialize)]
struct DeclarationFile {
    version: String,
    #[serde(default)]
    #[allow(dead_code)]
    project: Option<String>,
    #[serde(default)]
    settings: Option<DeclarationSettings>,
    #[serde(default)]
    agents: Vec<DeclaredAgent>,
    #[serde(default)]
    import: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct DeclarationSettings {
    #[serde(default)]
    container: Option<ContainerConfig>,
    #[serde(default)]
    error_patterns: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DeclaredAgent {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    task_types: Vec<String>,
    commands: Vec<DeclaredCommand>,
    #[serde(default)]
    container: Option<ContainerConfig>,
    #[serde(default)]
    trigger_patterns: Vec<String>,
    #[serde(default)]
    context: std::collections::HashMap<String, String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Commands may be a bare string or the full shape.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeclaredCommand {
    Bare(String),
    Full(AgentCommand),
}

impl From<DeclaredCommand> for AgentCommand {
    fn from(declared: DeclaredCommand) -> Self {
        match declared {
            DeclaredCommand::Bare(command) => AgentCommand::new(command),
            DeclaredCommand::Full(command) => command,
        }
    }
}

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &["version", "project", "settings", "agents", "import"];

pub struct AgentRegistry {
    store_dir: PathBuf,
    agents: RwLock<IndexMap<String, Agent>>,
    strict_yaml: bool,
}

impl AgentRegistry {
    /// Load every stored agent from `agents/agents/`.
    pub fn open(store_dir: &Path, strict_yaml: bool) -> Result<Self> {
        ensure_dir_exists(store_dir)?;
        let mut agents = IndexMap::new();

        let mut paths: Vec<PathBuf> = std::fs::read_dir(store_dir)
            .with_context(|| format!("Failed to list {}", store_dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            match Self::read_agent(&path) {
                Ok(agent) => {
                    agents.insert(agent.id.clone(), agent);
                }
                Err(err) => warn!(path = %path.display(), %err, "skipping unreadable agent"),
            }
        }

        info!(count = agents.len(), "agents loaded");
        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            agents: RwLock::new(agents),
            strict_yaml,
        })
    }

    fn read_agent(path: &Path) -> Result<Agent> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Malformed agent {}", path.display()))
    }

    fn agent_path(&self, id: &str) -> PathBuf {
        self.store_dir.join(format!("{id}.json"))
    }

    pub fn list(&self) -> Vec<Agent> {
        self.agents.read().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Agent> {
        self.agents.read().get(id).cloned()
    }

    /// Create or replace an agent and persist it.
    pub fn save(&self, mut agent: Agent) -> Result<()> {
        agent.updated_at = Utc::now();
        let json = serde_json::to_string_pretty(&agent).context("Failed to serialize agent")?;
        atomic_write(&self.agent_path(&agent.id), json.as_bytes())?;
        self.agents.write().insert(agent.id.clone(), agent);
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<bool, AgentError> {
        let removed = self.agents.write().shift_remove(id).is_some();
        if removed {
            let path = self.agent_path(id);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(removed)
    }

    /// Fold one run outcome into the stored aggregates.
    pub fn record_run(&self, id: &str, success: bool) -> Result<()> {
        let updated = {
            let mut agents = self.agents.write();
            let Some(agent) = agents.get_mut(id) else {
                return Err(AgentError::NotFound(id.to_string()).into());
            };
            agent.record_run(success);
            agent.clone()
        };
        self.save(updated)
    }

    /// Agents whose trigger patterns match the input line.
    pub fn matching_triggers(&self, line: &str) -> Vec<Agent> {
        self.agents
            .read()
            .values()
            .filter(|agent| agent.enabled)
            .filter(|agent| {
                agent
                    .trigger_patterns
                    .iter()
                    .any(|pattern| line.contains(pattern.as_str()))
            })
            .cloned()
            .collect()
    }

    /// Locate and parse a declaration file in `repo_root`, registering every
    /// agent it (and its imports) declares. Returns the registered ids.
    pub fn discover_from_repository(&self, repo_root: &Path) -> Result<Vec<String>> {
        let Some(declaration) = DECLARATION_PATHS
            .iter()
            .map(|relative| repo_root.join(relative))
            .find(|path| path.exists())
        else {
            return Ok(Vec::new());
        };
        debug!(path = %declaration.display(), "found agent declaration file");

        let mut visited = HashSet::new();
        let agents = self.parse_declaration(&declaration, 0, &mut visited)?;
        let mut ids = Vec::with_capacity(agents.len());
        for agent in agents {
            ids.push(agent.id.clone());
            self.save(agent)?;
        }
        Ok(ids)
    }

    fn parse_declaration(
        &self,
        path: &Path,
        depth: usize,
        visited: &mut HashSet<PathBuf>,
    ) -> Result<Vec<Agent>> {
        if depth > MAX_IMPORT_DEPTH {
            anyhow::bail!("agent imports nested deeper than {MAX_IMPORT_DEPTH}");
        }
        let canonical = path
            .canonicalize()
            .with_context(|| format!("Cannot resolve {}", path.display()))?;
        if !visited.insert(canonical) {
            anyhow::bail!("agent import cycle through {}", path.display());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        if self.strict_yaml {
            reject_unknown_keys(&text, path)?;
        }

        let file: DeclarationFile = serde_yaml::from_str(&text)
            .with_context(|| format!("Malformed agent declaration {}", path.display()))?;
        if !file.version.starts_with("1.") {
            anyhow::bail!(
                "unsupported declaration version '{}' in {}",
                file.version,
                path.display()
            );
        }

        let defaults = file.settings.unwrap_or_default();
        let mut agents: Vec<Agent> = file
            .agents
            .into_iter()
            .map(|declared| materialize(declared, &defaults))
            .collect();

        // Imports resolve relative to the declaring file.
        if let Some(import) = file.import {
            let base = path.parent().unwrap_or(Path::new("."));
            let imported = self.parse_declaration(&base.join(import), depth + 1, visited)?;
            agents.extend(imported);
        }
        Ok(agents)
    }
}

fn materialize(declared: DeclaredAgent, defaults: &DeclarationSettings) -> Agent {
    let name = declared.name.unwrap_or_else(|| declared.id.clone());
    let mut agent = Agent::new(declared.id, name);
    agent.description = declared.description;
    agent.task_types = declared.task_types;
    agent.commands = declared.commands.into_iter().map(Into::into).collect();
    agent.container = declared.container.or_else(|| defaults.container.clone());
    agent.trigger_patterns = declared.trigger_patterns;
    agent.context = declared.context;
    agent.tags = declared.tags;
    agent.enabled = declared.enabled;
    // Declaration-level error patterns apply to commands with none of their own.
    if !defaults.error_patterns.is_empty() {
        for command in &mut agent.commands {
            if command.error_patterns.is_empty() {
                command.error_patterns = defaults.error_patterns.clone();
            }
        }
    }
    agent
}

/// Strict mode: unknown top-level keys are declaration errors.
fn reject_unknown_keys(text: &str, path: &Path) -> Result<()> {
    let value: serde_yaml::Value = serde_yaml::from_str(text)
        .with_context(|| format!("Malformed agent declaration {}", path.display()))?;
    if let serde_yaml::Value::Mapping(map) = value {
        for key in map.keys() {
            if let serde_yaml::Value::String(key) = key {
                if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
                    anyhow::bail!(
                        "unknown top-level key '{}' in {} (strict mode)",
                        key,
                        path.display()
                    );
                }
            }
        }
    }
    Ok(())
}
