//! Top-level `system_config.json`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::agents::AgentSettings;
use crate::config::{ENV_AI_MODEL, ENV_LOCALE};
use crate::memory::MemoryConfig;
use crate::utils::fs::{atomic_write, read_file_with_context};
use crate::validation::ValidationConfig;

/// Everything the interactive session needs, composed from the subsystem
/// configs. Unknown fields are preserved-by-default serde behaviour: they
/// are dropped on rewrite, which is acceptable for a user-owned file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SystemConfig {
    /// Shell override; `$SHELL` wins at runtime when unset.
    pub shell: Option<String>,
    /// BCP-47 locale code (`DELTA_LOCALE` overrides).
    pub locale: Option<String>,
    /// AI generation model identifier (`DELTA_AI_MODEL` overrides).
    pub ai_model: Option<String>,
    pub validation: ValidationConfig,
    pub memory: MemoryConfig,
    pub agents: AgentSettings,
}

impl SystemConfig {
    /// Load from disk, falling back to defaults when the file is missing.
    /// A present-but-malformed file is a configuration error, not a silent
    /// reset.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let text = read_file_with_context(path, "system config")?;
            serde_json::from_str(&text)
                .with_context(|| format!("Malformed {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize system config")?;
        atomic_write(path, json.as_bytes())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var(ENV_AI_MODEL) {
            if !model.trim().is_empty() {
                self.ai_model = Some(model.clone());
                self.memory.model = model;
            }
        }
        if let Ok(locale) = std::env::var(ENV_LOCALE) {
            if !locale.trim().is_empty() {
                self.locale = Some(locale);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = SystemConfig::load(&dir.path().join("system_config.json")).unwrap();
        assert_eq!(config.memory.dimension, 384);
        assert_eq!(config.agents.max_concurrent, 1);
        assert!(!config.validation.bypass_for_trusted_paths);
    }

    #[test]
    fn malformed_file_is_an_error_not_a_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("system_config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(SystemConfig::load(&path).is_err());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("system_config.json");

        let mut config = SystemConfig::default();
        config.validation.log_low_risk_approvals = true;
        config.memory.dimension = 128;
        config.save(&path).unwrap();

        let loaded = SystemConfig::load(&path).unwrap();
        assert!(loaded.validation.log_low_risk_approvals);
        assert_eq!(loaded.memory.dimension, 128);
    }
}
