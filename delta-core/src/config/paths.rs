//! Persisted directory layout under the config root.
//!
//! Every subsystem owns exactly one subtree: the update engine writes
//! `updates/`, the memory store writes `memory/`, the agent orchestrator
//! writes `agents/`. Nothing reads or writes another subsystem's directory.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::ENV_CONFIG_DIR;
use crate::utils::fs::ensure_dir_exists;

/// Resolved layout of Delta's per-user configuration directory.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    root: PathBuf,
}

impl ConfigPaths {
    /// Resolve the config root from `DELTA_CONFIG_DIR`, falling back to the
    /// OS-standard user config directory plus `delta`.
    pub fn resolve() -> Result<Self> {
        if let Ok(dir) = env::var(ENV_CONFIG_DIR) {
            if !dir.trim().is_empty() {
                return Ok(Self {
                    root: PathBuf::from(dir),
                });
            }
        }

        let base = dirs::config_dir().context("Cannot determine user config directory")?;
        Ok(Self {
            root: base.join("delta"),
        })
    }

    /// Build a layout rooted at an explicit directory (tests, overrides).
    pub fn at_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create every directory the subsystems expect to exist.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.memory_dir(),
            self.exports_dir(),
            self.validation_dir(),
            self.updates_dir(),
            self.downloads_dir(),
            self.backups_dir(),
            self.agents_dir(),
            self.agent_store_dir(),
            self.agent_cache_dir(),
            self.patterns_dir(),
            self.logs_dir(),
        ] {
            ensure_dir_exists(&dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn system_config_file(&self) -> PathBuf {
        self.root.join("system_config.json")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.root.join("memory")
    }

    pub fn memory_db_file(&self) -> PathBuf {
        self.memory_dir().join("commands.sqlite")
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.memory_dir().join("exports")
    }

    pub fn validation_dir(&self) -> PathBuf {
        self.root.join("validation")
    }

    pub fn custom_rules_file(&self) -> PathBuf {
        self.validation_dir().join("custom_rules.yml")
    }

    pub fn decisions_log(&self) -> PathBuf {
        self.validation_dir().join("decisions.log")
    }

    pub fn updates_dir(&self) -> PathBuf {
        self.root.join("updates")
    }

    pub fn update_config_file(&self) -> PathBuf {
        self.updates_dir().join("config.json")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.updates_dir().join("downloads")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.updates_dir().join("backups")
    }

    pub fn update_history_log(&self) -> PathBuf {
        self.updates_dir().join("history.log")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }

    pub fn agents_config_file(&self) -> PathBuf {
        self.agents_dir().join("agent_config.json")
    }

    pub fn agent_store_dir(&self) -> PathBuf {
        self.agents_dir().join("agents")
    }

    pub fn agent_cache_dir(&self) -> PathBuf {
        self.agents_dir().join("cache")
    }

    pub fn patterns_dir(&self) -> PathBuf {
        self.root.join("patterns")
    }

    pub fn error_patterns_file(&self) -> PathBuf {
        self.patterns_dir().join("error_patterns.json")
    }

    pub fn common_commands_file(&self) -> PathBuf {
        self.patterns_dir().join("common_commands.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn layout_is_rooted_and_complete() -> Result<()> {
        let dir = TempDir::new()?;
        let paths = ConfigPaths::at_root(dir.path());
        paths.ensure_layout()?;

        assert!(paths.memory_dir().is_dir());
        assert!(paths.backups_dir().is_dir());
        assert!(paths.agent_store_dir().is_dir());
        assert!(paths.patterns_dir().is_dir());
        assert!(paths.decisions_log().starts_with(dir.path()));
        Ok(())
    }

    #[test]
    fn env_override_wins() {
        let dir = TempDir::new().unwrap();
        env::set_var(ENV_CONFIG_DIR, dir.path());
        let paths = ConfigPaths::resolve().unwrap();
        env::remove_var(ENV_CONFIG_DIR);
        assert_eq!(paths.root(), dir.path());
    }
}
