//! Error pattern library.
//!
//! Read-through loading: the user's `patterns/error_patterns.json` wins,
//! then the embedded pattern set shipped with the binary, then the built-in
//! defaults compiled below. Also serves the `common_commands.json` seed used
//! for cold-start suggestions.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A known error signature and the command that usually fixes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorSolution {
    /// Substring or regex matched against the failing command's output.
    pub pattern: String,
    pub solution: String,
    pub description: String,
    /// Only applies when the working directory contains a matching file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_pattern: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PatternFile {
    #[serde(default)]
    patterns: Vec<ErrorSolution>,
}

/// Pattern set shipped inside the binary; overridden by the external file.
const EMBEDDED_PATTERNS: &str = r#"{
  "patterns": [
    {
      "pattern": "EADDRINUSE",
      "solution": "lsof -ti :{{port}} | xargs kill",
      "description": "free the port held by a stale process",
      "file_pattern": "package.json"
    },
    {
      "pattern": "error: linker `cc` not found",
      "solution": "sudo apt-get install -y build-essential",
      "description": "install the C toolchain the linker needs"
    },
    {
      "pattern": "ModuleNotFoundError",
      "solution": "pip install -r requirements.txt",
      "description": "install the missing Python dependencies",
      "file_pattern": "requirements.txt"
    }
  ]
}"#;

fn builtin_patterns() -> Vec<ErrorSolution> {
    vec![
        ErrorSolution {
            pattern: "command not found".to_string(),
            solution: "hash -r".to_string(),
            description: "refresh the shell's command hash table".to_string(),
            file_pattern: None,
        },
        ErrorSolution {
            pattern: "Permission denied".to_string(),
            solution: "chmod +x {{file}}".to_string(),
            description: "make the target executable".to_string(),
            file_pattern: None,
        },
        ErrorSolution {
            pattern: "Cannot find module".to_string(),
            solution: "npm install".to_string(),
            description: "install missing node dependencies".to_string(),
            file_pattern: Some("package.json".to_string()),
        },
        ErrorSolution {
            pattern: "could not find `Cargo.toml`".to_string(),
            solution: "cargo init".to_string(),
            description: "initialise a cargo project here".to_string(),
            file_pattern: None,
        },
    ]
}

/// The loaded library.
#[derive(Debug, Clone)]
pub struct PatternLibrary {
    solutions: Vec<ErrorSolution>,
    source: &'static str,
}

impl PatternLibrary {
    /// Load external → embedded → built-in, first readable source wins.
    pub fn load(external_path: &Path) -> Self {
        if external_path.exists() {
            match Self::parse_file(external_path) {
                Ok(solutions) if !solutions.is_empty() => {
                    debug!(count = solutions.len(), "loaded external error patterns");
                    return Self {
                        solutions,
                        source: "external",
                    };
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "external pattern file unreadable; falling back"),
            }
        }

        match serde_json::from_str::<PatternFile>(EMBEDDED_PATTERNS) {
            Ok(file) => Self {
                solutions: file.patterns,
                source: "embedded",
            },
            Err(_) => Self {
                solutions: builtin_patterns(),
                source: "builtin",
            },
        }
    }

    pub fn builtin() -> Self {
        Self {
            solutions: builtin_patterns(),
            source: "builtin",
        }
    }

    fn parse_file(path: &Path) -> Result<Vec<ErrorSolution>> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file: PatternFile =
            serde_json::from_str(&text).context("Malformed error_patterns.json")?;
        Ok(file.patterns)
    }

    pub fn solutions(&self) -> &[ErrorSolution] {
        &self.solutions
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    /// Solutions whose pattern appears in the output, in library order.
    pub fn matching(&self, output: &str) -> Vec<&ErrorSolution> {
        self.solutions
            .iter()
            .filter(|solution| output.contains(&solution.pattern))
            .collect()
    }
}

/// Seed commands surfaced when the memory store is empty.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CommonCommands {
    #[serde(default)]
    pub commands: Vec<String>,
}

impl CommonCommands {
    pub fn load(path: &Path) -> Self {
        if let Ok(text) = std::fs::read_to_string(path) {
            if let Ok(parsed) = serde_json::from_str(&text) {
                return parsed;
            }
            warn!(path = %path.display(), "malformed common_commands.json; using defaults");
        }
        Self {
            commands: ["git status", "ls -la", "git diff", "docker ps"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn embedded_patterns_parse() {
        let file: PatternFile = serde_json::from_str(EMBEDDED_PATTERNS).unwrap();
        assert!(!file.patterns.is_empty());
    }

    #[test]
    fn missing_external_file_falls_back_to_embedded() {
        let dir = TempDir::new().unwrap();
        let library = PatternLibrary::load(&dir.path().join("nope.json"));
        assert_eq!(library.source(), "embedded");
        assert!(!library.solutions().is_empty());
    }

    #[test]
    fn external_file_wins_when_present() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("error_patterns.json");
        std::fs::write(
            &path,
            r#"{"patterns":[{"pattern":"boom","solution":"defuse","description":"d"}]}"#,
        )
        .unwrap();

        let library = PatternLibrary::load(&path);
        assert_eq!(library.source(), "external");
        assert_eq!(library.solutions().len(), 1);
        assert_eq!(library.solutions()[0].pattern, "boom");
    }

    #[test]
    fn corrupt_external_file_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("error_patterns.json");
        std::fs::write(&path, "{not json").unwrap();
        let library = PatternLibrary::load(&path);
        assert_eq!(library.source(), "embedded");
    }

    #[test]
    fn matching_filters_by_output_substring() {
        let library = PatternLibrary::builtin();
        let hits = library.matching("sh: widget: command not found");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].solution, "hash -r");
        assert!(library.matching("all good").is_empty());
    }

    #[test]
    fn common_commands_have_defaults() {
        let dir = TempDir::new().unwrap();
        let seeds = CommonCommands::load(&dir.path().join("missing.json"));
        assert!(!seeds.commands.is_empty());
    }
}
