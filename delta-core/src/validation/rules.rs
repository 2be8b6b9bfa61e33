//! Pattern-based safety rules.
//!
//! Rules are data, not code: each one is a compiled regex with a risk level,
//! a message, an optional remediation suggestion, and an educational note.
//! The set is populated from built-in defaults, the user's
//! `validation/custom_rules.yml`, and runtime add/remove operations.

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::utils::fs::read_file_with_context;
use crate::validation::risk::{ErrorKind, Finding, RiskLevel};

/// One compiled safety rule.
#[derive(Debug, Clone)]
pub struct SafetyRule {
    pub name: String,
    pub description: String,
    pub pattern: Regex,
    pub risk: RiskLevel,
    pub message: String,
    pub suggestion: Option<String>,
    pub educational_note: Option<String>,
    pub enabled: bool,
    /// Whether the rule came from the user file rather than the built-ins.
    pub custom: bool,
}

impl SafetyRule {
    fn finding_for(&self, command: &str) -> Option<Finding> {
        if !self.enabled {
            return None;
        }
        let matched = self.pattern.find(command)?;
        let kind = if self.custom {
            ErrorKind::Custom
        } else {
            ErrorKind::Safety
        };
        let mut finding = Finding::new(
            kind,
            self.risk,
            self.name.clone(),
            self.message.clone(),
            matched.start()..matched.end(),
        );
        if let Some(suggestion) = &self.suggestion {
            finding = finding.with_suggestion(suggestion.clone());
        }
        if let Some(note) = &self.educational_note {
            finding = finding.with_note(note.clone());
        }
        Some(finding)
    }
}

/// Serialized shape of a user-authored rule in `custom_rules.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub pattern: String,
    pub risk: RiskLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub educational_note: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CustomRuleFile {
    #[serde(default)]
    rules: Vec<CustomRule>,
}

/// The populated rule set. Matching is one pass over all enabled rules.
#[derive(Debug, Clone, Default)]
pub struct SafetyRuleSet {
    rules: Vec<SafetyRule>,
}

impl SafetyRuleSet {
    /// Built-in defaults only.
    pub fn builtin() -> Self {
        let mut set = Self::default();
        for spec in BUILTIN_RULES {
            match Regex::new(spec.pattern) {
                Ok(pattern) => set.rules.push(SafetyRule {
                    name: spec.name.to_string(),
                    description: spec.description.to_string(),
                    pattern,
                    risk: spec.risk,
                    message: spec.message.to_string(),
                    suggestion: spec.suggestion.map(str::to_string),
                    educational_note: spec.note.map(str::to_string),
                    enabled: true,
                    custom: false,
                }),
                Err(err) => {
                    // A broken built-in is a programming error; surface loudly
                    // in debug builds, skip in release.
                    debug_assert!(false, "built-in rule {} failed to compile: {err}", spec.name);
                    warn!(rule = spec.name, %err, "skipping built-in rule");
                }
            }
        }
        set
    }

    /// Built-in defaults plus the user's rule file, when present.
    pub fn load(custom_rules_path: &Path) -> Self {
        let mut set = Self::builtin();
        if custom_rules_path.exists() {
            match set.load_user_rules(custom_rules_path) {
                Ok(count) => tracing::debug!(count, "loaded custom safety rules"),
                Err(err) => warn!(%err, "failed to load custom safety rules"),
            }
        }
        set
    }

    /// Parse and append rules from a user YAML file. Returns how many loaded.
    pub fn load_user_rules(&mut self, path: &Path) -> Result<usize> {
        let text = read_file_with_context(path, "custom safety rules")?;
        let file: CustomRuleFile =
            serde_yaml::from_str(&text).context("Malformed custom_rules.yml")?;

        let mut loaded = 0;
        for rule in file.rules {
            match self.add_rule(rule.clone()) {
                Ok(()) => loaded += 1,
                Err(err) => warn!(rule = %rule.name, %err, "skipping invalid custom rule"),
            }
        }
        Ok(loaded)
    }

    /// Add one rule at runtime. Replaces an existing rule with the same name.
    pub fn add_rule(&mut self, rule: CustomRule) -> Result<()> {
        let pattern = Regex::new(&rule.pattern)
            .with_context(|| format!("Invalid regex in rule '{}'", rule.name))?;
        self.remove_rule(&rule.name);
        self.rules.push(SafetyRule {
            name: rule.name,
            description: rule.description,
            pattern,
            risk: rule.risk,
            message: rule.message,
            suggestion: rule.suggestion,
            educational_note: rule.educational_note,
            enabled: rule.enabled,
            custom: true,
        });
        Ok(())
    }

    /// Remove a rule by name. Returns whether anything was removed.
    pub fn remove_rule(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.name != name);
        self.rules.len() != before
    }

    /// Enable or disable a rule by name.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        for rule in &mut self.rules {
            if rule.name == name {
                rule.enabled = enabled;
                return true;
            }
        }
        false
    }

    pub fn rules(&self) -> &[SafetyRule] {
        &self.rules
    }

    /// Match every enabled rule against the command once.
    pub fn match_command(&self, command: &str) -> Vec<Finding> {
        self.rules
            .iter()
            .filter_map(|rule| rule.finding_for(command))
            .collect()
    }
}

struct BuiltinRule {
    name: &'static str,
    description: &'static str,
    pattern: &'static str,
    risk: RiskLevel,
    message: &'static str,
    suggestion: Option<&'static str>,
    note: Option<&'static str>,
}

const BUILTIN_RULES: &[BuiltinRule] = &[
    BuiltinRule {
        name: "safety.rm_root",
        description: "Recursive delete of the filesystem root",
        pattern: r"\brm\s+(-[a-zA-Z]*r[a-zA-Z]*f[a-zA-Z]*|-[a-zA-Z]*f[a-zA-Z]*r[a-zA-Z]*)\s+(--no-preserve-root\s+)?/\s*(\*)?\s*$",
        risk: RiskLevel::Critical,
        message: "recursive delete of the filesystem root",
        suggestion: Some("name the specific directory you want to remove"),
        note: Some(
            "rm -rf / deletes every file the user can write, including system \
             files; there is no undo and no trash",
        ),
    },
    BuiltinRule {
        name: "safety.rm_home",
        description: "Recursive delete of the home directory",
        pattern: r#"\brm\s+-[a-zA-Z]*r[a-zA-Z]*\s+(~|\$HOME|"\$HOME")/?\s*$"#,
        risk: RiskLevel::Critical,
        message: "recursive delete of the home directory",
        suggestion: Some("remove a specific subdirectory instead of the whole home"),
        note: Some("deleting $HOME removes documents, keys, and configuration for this user"),
    },
    BuiltinRule {
        name: "safety.curl_pipe_shell",
        description: "Piping a downloaded script straight into a shell",
        pattern: r"\b(curl|wget)\b[^|;]*\|\s*(sudo\s+)?(ba|z|fi|da)?sh\b",
        risk: RiskLevel::High,
        message: "downloaded content is piped directly into a shell",
        suggestion: Some("download to a file, inspect it, then run it"),
        note: Some(
            "piping a URL into a shell executes whatever the server returns; \
             the content can change between inspection and execution",
        ),
    },
    BuiltinRule {
        name: "safety.world_writable",
        description: "World-writable permission changes",
        pattern: r"\bchmod\s+(-R\s+)?(a\+w|o\+w|777|666)\b",
        risk: RiskLevel::High,
        message: "grants write permission to every user on the system",
        suggestion: Some("prefer 755 for directories and 644 for files"),
        note: Some("world-writable paths let any local process tamper with your files"),
    },
    BuiltinRule {
        name: "safety.dd_device",
        description: "Raw dd write to a block device",
        pattern: r"\bdd\b[^|;]*\bof=/dev/(sd[a-z]|hd[a-z]|nvme\d+n\d+|disk\d+|mmcblk\d+)",
        risk: RiskLevel::Critical,
        message: "dd writes directly over a block device",
        suggestion: Some("double-check the of= target; consider a dedicated imaging tool"),
        note: Some("one mistyped device name overwrites a whole disk with no confirmation"),
    },
    BuiltinRule {
        name: "safety.piped_credentials",
        description: "Credentials piped into privileged execution",
        pattern: r"\becho\s+[^|;]*\|\s*sudo\s+-S\b",
        risk: RiskLevel::High,
        message: "a password is piped into sudo on the command line",
        suggestion: Some("let sudo prompt for the password instead"),
        note: Some(
            "command lines are visible in shell history and the process table, \
             so the piped password leaks to other users",
        ),
    },
    BuiltinRule {
        name: "safety.fork_bomb",
        description: "Classic fork bomb",
        pattern: r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        risk: RiskLevel::Critical,
        message: "fork bomb: spawns processes until the system is unusable",
        suggestion: None,
        note: Some("this function calls itself twice per invocation, exhausting the process table"),
    },
    BuiltinRule {
        name: "safety.plaintext_secret",
        description: "Plaintext secret on the command line",
        pattern: r#"(?i)\b(password|passwd|api[_-]?key|secret|token)\s*=\s*['"]?[A-Za-z0-9+/_\-]{8,}"#,
        risk: RiskLevel::Medium,
        message: "plaintext secret embedded in the command",
        suggestion: Some("read the secret from an environment variable or a file"),
        note: Some("secrets typed into commands persist in shell history files"),
    },
    BuiltinRule {
        name: "safety.disk_wipe",
        description: "Filesystem creation or disk wipe",
        pattern: r"\b(mkfs(\.[a-z0-9]+)?|wipefs|shred\s+[^|;]*/dev/|blkdiscard)\b",
        risk: RiskLevel::Critical,
        message: "formats or wipes a disk",
        suggestion: Some("verify the target device before running destructive disk tools"),
        note: Some("formatting destroys all data on the target device immediately"),
    },
    BuiltinRule {
        name: "safety.recursive_chown_root",
        description: "Recursive ownership change from the root",
        pattern: r"\bchown\s+-[a-zA-Z]*R[a-zA-Z]*\s+[^\s]+\s+/\s*$",
        risk: RiskLevel::High,
        message: "recursively changes ownership of the entire filesystem",
        suggestion: Some("restrict the chown to the directory that actually needs it"),
        note: None,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_rules_all_compile() {
        let set = SafetyRuleSet::builtin();
        assert_eq!(set.rules().len(), BUILTIN_RULES.len());
    }

    #[test]
    fn rm_rf_root_is_critical() {
        let set = SafetyRuleSet::builtin();
        let findings = set.match_command("rm -rf /");
        assert!(
            findings
                .iter()
                .any(|f| f.rule_id == "safety.rm_root" && f.risk == RiskLevel::Critical)
        );
    }

    #[test]
    fn rm_rf_subdirectory_is_not_root_delete() {
        let set = SafetyRuleSet::builtin();
        let findings = set.match_command("rm -rf ./build");
        assert!(!findings.iter().any(|f| f.rule_id == "safety.rm_root"));
    }

    #[test]
    fn curl_pipe_bash_is_flagged_with_span() {
        let set = SafetyRuleSet::builtin();
        let command = "curl -fsSL https://example.com/install.sh | bash";
        let findings = set.match_command(command);
        let finding = findings
            .iter()
            .find(|f| f.rule_id == "safety.curl_pipe_shell")
            .expect("curl|bash should match");
        assert_eq!(finding.risk, RiskLevel::High);
        assert!(command[finding.span.clone()].starts_with("curl"));
        assert!(finding.educational_note.is_some());
    }

    #[test]
    fn fork_bomb_is_critical() {
        let set = SafetyRuleSet::builtin();
        let findings = set.match_command(":(){ :|:& };:");
        assert!(
            findings
                .iter()
                .any(|f| f.rule_id == "safety.fork_bomb" && f.risk == RiskLevel::Critical)
        );
    }

    #[test]
    fn dd_to_device_is_critical() {
        let set = SafetyRuleSet::builtin();
        let findings = set.match_command("dd if=image.iso of=/dev/sda bs=4M");
        assert!(findings.iter().any(|f| f.rule_id == "safety.dd_device"));
    }

    #[test]
    fn dd_to_regular_file_is_fine() {
        let set = SafetyRuleSet::builtin();
        let findings = set.match_command("dd if=/dev/urandom of=./random.bin count=1");
        assert!(!findings.iter().any(|f| f.rule_id == "safety.dd_device"));
    }

    #[test]
    fn plaintext_secret_is_medium() {
        let set = SafetyRuleSet::builtin();
        let findings = set.match_command("export API_KEY=sk1234567890abcdef");
        assert!(
            findings
                .iter()
                .any(|f| f.rule_id == "safety.plaintext_secret" && f.risk == RiskLevel::Medium)
        );
    }

    #[test]
    fn disabled_rule_does_not_match() {
        let mut set = SafetyRuleSet::builtin();
        assert!(set.set_enabled("safety.curl_pipe_shell", false));
        let findings = set.match_command("curl https://x.sh | sh");
        assert!(!findings.iter().any(|f| f.rule_id == "safety.curl_pipe_shell"));
    }

    #[test]
    fn custom_rule_round_trip() {
        let mut set = SafetyRuleSet::builtin();
        set.add_rule(CustomRule {
            name: "custom.no_vim".to_string(),
            description: "team policy".to_string(),
            pattern: r"\bvim\b".to_string(),
            risk: RiskLevel::Low,
            message: "use the team editor".to_string(),
            suggestion: None,
            educational_note: None,
            enabled: true,
        })
        .unwrap();

        let findings = set.match_command("vim /etc/hosts");
        let finding = findings
            .iter()
            .find(|f| f.rule_id == "custom.no_vim")
            .expect("custom rule should match");
        assert_eq!(finding.kind, ErrorKind::Custom);

        assert!(set.remove_rule("custom.no_vim"));
        assert!(set.match_command("vim x").is_empty());
    }

    #[test]
    fn invalid_custom_regex_is_rejected() {
        let mut set = SafetyRuleSet::builtin();
        let err = set.add_rule(CustomRule {
            name: "bad".to_string(),
            description: String::new(),
            pattern: "(unclosed".to_string(),
            risk: RiskLevel::Low,
            message: "x".to_string(),
            suggestion: None,
            educational_note: None,
            enabled: true,
        });
        assert!(err.is_err());
    }

    #[test]
    fn user_rule_file_parses() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("custom_rules.yml");
        std::fs::write(
            &path,
            r#"
rules:
  - name: custom.prod_db
    description: Block direct prod database access
    pattern: 'psql\s+.*prod'
    risk: high
    message: direct production database access
    suggestion: go through the bastion
"#,
        )?;

        let mut set = SafetyRuleSet::builtin();
        assert_eq!(set.load_user_rules(&path)?, 1);
        let findings = set.match_command("psql -h prod.internal");
        assert!(findings.iter().any(|f| f.rule_id == "custom.prod_db"));
        Ok(())
    }
}
