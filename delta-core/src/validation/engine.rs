//! The validation pipeline.
//!
//! Order: syntax scan, obfuscation peel, then safety rules and domain
//! validators over the original text and every decoded payload. The engine
//! is synchronous and bounded by the configured validation budget; when the
//! budget expires the result carries what the completed validators found,
//! marked incomplete, rather than blocking the prompt.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::validation::ValidationConfig;
use crate::validation::cicd::{CiCdValidator, EnvSnapshot};
use crate::validation::git::{GitValidator, WorktreeStatus};
use crate::validation::obfuscation;
use crate::validation::risk::{Finding, ValidationResult};
use crate::validation::rules::SafetyRuleSet;
use crate::validation::syntax;

pub struct ValidationEngine {
    config: ValidationConfig,
    rules: SafetyRuleSet,
    git: GitValidator,
    cicd: CiCdValidator,
}

impl ValidationEngine {
    pub fn new(
        config: ValidationConfig,
        rules: SafetyRuleSet,
        worktree: Arc<dyn WorktreeStatus>,
        env: EnvSnapshot,
    ) -> Self {
        let git = GitValidator::new(config.protected_branches.clone(), worktree);
        let cicd = CiCdValidator::new(env);
        Self {
            config,
            rules,
            git,
            cicd,
        }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn rules(&self) -> &SafetyRuleSet {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut SafetyRuleSet {
        &mut self.rules
    }

    /// Validate one command line.
    pub fn validate(&self, command: &str) -> ValidationResult {
        let deadline = Instant::now() + Duration::from_millis(self.config.max_validation_time_ms);

        // The syntax scan always runs; it is a single cheap pass and its
        // findings gate execution outright.
        let mut findings = syntax::findings(command);
        if findings
            .iter()
            .any(|finding| finding.rule_id == "syntax.empty_command")
        {
            return ValidationResult::new(findings);
        }

        let mut budget = StageBudget {
            deadline,
            expired: false,
        };

        // Peel obfuscation wrappers before the content validators so a
        // wrapped payload is checked as if typed directly.
        let mut unwrapped = obfuscation::Unwrapped::default();
        if budget.stage_allowed("obfuscation") {
            unwrapped = obfuscation::unwrap_layers(command, self.config.max_decode_depth);
            findings.extend(unwrapped.wrapper_findings());
        }

        if budget.stage_allowed("safety_rules") {
            findings.extend(self.rules.match_command(command));
        }
        if budget.stage_allowed("git") {
            findings.extend(self.git.validate(command));
        }
        if budget.stage_allowed("cicd") {
            findings.extend(self.cicd.validate(command));
        }

        // Re-submit every decoded payload through the content validators.
        // Findings keep their original kind so the prompter can distinguish
        // "hidden intent" (the wrapper findings) from the payload's own risk.
        for layer in &unwrapped.layers {
            if !budget.stage_allowed("decoded_payload") {
                break;
            }
            findings.extend(self.rules.match_command(&layer.payload));
            findings.extend(self.git.validate(&layer.payload));
            findings.extend(self.cicd.validate(&layer.payload));
        }

        ValidationResult::with_completeness(dedupe(findings), budget.expired)
    }
}

struct StageBudget {
    deadline: Instant,
    expired: bool,
}

impl StageBudget {
    /// Whether the next validator may run; flips to expired exactly once.
    fn stage_allowed(&mut self, stage: &str) -> bool {
        if self.expired {
            return false;
        }
        if Instant::now() >= self.deadline {
            debug!(stage, "validation budget expired; returning degraded result");
            self.expired = true;
            return false;
        }
        true
    }
}

/// The same rule firing on the original text and again on a decoded payload
/// is one observation; keep the first occurrence.
fn dedupe(findings: Vec<Finding>) -> Vec<Finding> {
    let mut seen: HashSet<(&'static str, String, String)> = HashSet::new();
    findings
        .into_iter()
        .filter(|finding| {
            seen.insert((
                finding.kind.label(),
                finding.rule_id.clone(),
                finding.message.clone(),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::cicd::EnvSnapshot;
    use crate::validation::git::UnknownWorktree;
    use crate::validation::risk::{ErrorKind, RiskLevel};

    fn engine() -> ValidationEngine {
        ValidationEngine::new(
            ValidationConfig::default(),
            SafetyRuleSet::builtin(),
            Arc::new(UnknownWorktree),
            EnvSnapshot::default(),
        )
    }

    fn ci_engine() -> ValidationEngine {
        ValidationEngine::new(
            ValidationConfig::default(),
            SafetyRuleSet::builtin(),
            Arc::new(UnknownWorktree),
            EnvSnapshot::from_pairs([("CI", "true"), ("GITHUB_ACTIONS", "true")]),
        )
    }

    #[test]
    fn clean_command_is_valid_low() {
        let result = engine().validate("ls -la");
        assert!(result.is_valid());
        assert_eq!(result.aggregate_risk(), RiskLevel::Low);
        assert!(result.is_empty());
    }

    #[test]
    fn empty_command_short_circuits() {
        let result = engine().validate("");
        assert_eq!(result.findings().len(), 1);
        assert_eq!(result.findings()[0].kind, ErrorKind::Syntax);
    }

    #[test]
    fn obfuscated_root_delete_is_critical_with_both_kinds() {
        let result = engine().validate(r#"echo "cm0gLXJmIC8=" | base64 -d | bash"#);
        assert_eq!(result.aggregate_risk(), RiskLevel::Critical);
        assert!(result.has_kind(ErrorKind::Obfuscation));
        assert!(
            result
                .findings()
                .iter()
                .any(|f| f.kind == ErrorKind::Safety && f.rule_id == "safety.rm_root"),
            "decoded payload should raise the root-delete safety rule"
        );
        assert!(!result.is_valid());
    }

    #[test]
    fn force_push_from_ci_raises_git_and_ci_findings() {
        let result = ci_engine().validate("git push --force origin main");
        assert!(result.has_kind(ErrorKind::Git));
        assert_eq!(result.aggregate_risk(), RiskLevel::High);
    }

    #[test]
    fn decoded_force_push_is_caught() {
        // base64 of "git push --force origin main"
        let encoded = "Z2l0IHB1c2ggLS1mb3JjZSBvcmlnaW4gbWFpbg==";
        let result = engine().validate(&format!(r#"echo "{encoded}" | base64 -d | sh"#));
        assert!(result.has_kind(ErrorKind::Obfuscation));
        assert!(
            result
                .findings()
                .iter()
                .any(|f| f.kind == ErrorKind::Git),
            "git validator should run on the decoded payload"
        );
    }

    #[test]
    fn validation_is_fixed_point_modulo_obfuscation() {
        let wrapped = r#"echo "cm0gLXJmIC8=" | base64 -d | bash"#;
        let direct = "rm -rf /";

        let wrapped_result = engine().validate(wrapped);
        let direct_result = engine().validate(direct);

        let direct_rules: HashSet<&str> = direct_result
            .findings()
            .iter()
            .map(|f| f.rule_id.as_str())
            .collect();
        let wrapped_non_obfuscation: HashSet<&str> = wrapped_result
            .findings()
            .iter()
            .filter(|f| f.kind != ErrorKind::Obfuscation)
            .map(|f| f.rule_id.as_str())
            .collect();

        assert!(direct_rules.is_subset(&wrapped_non_obfuscation));
    }

    #[test]
    fn zero_budget_returns_degraded_result() {
        let config = ValidationConfig {
            max_validation_time_ms: 0,
            ..ValidationConfig::default()
        };
        let engine = ValidationEngine::new(
            config,
            SafetyRuleSet::builtin(),
            Arc::new(UnknownWorktree),
            EnvSnapshot::default(),
        );
        let result = engine.validate("rm -rf /");
        assert!(result.is_incomplete());
        // Only the always-on syntax pass contributed.
        assert!(result.findings().iter().all(|f| f.kind == ErrorKind::Syntax));
    }

    #[test]
    fn same_rule_not_duplicated_across_layers() {
        // IFS layer re-contains the payload; the rm rule must fire once.
        let result = engine().validate("rm${IFS}-rf${IFS}/");
        let count = result
            .findings()
            .iter()
            .filter(|f| f.rule_id == "safety.rm_root")
            .count();
        assert_eq!(count, 1);
    }
}
