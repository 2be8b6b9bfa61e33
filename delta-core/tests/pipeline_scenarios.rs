//! Cross-module scenarios: the validation pipeline feeding the prompter and
//! the memory store, end to end.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tempfile::TempDir;

use delta_core::memory::{EmbeddingProvider, HashingEmbeddings, SimilarityMetric, VectorMemoryStore};
use delta_core::memory::store::CommandRecord;
use delta_core::validation::cicd::EnvSnapshot;
use delta_core::validation::decisions::{hash_command, DecisionChoice, DecisionLog};
use delta_core::validation::git::UnknownWorktree;
use delta_core::validation::prompter::{PromptVerdict, ReviewOutcome, SafetyPrompt, SafetyPrompter};
use delta_core::validation::risk::{ErrorKind, RiskLevel, ValidationResult};
use delta_core::validation::rules::SafetyRuleSet;
use delta_core::validation::{ValidationConfig, ValidationEngine};

struct ScriptedPrompt {
    verdicts: Mutex<Vec<PromptVerdict>>,
}

impl ScriptedPrompt {
    fn new(verdicts: Vec<PromptVerdict>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts),
        }
    }
}

impl SafetyPrompt for ScriptedPrompt {
    fn prompt(&self, _command: &str, _result: &ValidationResult) -> Result<PromptVerdict> {
        Ok(self
            .verdicts
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(PromptVerdict::Cancel))
    }
}

fn engine_with_env(env: EnvSnapshot) -> ValidationEngine {
    ValidationEngine::new(
        ValidationConfig::default(),
        SafetyRuleSet::builtin(),
        Arc::new(UnknownWorktree),
        env,
    )
}

fn prompter(dir: &TempDir, verdicts: Vec<PromptVerdict>) -> SafetyPrompter {
    let log = DecisionLog::open(&dir.path().join("decisions.log")).unwrap();
    SafetyPrompter::new(
        ValidationConfig::default(),
        log,
        Box::new(ScriptedPrompt::new(verdicts)),
    )
}

/// Scenario: an obfuscated destructive command is caught, auto-denied, and
/// never reaches the shell.
#[test]
fn obfuscated_destructive_command_is_auto_denied() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with_env(EnvSnapshot::default());
    let mut prompter = prompter(&dir, vec![]);

    let line = r#"echo "cm0gLXJmIC8=" | base64 -d | bash"#;
    let result = engine.validate(line);

    assert_eq!(result.aggregate_risk(), RiskLevel::Critical);
    assert!(result.has_kind(ErrorKind::Obfuscation));
    assert!(
        result
            .findings()
            .iter()
            .any(|f| f.kind == ErrorKind::Safety && f.rule_id == "safety.rm_root")
    );

    let outcome = prompter
        .review(line, &result, |modified| engine.validate(modified))
        .unwrap();
    assert_eq!(
        outcome,
        ReviewOutcome::Denied {
            choice: DecisionChoice::AutoDeny
        }
    );

    let records = prompter.decision_log().read_all().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].choice, DecisionChoice::AutoDeny);
    assert_eq!(records[0].command_hash, hash_command(line));
}

/// Scenario: force-push to main from CI raises git findings, requires an
/// explicit choice, and a Cancel is recorded while the session survives.
#[test]
fn force_push_from_ci_requires_explicit_choice() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with_env(EnvSnapshot::from_pairs([
        ("CI", "true"),
        ("GITHUB_ACTIONS", "true"),
    ]));
    let mut prompter = prompter(&dir, vec![PromptVerdict::Cancel]);

    let line = "git push --force origin main";
    let result = engine.validate(line);

    assert!(result.has_kind(ErrorKind::Git));
    assert_eq!(result.aggregate_risk(), RiskLevel::High);

    let outcome = prompter
        .review(line, &result, |modified| engine.validate(modified))
        .unwrap();
    assert_eq!(
        outcome,
        ReviewOutcome::Denied {
            choice: DecisionChoice::Cancel
        }
    );
}

/// Scenario: a safe command auto-approves silently and lands in the memory
/// store with its frequency maintained across runs.
#[tokio::test]
async fn safe_command_flows_into_memory() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with_env(EnvSnapshot::default());
    let mut prompter = prompter(&dir, vec![]);

    let line = "ls -la";
    let result = engine.validate(line);
    assert_eq!(result.aggregate_risk(), RiskLevel::Low);

    let outcome = prompter
        .review(line, &result, |modified| engine.validate(modified))
        .unwrap();
    assert!(outcome.is_approved());
    // Default policy: silent approvals are not logged.
    assert_eq!(prompter.decision_log().records_written(), 0);

    // Decision precedes execution precedes the memory record; here the
    // "execution" is simulated with exit code 0.
    let store = VectorMemoryStore::open(
        &dir.path().join("commands.sqlite"),
        64,
        SimilarityMetric::Cosine,
        128,
        3_600,
    )
    .unwrap();
    let embedder = HashingEmbeddings::new(64);

    for _ in 0..2 {
        let embedding = embedder.embed(line).await.unwrap();
        let record = CommandRecord::new(line, "/home/dev", 0, embedding);
        store.upsert(&record).unwrap();
    }

    let stored = store.get(&hash_command(line)).unwrap().unwrap();
    assert_eq!(stored.frequency, 2);
    assert!((stored.success_rate - 1.0).abs() < 1e-9);

    // And similarity search brings the command back for suggestion.
    let query = embedder.embed("ls -l").await.unwrap();
    let hits = store.search(&query, None, 5).unwrap();
    assert_eq!(hits[0].record.command, line);
}

/// The decoded-command pipeline is a fixed point: validating the wrapper
/// yields the direct command's findings plus Obfuscation-kind additions.
#[test]
fn decode_then_validate_is_fixed_point_modulo_obfuscation() {
    let engine = engine_with_env(EnvSnapshot::default());

    let direct = engine.validate("rm -rf /");
    let wrapped = engine.validate(r#"echo "cm0gLXJmIC8=" | base64 -d | bash"#);

    for finding in direct.findings() {
        assert!(
            wrapped
                .findings()
                .iter()
                .any(|candidate| candidate.rule_id == finding.rule_id),
            "missing {} on the wrapped command",
            finding.rule_id
        );
    }
    for finding in wrapped.findings() {
        if finding.kind != ErrorKind::Obfuscation {
            assert!(
                direct
                    .findings()
                    .iter()
                    .any(|candidate| candidate.rule_id == finding.rule_id),
                "extra non-obfuscation finding {} on the wrapped command",
                finding.rule_id
            );
        }
    }
}
