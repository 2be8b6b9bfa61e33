//! Interactive safety prompter.
//!
//! Given a validation result, decides whether the command may execute,
//! prompting the user when policy requires it. The actual prompt is a
//! capability trait so tests (and non-interactive modes) can script it.

use std::path::PathBuf;

use anyhow::Result;
use dialoguer::Select;
use dialoguer::theme::ColorfulTheme;
use tracing::debug;

use crate::validation::ValidationConfig;
use crate::validation::decisions::{DecisionChoice, DecisionLog, DecisionRecord};
use crate::validation::risk::{ErrorKind, RiskLevel, ValidationResult};

/// What the interactive prompt returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptVerdict {
    Proceed,
    Modify(String),
    Cancel,
}

/// Capability for asking the user about a risky command.
pub trait SafetyPrompt: Send + Sync {
    fn prompt(&self, command: &str, result: &ValidationResult) -> Result<PromptVerdict>;
}

/// Terminal prompt built on dialoguer.
pub struct TerminalPrompt;

impl SafetyPrompt for TerminalPrompt {
    fn prompt(&self, command: &str, result: &ValidationResult) -> Result<PromptVerdict> {
        render_findings(command, result);

        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("How do you want to proceed?")
            .items(&["Proceed anyway", "Modify the command", "Cancel"])
            .default(2)
            .interact()?;

        match selection {
            0 => Ok(PromptVerdict::Proceed),
            1 => {
                let modified: String = dialoguer::Input::with_theme(&ColorfulTheme::default())
                    .with_prompt("Edit command")
                    .with_initial_text(command.to_string())
                    .interact_text()?;
                Ok(PromptVerdict::Modify(modified))
            }
            _ => Ok(PromptVerdict::Cancel),
        }
    }
}

fn render_findings(command: &str, result: &ValidationResult) {
    eprintln!();
    eprintln!("  {command}");
    if result.is_incomplete() {
        eprintln!("  (validation incomplete: budget expired)");
    }
    for finding in result.by_risk_descending() {
        eprintln!("  [{}/{}] {}", finding.risk, finding.kind, finding.message);
        if let Some(suggestion) = &finding.suggestion {
            eprintln!("      suggestion: {suggestion}");
        }
        if finding.risk >= RiskLevel::High {
            if let Some(note) = &finding.educational_note {
                eprintln!("      note: {note}");
            }
        }
    }
    eprintln!();
}

/// Outcome of a review, with the command that should actually run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Approved {
        command: String,
        choice: DecisionChoice,
    },
    Denied {
        choice: DecisionChoice,
    },
}

impl ReviewOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }
}

/// Drives the review flow and records every outcome.
pub struct SafetyPrompter {
    config: ValidationConfig,
    log: DecisionLog,
    prompt: Box<dyn SafetyPrompt>,
}

impl SafetyPrompter {
    pub fn new(config: ValidationConfig, log: DecisionLog, prompt: Box<dyn SafetyPrompt>) -> Self {
        Self {
            config,
            log,
            prompt,
        }
    }

    pub fn decision_log(&self) -> &DecisionLog {
        &self.log
    }

    /// Review one validated command. `revalidate` is consulted once if the
    /// user edits the command.
    pub fn review(
        &mut self,
        command: &str,
        result: &ValidationResult,
        revalidate: impl Fn(&str) -> ValidationResult,
    ) -> Result<ReviewOutcome> {
        let risk = result.aggregate_risk();

        // Silent approval lane: nothing risky, nothing malformed.
        if risk <= RiskLevel::Low && !result.has_kind(ErrorKind::Syntax) {
            if self.config.log_low_risk_approvals {
                self.log
                    .record(&DecisionRecord::new(command, risk, DecisionChoice::Proceed))?;
            }
            return Ok(ReviewOutcome::Approved {
                command: command.to_string(),
                choice: DecisionChoice::Proceed,
            });
        }

        // Policy denial without prompting.
        if risk >= self.config.auto_deny_level {
            debug!(%risk, "auto-denying command at or above the deny level");
            self.log
                .record(&DecisionRecord::new(command, risk, DecisionChoice::AutoDeny))?;
            return Ok(ReviewOutcome::Denied {
                choice: DecisionChoice::AutoDeny,
            });
        }

        // Trusted-path bypass: every path the command touches lies under a
        // trusted prefix. Syntax findings still force a prompt.
        if self.config.bypass_for_trusted_paths
            && !result.has_kind(ErrorKind::Syntax)
            && self.command_confined_to_trusted_paths(command)
        {
            self.log
                .record(&DecisionRecord::new(command, risk, DecisionChoice::Bypass))?;
            return Ok(ReviewOutcome::Approved {
                command: command.to_string(),
                choice: DecisionChoice::Bypass,
            });
        }

        match self.prompt.prompt(command, result)? {
            PromptVerdict::Proceed => {
                self.log
                    .record(&DecisionRecord::new(command, risk, DecisionChoice::Proceed))?;
                Ok(ReviewOutcome::Approved {
                    command: command.to_string(),
                    choice: DecisionChoice::Proceed,
                })
            }
            PromptVerdict::Cancel => {
                self.log
                    .record(&DecisionRecord::new(command, risk, DecisionChoice::Cancel))?;
                Ok(ReviewOutcome::Denied {
                    choice: DecisionChoice::Cancel,
                })
            }
            PromptVerdict::Modify(modified) => {
                // The modified command is revalidated exactly once.
                let modified_result = revalidate(&modified);
                let modified_risk = modified_result.aggregate_risk();

                let approve = if modified_risk <= RiskLevel::Low
                    && !modified_result.has_kind(ErrorKind::Syntax)
                {
                    true
                } else {
                    matches!(
                        self.prompt.prompt(&modified, &modified_result)?,
                        PromptVerdict::Proceed
                    )
                };

                if approve {
                    self.log.record(
                        &DecisionRecord::new(command, modified_risk, DecisionChoice::Modify)
                            .with_modified(modified.clone()),
                    )?;
                    Ok(ReviewOutcome::Approved {
                        command: modified,
                        choice: DecisionChoice::Modify,
                    })
                } else {
                    // A second refusal terminates the line.
                    self.log
                        .record(&DecisionRecord::new(command, risk, DecisionChoice::Cancel))?;
                    Ok(ReviewOutcome::Denied {
                        choice: DecisionChoice::Cancel,
                    })
                }
            }
        }
    }

    fn command_confined_to_trusted_paths(&self, command: &str) -> bool {
        if self.config.trusted_paths.is_empty() {
            return false;
        }
        let paths = command_paths(command);
        if paths.is_empty() {
            return false;
        }
        paths.iter().all(|path| {
            self.config
                .trusted_paths
                .iter()
                .any(|trusted| path.starts_with(trusted))
        })
    }
}

/// Tokens that look like filesystem paths.
fn command_paths(command: &str) -> Vec<PathBuf> {
    let tokens = shell_words::split(command).unwrap_or_default();
    tokens
        .into_iter()
        .skip(1)
        .filter(|token| {
            token.starts_with('/') || token.starts_with("./") || token.starts_with("~/")
        })
        .map(|token| {
            if let Some(rest) = token.strip_prefix("~/") {
                dirs::home_dir()
                    .map(|home| home.join(rest))
                    .unwrap_or_else(|| PathBuf::from(token.clone()))
            } else {
                PathBuf::from(token)
            }
        })
        .collect()
}
