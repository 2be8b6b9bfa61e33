//! Post-install validation suite.
//!
//! An ordered list of named tests run against the freshly installed binary
//! as a subprocess. Critical-test failure triggers rollback in the engine.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

/// One named test in the suite.
#[derive(Debug, Clone)]
pub struct ValidationTest {
    pub name: &'static str,
    pub description: &'static str,
    pub timeout: Duration,
    pub critical: bool,
}

/// Result of one test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub name: String,
    pub passed: bool,
    pub detail: String,
    pub duration_ms: u64,
    pub critical: bool,
}

/// Aggregated suite result.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValidationReport {
    pub outcomes: Vec<ValidationOutcome>,
}

impl ValidationReport {
    /// The suite passes when every critical test passed.
    pub fn passed(&self) -> bool {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.critical)
            .all(|outcome| outcome.passed)
    }

    pub fn first_failure(&self) -> Option<&ValidationOutcome> {
        self.outcomes.iter().find(|outcome| !outcome.passed)
    }

    /// Compact one-line-per-test summary for the update record.
    pub fn summaries(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .map(|outcome| {
                format!(
                    "{}: {} ({})",
                    outcome.name,
                    if outcome.passed { "pass" } else { "fail" },
                    outcome.detail
                )
            })
            .collect()
    }
}

/// Capability the engine validates installs through; scripted in tests.
#[async_trait]
pub trait InstallValidator: Send + Sync {
    async fn validate(&self, binary: &Path, expected_version: &str) -> ValidationReport;
}

/// The production suite.
pub struct PostInstallValidator {
    /// Config files that must still parse after the swap.
    pub config_files: Vec<PathBuf>,
}

impl PostInstallValidator {
    pub fn new(config_files: Vec<PathBuf>) -> Self {
        Self { config_files }
    }

    fn suite() -> Vec<ValidationTest> {
        vec![
            ValidationTest {
                name: "binary_executable",
                description: "binary exists and is executable",
                timeout: Duration::from_secs(5),
                critical: true,
            },
            ValidationTest {
                name: "version_output",
                description: "--version reports the expected version",
                timeout: Duration::from_secs(10),
                critical: true,
            },
            ValidationTest {
                name: "help_output",
                description: "--help returns non-trivial output",
                timeout: Duration::from_secs(10),
                critical: true,
            },
            ValidationTest {
                name: "config_parse",
                description: "configuration files still parse",
                timeout: Duration::from_secs(5),
                critical: false,
            },
        ]
    }

    async fn run_test(
        &self,
        test: &ValidationTest,
        binary: &Path,
        expected_version: &str,
    ) -> (bool, String) {
        match test.name {
            "binary_executable" => check_executable(binary),
            "version_output" => {
                match run_binary(binary, &["--version"], test.timeout).await {
                    Ok(output) => {
                        if output.contains(expected_version) {
                            (true, format!("reported {expected_version}"))
                        } else {
                            (
                                false,
                                format!(
                                    "version mismatch: expected {expected_version}, got '{}'",
                                    output.trim()
                                ),
                            )
                        }
                    }
                    Err(detail) => (false, detail),
                }
            }
            "help_output" => match run_binary(binary, &["--help"], test.timeout).await {
                Ok(output) if output.trim().len() > 40 => (true, "help text present".to_string()),
                Ok(output) => (false, format!("help output too short ({} bytes)", output.len())),
                Err(detail) => (false, detail),
            },
            "config_parse" => {
                for path in &self.config_files {
                    if !path.exists() {
                        continue;
                    }
                    let Ok(text) = std::fs::read_to_string(path) else {
                        return (false, format!("unreadable config {}", path.display()));
                    };
                    if serde_json::from_str::<serde_json::Value>(&text).is_err() {
                        return (false, format!("config no longer parses: {}", path.display()));
                    }
                }
                (true, "configs parse".to_string())
            }
            other => (false, format!("unknown test {other}")),
        }
    }
}

#[async_trait]
impl InstallValidator for PostInstallValidator {
    async fn validate(&self, binary: &Path, expected_version: &str) -> ValidationReport {
        let mut report = ValidationReport::default();
        for test in Self::suite() {
            let started = Instant::now();
            let (passed, detail) = self.run_test(&test, binary, expected_version).await;
            debug!(
                test = test.name,
                check = test.description,
                passed,
                %detail,
                "post-install test"
            );
            report.outcomes.push(ValidationOutcome {
                name: test.name.to_string(),
                passed,
                detail,
                duration_ms: started.elapsed().as_millis() as u64,
                critical: test.critical,
            });
            // Later tests are meaningless once a critical one fails.
            if test.critical && !passed {
                break;
            }
        }
        report
    }
}

fn check_executable(binary: &Path) -> (bool, String) {
    if !binary.exists() {
        return (false, format!("{} does not exist", binary.display()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(binary) {
            Ok(meta) if meta.permissions().mode() & 0o111 != 0 => {
                (true, "executable".to_string())
            }
            Ok(_) => (false, "missing executable bit".to_string()),
            Err(err) => (false, format!("stat failed: {err}")),
        }
    }
    #[cfg(not(unix))]
    {
        (true, "exists".to_string())
    }
}

async fn run_binary(binary: &Path, args: &[&str], timeout: Duration) -> Result<String, String> {
    let child = Command::new(binary)
        .args(args)
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            Ok(combined)
        }
        Ok(Err(err)) => Err(format!("failed to launch {}: {err}", binary.display())),
        Err(_) => Err(format!("{:?} timed out after {timeout:?}", args)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn outcome(name: &str, passed: bool, critical: bool) -> ValidationOutcome {
        ValidationOutcome {
            name: name.to_string(),
            passed,
            detail: String::new(),
            duration_ms: 1,
            critical,
        }
    }

    #[test]
    fn report_passes_when_critical_tests_pass() {
        let report = ValidationReport {
            outcomes: vec![
                outcome("binary_executable", true, true),
                outcome("config_parse", false, false),
            ],
        };
        assert!(report.passed());
        assert_eq!(report.first_failure().unwrap().name, "config_parse");
    }

    #[test]
    fn report_fails_on_critical_failure() {
        let report = ValidationReport {
            outcomes: vec![outcome("version_output", false, true)],
        };
        assert!(!report.passed());
    }

    #[tokio::test]
    async fn missing_binary_fails_first_test() {
        let dir = TempDir::new().unwrap();
        let validator = PostInstallValidator::new(vec![]);
        let report = validator
            .validate(&dir.path().join("missing"), "1.0.0")
            .await;
        assert!(!report.passed());
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].name, "binary_executable");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_script_binary_passes_version_and_help() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let binary = dir.path().join("fake-delta");
        std::fs::write(
            &binary,
            "#!/bin/sh\ncase \"$1\" in\n--version) echo 'delta 1.2.3';;\n--help) \
             echo 'usage: delta [options] -- an interactive shell enhancement layer';;\nesac\n",
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let validator = PostInstallValidator::new(vec![]);
        let report = validator.validate(&binary, "1.2.3").await;
        assert!(report.passed(), "report: {:?}", report.summaries());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn version_mismatch_fails_validation() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let binary = dir.path().join("fake-delta");
        std::fs::write(&binary, "#!/bin/sh\necho 'delta 1.0.0'\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let validator = PostInstallValidator::new(vec![]);
        let report = validator.validate(&binary, "1.1.0").await;
        assert!(!report.passed());
        let failure = report.first_failure().unwrap();
        assert_eq!(failure.name, "version_output");
        assert!(failure.detail.contains("version mismatch"));
    }
}
