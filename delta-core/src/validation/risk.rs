//! Risk levels, finding kinds, and validation results.
//!
//! These are the closed vocabularies the rest of the validation engine works
//! in. Serialization goes through the serde enum tables here and nowhere
//! else.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Risk attached to a finding. Total order: Low < Medium < High < Critical.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Human-readable description of what the level means.
    pub fn description(self) -> &'static str {
        match self {
            RiskLevel::Low => "Safe operation with no destructive side effects",
            RiskLevel::Medium => "Modifies state but is generally recoverable",
            RiskLevel::High => "Potentially destructive, requires confirmation",
            RiskLevel::Critical => "Destructive operation that is never auto-approved",
        }
    }

    /// Whether a result at this aggregate level may be approved silently.
    pub fn is_auto_approvable(self) -> bool {
        matches!(self, RiskLevel::Low)
    }

    pub fn label(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which validator family raised a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Syntax,
    Safety,
    Obfuscation,
    Git,
    #[serde(rename = "cicd")]
    CiCd,
    Custom,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Syntax => "syntax",
            ErrorKind::Safety => "safety",
            ErrorKind::Obfuscation => "obfuscation",
            ErrorKind::Git => "git",
            ErrorKind::CiCd => "cicd",
            ErrorKind::Custom => "custom",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One observation from a validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub kind: ErrorKind,
    pub risk: RiskLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub educational_note: Option<String>,
    /// Byte range in the original command the finding refers to.
    pub span: Range<usize>,
    /// Identifier of the rule or check that raised the finding.
    pub rule_id: String,
}

impl Finding {
    pub fn new(
        kind: ErrorKind,
        risk: RiskLevel,
        rule_id: impl Into<String>,
        message: impl Into<String>,
        span: Range<usize>,
    ) -> Self {
        Self {
            kind,
            risk,
            message: message.into(),
            suggestion: None,
            educational_note: None,
            span,
            rule_id: rule_id.into(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.educational_note = Some(note.into());
        self
    }

    /// Re-tag a finding that came out of a decoded payload layer.
    pub fn into_obfuscation(mut self) -> Self {
        self.kind = ErrorKind::Obfuscation;
        self
    }
}

/// Immutable outcome of one validation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    findings: Vec<Finding>,
    aggregate_risk: RiskLevel,
    valid: bool,
    /// Set when the validation budget expired before all validators ran.
    incomplete: bool,
}

impl ValidationResult {
    pub fn new(findings: Vec<Finding>) -> Self {
        Self::with_completeness(findings, false)
    }

    pub fn with_completeness(findings: Vec<Finding>, incomplete: bool) -> Self {
        let aggregate_risk = findings
            .iter()
            .map(|finding| finding.risk)
            .max()
            .unwrap_or(RiskLevel::Low);
        let valid = !findings.iter().any(|finding| {
            finding.kind == ErrorKind::Syntax || finding.risk == RiskLevel::Critical
        });
        Self {
            findings,
            aggregate_risk,
            valid,
            incomplete,
        }
    }

    pub fn clean() -> Self {
        Self::new(Vec::new())
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn aggregate_risk(&self) -> RiskLevel {
        self.aggregate_risk
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        self.findings.iter().any(|finding| finding.kind == kind)
    }

    /// Findings grouped by descending risk, for display.
    pub fn by_risk_descending(&self) -> Vec<&Finding> {
        let mut sorted: Vec<&Finding> = self.findings.iter().collect();
        sorted.sort_by(|a, b| b.risk.cmp(&a.risk));
        sorted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_levels_are_totally_ordered() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn aggregate_is_max_over_findings() {
        let result = ValidationResult::new(vec![
            Finding::new(ErrorKind::Safety, RiskLevel::Medium, "a", "m", 0..1),
            Finding::new(ErrorKind::Git, RiskLevel::High, "b", "m", 0..1),
            Finding::new(ErrorKind::Custom, RiskLevel::Low, "c", "m", 0..1),
        ]);
        assert_eq!(result.aggregate_risk(), RiskLevel::High);
    }

    #[test]
    fn empty_result_is_low_and_valid() {
        let result = ValidationResult::clean();
        assert_eq!(result.aggregate_risk(), RiskLevel::Low);
        assert!(result.is_valid());
        assert!(!result.is_incomplete());
    }

    #[test]
    fn syntax_finding_invalidates() {
        let result = ValidationResult::new(vec![Finding::new(
            ErrorKind::Syntax,
            RiskLevel::Medium,
            "syntax.empty",
            "empty command",
            0..0,
        )]);
        assert!(!result.is_valid());
    }

    #[test]
    fn critical_safety_finding_invalidates() {
        let result = ValidationResult::new(vec![Finding::new(
            ErrorKind::Safety,
            RiskLevel::Critical,
            "safety.rm_root",
            "recursive delete of root",
            0..8,
        )]);
        assert!(!result.is_valid());
        assert_eq!(result.aggregate_risk(), RiskLevel::Critical);
    }

    #[test]
    fn risk_serializes_lowercase() {
        let json = serde_json::to_string(&RiskLevel::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let kind = serde_json::to_string(&ErrorKind::CiCd).unwrap();
        assert_eq!(kind, "\"cicd\"");
    }
}
