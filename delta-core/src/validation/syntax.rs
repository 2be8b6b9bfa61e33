//! Single-pass syntax checker for command lines.
//!
//! Walks the raw line once, tracking quote and bracket state the same way
//! the execution-side tokenizer does, and reports structural problems as
//! findings with byte spans. The checker never executes subshells and never
//! expands variables; it only looks at the text.

use crate::validation::risk::{ErrorKind, Finding, RiskLevel, ValidationResult};

const RULE_EMPTY: &str = "syntax.empty_command";
const RULE_UNMATCHED_QUOTE: &str = "syntax.unmatched_quote";
const RULE_UNMATCHED_BRACKET: &str = "syntax.unmatched_bracket";
const RULE_DANGLING_PIPE: &str = "syntax.dangling_pipe";
const RULE_EMPTY_PIPELINE: &str = "syntax.empty_pipeline_segment";
const RULE_MISSING_REDIRECT_TARGET: &str = "syntax.missing_redirect_target";
const RULE_STRAY_OPERATOR: &str = "syntax.stray_operator";

/// Check one command line and return syntax findings only.
pub fn check(command: &str) -> ValidationResult {
    ValidationResult::new(findings(command))
}

/// Raw findings, for callers that combine several validators.
pub fn findings(command: &str) -> Vec<Finding> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return vec![Finding::new(
            ErrorKind::Syntax,
            RiskLevel::Medium,
            RULE_EMPTY,
            "empty command",
            0..0,
        )];
    }

    let mut findings = Vec::new();
    let mut scan = Scanner::new(command);
    scan.run(&mut findings);
    scan.finish(&mut findings);
    findings
}

/// Forward-scan state over the raw bytes of the line.
struct Scanner<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    /// Opening byte offsets of unclosed `(`, `{`, `[`.
    bracket_stack: Vec<(usize, u8)>,
    /// Offset of an unclosed quote and its quote character.
    open_quote: Option<(usize, u8)>,
    /// Last operator seen with no command text after it yet.
    pending_operator: Option<(usize, usize, OperatorKind)>,
    /// Whether any command text has appeared since the last operator.
    saw_word_since_operator: bool,
    /// Whether any command text has appeared at all.
    saw_any_word: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OperatorKind {
    Pipe,
    Logical,
    Redirect,
    Control,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            bracket_stack: Vec::new(),
            open_quote: None,
            pending_operator: None,
            saw_word_since_operator: false,
            saw_any_word: false,
        }
    }

    fn run(&mut self, findings: &mut Vec<Finding>) {
        while self.pos < self.bytes.len() {
            let byte = self.bytes[self.pos];

            if let Some((_, quote)) = self.open_quote {
                // Backslash escapes are honoured inside double quotes only.
                if quote == b'"' && byte == b'\\' {
                    self.pos = (self.pos + 2).min(self.bytes.len());
                    continue;
                }
                if byte == quote {
                    self.open_quote = None;
                }
                self.pos += 1;
                // Quoted text counts as command text.
                self.word();
                continue;
            }

            match byte {
                b'\\' => {
                    self.pos = (self.pos + 2).min(self.bytes.len());
                    self.word();
                }
                b'\'' | b'"' => {
                    self.open_quote = Some((self.pos, byte));
                    self.pos += 1;
                }
                b'(' | b'{' | b'[' => {
                    self.bracket_stack.push((self.pos, byte));
                    self.pos += 1;
                }
                b')' | b'}' | b']' => {
                    let expected = match byte {
                        b')' => b'(',
                        b'}' => b'{',
                        _ => b'[',
                    };
                    match self.bracket_stack.pop() {
                        Some((_, open)) if open == expected => {}
                        _ => findings.push(
                            Finding::new(
                                ErrorKind::Syntax,
                                RiskLevel::Medium,
                                RULE_UNMATCHED_BRACKET,
                                format!("unmatched closing '{}'", byte as char),
                                self.pos..self.pos + 1,
                            )
                            .with_suggestion("remove the bracket or add its opening pair"),
                        ),
                    }
                    self.pos += 1;
                    self.word();
                }
                b'|' => self.operator(findings, OperatorKind::Pipe),
                b'&' => self.operator(findings, OperatorKind::Logical),
                b'>' | b'<' => self.operator(findings, OperatorKind::Redirect),
                b';' => self.operator(findings, OperatorKind::Control),
                c if c.is_ascii_whitespace() => self.pos += 1,
                _ => {
                    self.pos += 1;
                    self.word();
                }
            }
        }
    }

    /// Mark that command text appeared, resolving any pending operator.
    fn word(&mut self) {
        self.saw_any_word = true;
        self.saw_word_since_operator = true;
        self.pending_operator = None;
    }

    fn operator(&mut self, findings: &mut Vec<Finding>, kind: OperatorKind) {
        let start = self.pos;
        let byte = self.bytes[self.pos];
        let mut end = self.pos + 1;

        // Coalesce doubled operators: ||, &&, >>, <<.
        if end < self.bytes.len() && self.bytes[end] == byte && byte != b';' {
            end += 1;
        }
        // `2>`, `&>` style redirects are already covered by the base byte.

        let doubled = end - start == 2;
        let resolved = match (kind, doubled) {
            (OperatorKind::Pipe, true) => OperatorKind::Logical, // `||`
            (OperatorKind::Logical, false) => {
                // A single trailing `&` backgrounds the job; that is fine.
                self.pos = end;
                self.saw_word_since_operator = false;
                self.pending_operator = None;
                return;
            }
            (kind, _) => kind,
        };

        if !self.saw_word_since_operator && resolved != OperatorKind::Redirect {
            // Operator with no left-hand command: `| grep x`, `&& make`.
            let (rule, message, risk) = if resolved == OperatorKind::Pipe {
                (
                    RULE_EMPTY_PIPELINE,
                    "pipe with no command on its left-hand side",
                    RiskLevel::High,
                )
            } else {
                (
                    RULE_STRAY_OPERATOR,
                    "control operator with no command before it",
                    RiskLevel::Medium,
                )
            };
            findings.push(Finding::new(
                ErrorKind::Syntax,
                risk,
                rule,
                message,
                start..end,
            ));
        }

        self.pending_operator = Some((start, end, resolved));
        self.saw_word_since_operator = false;
        self.pos = end;
    }

    fn finish(&mut self, findings: &mut Vec<Finding>) {
        if let Some((offset, quote)) = self.open_quote {
            findings.push(
                Finding::new(
                    ErrorKind::Syntax,
                    RiskLevel::High,
                    RULE_UNMATCHED_QUOTE,
                    format!("unmatched {} quote", quote_name(quote)),
                    offset..self.src.len(),
                )
                .with_suggestion(format!("close the {} quote", quote_name(quote))),
            );
        }

        for (offset, bracket) in self.bracket_stack.drain(..) {
            findings.push(Finding::new(
                ErrorKind::Syntax,
                RiskLevel::Medium,
                RULE_UNMATCHED_BRACKET,
                format!("unmatched opening '{}'", bracket as char),
                offset..offset + 1,
            ));
        }

        if let Some((start, end, kind)) = self.pending_operator.take() {
            let (rule, message, risk) = match kind {
                OperatorKind::Pipe => (
                    RULE_EMPTY_PIPELINE,
                    "pipeline has no right-hand command",
                    RiskLevel::High,
                ),
                OperatorKind::Logical => (
                    RULE_DANGLING_PIPE,
                    "logical operator has no right-hand command",
                    RiskLevel::Medium,
                ),
                OperatorKind::Redirect => (
                    RULE_MISSING_REDIRECT_TARGET,
                    "redirection operator without a target",
                    RiskLevel::Medium,
                ),
                OperatorKind::Control => (
                    RULE_STRAY_OPERATOR,
                    "trailing control operator",
                    RiskLevel::Medium,
                ),
            };
            // A trailing `;` is legal shell; only flag it when nothing ran.
            if kind != OperatorKind::Control || !self.saw_any_word {
                findings.push(Finding::new(
                    ErrorKind::Syntax,
                    risk,
                    rule,
                    message,
                    start..end,
                ));
            }
        }
    }
}

fn quote_name(quote: u8) -> &'static str {
    if quote == b'"' { "double" } else { "single" }
}
