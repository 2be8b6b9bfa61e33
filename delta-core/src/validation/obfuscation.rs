//! Obfuscation decoder.
//!
//! Recognises common wrappings that hide a command's intent (base64 into a
//! shell, hex escapes, `${IFS}` splitting, character joins, `eval`/`bash -c`)
//! and unwraps them up to a bounded depth so the safety rules and domain
//! validators see the real payload. Decoded payloads are never executed.

use std::ops::Range;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::validation::risk::{ErrorKind, Finding, RiskLevel};

pub const RULE_DECODED_LAYER: &str = "obfuscation.decoded_layer";
pub const RULE_DEPTH_EXCEEDED: &str = "obfuscation.depth_exceeded";

/// One successfully peeled wrapper.
#[derive(Debug, Clone)]
pub struct DecodedLayer {
    /// The inner command text recovered from the wrapper.
    pub payload: String,
    /// Which wrapper was recognised, for the finding message.
    pub wrapper: &'static str,
    /// Where the wrapped payload sat in the text that was peeled.
    pub span: Range<usize>,
}

/// Result of unwrapping a command to its innermost payload.
#[derive(Debug, Clone, Default)]
pub struct Unwrapped {
    /// Layers in peel order, outermost first. Empty when nothing matched.
    pub layers: Vec<DecodedLayer>,
    /// Set when a wrapper was still recognisable at the recursion bound.
    pub depth_exceeded: bool,
}

impl Unwrapped {
    /// The innermost decoded payload, if any layer was peeled.
    pub fn innermost(&self) -> Option<&str> {
        self.layers.last().map(|layer| layer.payload.as_str())
    }

    /// Findings describing the wrappers themselves (intent hiding), plus the
    /// bound-exceeded marker when applicable.
    pub fn wrapper_findings(&self) -> Vec<Finding> {
        let mut findings: Vec<Finding> = self
            .layers
            .iter()
            .map(|layer| {
                Finding::new(
                    ErrorKind::Obfuscation,
                    RiskLevel::High,
                    RULE_DECODED_LAYER,
                    format!("command payload is hidden behind {}", layer.wrapper),
                    layer.span.clone(),
                )
                .with_note(
                    "wrapping a command this way hides its intent from review; \
                     the decoded payload was checked as if typed directly",
                )
            })
            .collect();

        if self.depth_exceeded {
            findings.push(Finding::new(
                ErrorKind::Obfuscation,
                RiskLevel::Critical,
                RULE_DEPTH_EXCEEDED,
                "obfuscation nested past the decoding bound; refusing to analyse further",
                0..0,
            ));
        }
        findings
    }
}

/// Peel wrappers off `command`, at most `max_depth` layers.
pub fn unwrap_layers(command: &str, max_depth: usize) -> Unwrapped {
    let mut result = Unwrapped::default();
    let mut current = command.to_string();

    for _ in 0..max_depth {
        match peel(&current) {
            Some(layer) => {
                current = layer.payload.clone();
                result.layers.push(layer);
            }
            None => return result,
        }
    }

    // The bound is reached; if yet another wrapper is recognisable, halt
    // decoding rather than growing the stack.
    result.depth_exceeded = peel(&current).is_some();
    result
}

/// Try each recogniser once, outermost-style wrappers first.
pub fn peel(command: &str) -> Option<DecodedLayer> {
    peel_eval(command)
        .or_else(|| peel_base64(command))
        .or_else(|| peel_hex(command))
        .or_else(|| peel_ifs(command))
        .or_else(|| peel_char_join(command))
}

static EVAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:\beval\b|\b(?:bash|sh|zsh)\s+-[a-z]*c)\s+(?:"([^"]+)"|'([^']+)')"#)
        .expect("eval wrapper regex")
});

fn peel_eval(command: &str) -> Option<DecodedLayer> {
    let caps = EVAL_RE.captures(command)?;
    let inner = caps.get(1).or_else(|| caps.get(2))?;
    Some(DecodedLayer {
        payload: inner.as_str().to_string(),
        wrapper: "an eval / shell -c indirection",
        span: inner.range(),
    })
}

static BASE64_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:echo|printf(?:\s+%s)?)\s+["']?([A-Za-z0-9+/]{8,}={0,2})["']?\s*\|\s*(?:base64|openssl\s+base64)\s+(?:-d|-D|--decode)\b"#,
    )
    .expect("base64 wrapper regex")
});

fn peel_base64(command: &str) -> Option<DecodedLayer> {
    let caps = BASE64_RE.captures(command)?;
    let encoded = caps.get(1)?;
    let bytes = BASE64.decode(encoded.as_str()).ok()?;
    let payload = String::from_utf8(bytes).ok()?;
    // Binary-looking payloads are not commands; ignore them.
    if payload.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
        return None;
    }
    Some(DecodedLayer {
        payload: payload.trim().to_string(),
        wrapper: "a base64-encoded payload fed to a decoder",
        span: encoded.range(),
    })
}

static HEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:\$')?((?:\\x[0-9a-fA-F]{2}){2,})'?"#).expect("hex escape regex"));

fn peel_hex(command: &str) -> Option<DecodedLayer> {
    let caps = HEX_RE.captures(command)?;
    let sequence = caps.get(1)?;
    let mut bytes = Vec::new();
    let text = sequence.as_str();
    let mut rest = text;
    while let Some(stripped) = rest.strip_prefix("\\x") {
        let (hex, tail) = stripped.split_at(2);
        bytes.push(u8::from_str_radix(hex, 16).ok()?);
        rest = tail;
    }
    let decoded = String::from_utf8(bytes).ok()?;

    // Splice the decoded text back into the surrounding command so rules see
    // the full line, not just the escaped fragment.
    let whole = caps.get(0)?;
    let mut payload = String::with_capacity(command.len());
    payload.push_str(&command[..whole.start()]);
    payload.push_str(&decoded);
    payload.push_str(&command[whole.end()..]);

    Some(DecodedLayer {
        payload,
        wrapper: "hex escape sequences",
        span: sequence.range(),
    })
}

fn peel_ifs(command: &str) -> Option<DecodedLayer> {
    if !command.contains("${IFS}") && !command.contains("$IFS") {
        return None;
    }
    let start = command.find("${IFS}").or_else(|| command.find("$IFS"))?;
    let payload = command.replace("${IFS}", " ").replace("$IFS", " ");
    Some(DecodedLayer {
        payload,
        wrapper: "IFS-based argument splitting",
        span: start..start + 4,
    })
}

static CHAR_JOIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:'[^']{1,2}'|"[^"]{1,2}"){3,}"#).expect("char join regex")
});

fn peel_char_join(command: &str) -> Option<DecodedLayer> {
    let matched = CHAR_JOIN_RE.find(command)?;
    let joined: String = matched
        .as_str()
        .chars()
        .filter(|c| *c != '\'' && *c != '"')
        .collect();

    let mut payload = String::with_capacity(command.len());
    payload.push_str(&command[..matched.start()]);
    payload.push_str(&joined);
    payload.push_str(&command[matched.end()..]);

    Some(DecodedLayer {
        payload,
        wrapper: "a character-by-character join",
        span: matched.range(),
    })
}
