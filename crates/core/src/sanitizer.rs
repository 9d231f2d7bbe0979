//! Prompt sanitizer
//!
//! Static validation applied to untrusted text before it is embedded in a
//! model prompt. Checks run in a fixed order and the first violation wins:
//! length, control characters, injection patterns, base64 payloads. The
//! contract is reject-or-pass: on success the original string is returned
//! unchanged, never rewritten or stripped.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Default ceiling for a single sanitized field. Call sites override this
/// per field via [`SanitizeOptions`].
pub const DEFAULT_MAX_LENGTH: usize = 4_000;

/// Minimum run length before a base64-alphabet sequence is even considered
/// suspicious. Short incidental matches (`"YQ=="`) stay below this.
const BASE64_MIN_LENGTH: usize = 40;

/// Shannon entropy floor (bits per character) for a base64 run to count as
/// a payload rather than a repeated filler string.
const BASE64_MIN_ENTROPY: f64 = 4.0;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SanitizeViolation {
    #[error("Input too long in {field} (max: {max} characters)")]
    TooLong { field: String, max: usize },
    #[error("Invalid control characters detected in {field}")]
    ControlCharacters { field: String },
    #[error("Prompt injection pattern detected in {field}: {}", patterns.join(", "))]
    InjectionPattern { field: String, patterns: Vec<String> },
    #[error("Suspicious base64 payload detected in {field}")]
    Base64Payload { field: String },
}

impl SanitizeViolation {
    pub fn field(&self) -> &str {
        match self {
            Self::TooLong { field, .. }
            | Self::ControlCharacters { field }
            | Self::InjectionPattern { field, .. }
            | Self::Base64Payload { field } => field,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SanitizeOptions {
    pub max_length: usize,
    pub allow_base64: bool,
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self { max_length: DEFAULT_MAX_LENGTH, allow_base64: false }
    }
}

impl SanitizeOptions {
    pub fn with_max_length(max_length: usize) -> Self {
        Self { max_length, ..Self::default() }
    }
}

/// Heuristic injection patterns, English and Japanese. Labels are the
/// machine-readable category carried in the violation; the raw matched
/// text is deliberately not echoed back.
fn injection_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            [
                (
                    "instruction_override",
                    r"(?i)ignore\s+(all\s+)?(previous|prior|above|earlier)\s+instructions",
                ),
                ("rule_disregard", r"(?i)disregard\s+(all\s+)?(the\s+)?(rules|instructions|above)"),
                ("role_spoof_system", r"(?im)^\s*system\s*:"),
                ("role_spoof_assistant", r"(?im)^\s*assistant\s*:"),
                ("prompt_reveal", r"(?i)reveal\s+(your\s+)?(system\s+|hidden\s+)?prompt"),
                ("instruction_replace", r"(?i)your\s+new\s+instructions\s+are"),
                ("instruction_override_ja", r"(以前|これまで|前|上記)の指示を(すべて)?無視"),
                ("rule_disregard_ja", r"ルール(を|は)?(無視|破って|忘れて)"),
                ("role_spoof_user_ja", r"(?m)^\s*ユーザー\s*[:：]"),
                ("role_spoof_system_ja", r"(?m)^\s*システム\s*[:：]"),
            ]
            .into_iter()
            .map(|(label, pattern)| {
                (label, Regex::new(pattern).expect("injection pattern must compile"))
            })
            .collect()
        })
        .as_slice()
}

fn base64_run_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[A-Za-z0-9+/]{24,}={0,2}").expect("base64 run pattern"))
}

/// Validate `text` for use inside a prompt. Returns the input unchanged on
/// success; the first violated check wins.
pub fn sanitize<'a>(
    text: &'a str,
    field: &str,
    options: &SanitizeOptions,
) -> Result<&'a str, SanitizeViolation> {
    if text.chars().count() > options.max_length {
        return Err(SanitizeViolation::TooLong {
            field: field.to_string(),
            max: options.max_length,
        });
    }

    // Newline and tab are legitimate in free text; every other C0 control
    // byte (NUL included) is rejected outright.
    if text.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
        return Err(SanitizeViolation::ControlCharacters { field: field.to_string() });
    }

    let matched: Vec<String> = injection_patterns()
        .iter()
        .filter(|(_, pattern)| pattern.is_match(text))
        .map(|(label, _)| (*label).to_string())
        .collect();
    if !matched.is_empty() {
        return Err(SanitizeViolation::InjectionPattern {
            field: field.to_string(),
            patterns: matched,
        });
    }

    if !options.allow_base64 {
        for run in base64_run_pattern().find_iter(text) {
            let candidate = run.as_str().trim_end_matches('=');
            if candidate.len() >= BASE64_MIN_LENGTH
                && shannon_entropy(candidate) >= BASE64_MIN_ENTROPY
            {
                return Err(SanitizeViolation::Base64Payload { field: field.to_string() });
            }
        }
    }

    Ok(text)
}

/// Apply [`sanitize`] to an ordered list of named fields, reporting the
/// first field that fails.
pub fn sanitize_multiple<'a>(
    fields: &[(&str, &'a str)],
    options: &SanitizeOptions,
) -> Result<(), SanitizeViolation> {
    for (field, text) in fields {
        sanitize(text, field, options)?;
    }
    Ok(())
}

fn shannon_entropy(text: &str) -> f64 {
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return 0.0;
    }

    let mut counts = [0usize; 256];
    for byte in bytes {
        counts[*byte as usize] += 1;
    }

    let total = bytes.len() as f64;
    counts
        .iter()
        .filter(|count| **count > 0)
        .map(|count| {
            let p = *count as f64 / total;
            -p * p.log2()
        })
        .sum()
}
