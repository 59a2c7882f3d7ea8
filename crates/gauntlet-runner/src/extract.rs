//! Generic error extraction
//!
//! Tool-specific parsers (compiler, test runner, linter) plug in through
//! [`OutputParser`]. The generic parser here is the fallback used when no
//! nested structured document is present.

use gauntlet_core::{ExtractedError, Extraction, OutputLine};
use regex::Regex;
use std::sync::OnceLock;

/// Upper bound on errors kept in one extraction
pub const MAX_EXTRACTED_ERRORS: usize = 50;

/// Turns captured output into an [`Extraction`]
pub trait OutputParser: Send + Sync {
    fn name(&self) -> &str;

    fn extract(&self, lines: &[OutputLine], exit_code: i32) -> Extraction;
}

fn location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:-->\s*)?(?P<file>[^\s:]+\.[A-Za-z0-9]+):(?P<line>\d+)(?::(?P<col>\d+))?:?\s*(?P<msg>.*)$")
            .expect("location pattern is valid")
    })
}

fn error_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(error|errors|failed|failure|panicked|fatal)\b")
            .expect("error pattern is valid")
    })
}

fn zero_errors_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(0|no) (errors|failures|failed)\b").expect("zero pattern is valid")
    })
}

/// Line-oriented extraction that works on any tool's output
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericParser;

impl GenericParser {
    fn classify(line: &str) -> Option<ExtractedError> {
        let text = line.trim();
        if text.is_empty() || zero_errors_re().is_match(text) {
            return None;
        }

        if let Some(caps) = location_re().captures(text) {
            let message = caps
                .name("msg")
                .map(|m| m.as_str().trim().to_string())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| text.to_string());
            return Some(ExtractedError {
                file: caps.name("file").map(|m| m.as_str().to_string()),
                line: caps.name("line").and_then(|m| m.as_str().parse().ok()),
                column: caps.name("col").and_then(|m| m.as_str().parse().ok()),
                message,
            });
        }

        if error_re().is_match(text) {
            return Some(ExtractedError::message(text));
        }
        None
    }
}

impl OutputParser for GenericParser {
    fn name(&self) -> &str {
        "generic"
    }

    fn extract(&self, lines: &[OutputLine], exit_code: i32) -> Extraction {
        let mut errors = Vec::new();
        let mut total = 0usize;

        for line in lines {
            if let Some(error) = Self::classify(&line.text) {
                total += 1;
                if errors.len() < MAX_EXTRACTED_ERRORS {
                    errors.push(error);
                }
            }
        }

        let summary = match (exit_code, total) {
            (0, 0) => "passed".to_string(),
            (0, n) => format!("passed with {} diagnostic(s)", n),
            (code, 0) => format!("exited with code {}, no errors recognized", code),
            (code, n) => format!("exited with code {}, {} error(s)", code, n),
        };

        Extraction {
            summary,
            error_count: total,
            errors,
        }
    }
}
