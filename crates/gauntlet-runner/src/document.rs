//! Structured result document
//!
//! The document is YAML between two `---` lines, written to stdout in full
//! before anything goes to stderr. Another gauntlet process that captures
//! this stdout can recognise and unwrap it, see [`crate::merger`].

use chrono::{DateTime, Utc};
use gauntlet_core::{ContentHash, Extraction, PhaseResult, PipelineResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::cache_key::TOOL_NAMESPACE;

/// Line that opens and closes a document
pub const DOCUMENT_DELIMITER: &str = "---";

/// A document emitted by this tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultDocument {
    Run(RunDocument),
    Pipeline(PipelineDocument),
}

/// Result of `gauntlet run`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDocument {
    pub tool: String,
    /// Command that actually ran
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_command: Option<String>,
    pub cwd: String,
    pub exit_code: i32,
    pub duration_seconds: f64,
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<Extraction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_files: Vec<PathBuf>,
}

/// Result of `gauntlet validate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDocument {
    pub tool: String,
    pub passed: bool,
    pub timestamp: DateTime<Utc>,
    pub content_hash: ContentHash,
    pub duration_seconds: f64,
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step_output: Option<String>,
    #[serde(default)]
    pub phases: Vec<PhaseResult>,
}

impl From<&PipelineResult> for PipelineDocument {
    fn from(result: &PipelineResult) -> Self {
        Self {
            tool: TOOL_NAMESPACE.to_string(),
            passed: result.passed,
            timestamp: result.timestamp,
            content_hash: result.content_hash.clone(),
            duration_seconds: result.duration_seconds(),
            cached: result.cached,
            failed_step_name: result.failed_step_name.clone(),
            failed_step_output: result.failed_step_output.clone(),
            phases: result.phases.clone(),
        }
    }
}

impl From<PipelineDocument> for PipelineResult {
    fn from(doc: PipelineDocument) -> Self {
        Self {
            passed: doc.passed,
            timestamp: doc.timestamp,
            content_hash: doc.content_hash,
            phases: doc.phases,
            failed_step_name: doc.failed_step_name,
            failed_step_output: doc.failed_step_output,
            cached: doc.cached,
        }
    }
}

/// Outcome of looking for a document in captured stdout
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// A delimited block parsed as one of our documents
    Parsed(ResultDocument),
    /// Delimited YAML was found, but it belongs to something else
    NotOurFormat,
    /// A block looked like ours (or was not YAML at all) and failed to parse
    Malformed(String),
    /// No delimiter line in the output
    Absent,
}

/// Render a document with its delimiters
pub fn render(document: &ResultDocument) -> Result<String, serde_yaml::Error> {
    let body = serde_yaml::to_string(document)?;
    let mut out = String::with_capacity(body.len() + 8);
    out.push_str(DOCUMENT_DELIMITER);
    out.push('\n');
    out.push_str(&body);
    if !body.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(DOCUMENT_DELIMITER);
    out.push('\n');
    Ok(out)
}

/// Find and parse the first of our documents in `stdout`
///
/// Stage one is syntactic: locate delimiter-bounded blocks. Stage two is
/// semantic: the block must be YAML carrying `tool: gauntlet` and must
/// deserialize into a known document kind.
pub fn parse(stdout: &str) -> ParseOutcome {
    let lines: Vec<&str> = stdout.lines().collect();
    let delimiters: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.trim_end() == DOCUMENT_DELIMITER)
        .map(|(idx, _)| idx)
        .collect();

    if delimiters.is_empty() {
        return ParseOutcome::Absent;
    }
    if delimiters.len() == 1 {
        return ParseOutcome::Malformed("unterminated document".to_string());
    }

    let mut fallback = ParseOutcome::NotOurFormat;
    for pair in delimiters.windows(2) {
        let block = lines[pair[0] + 1..pair[1]].join("\n");
        match parse_block(&block) {
            ParseOutcome::Parsed(doc) => return ParseOutcome::Parsed(doc),
            ParseOutcome::Malformed(reason) => fallback = ParseOutcome::Malformed(reason),
            _ => {}
        }
    }
    fallback
}

fn parse_block(block: &str) -> ParseOutcome {
    let value: serde_yaml::Value = match serde_yaml::from_str(block) {
        Ok(value) => value,
        Err(e) => return ParseOutcome::Malformed(e.to_string()),
    };

    let is_ours = value
        .get("tool")
        .and_then(|t| t.as_str())
        .is_some_and(|t| t == TOOL_NAMESPACE);
    if !is_ours {
        return ParseOutcome::NotOurFormat;
    }

    match serde_yaml::from_value::<ResultDocument>(value) {
        Ok(doc) => ParseOutcome::Parsed(doc),
        Err(e) => ParseOutcome::Malformed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_core::ExtractedError;

    fn run_doc() -> RunDocument {
        RunDocument {
            tool: TOOL_NAMESPACE.to_string(),
            command: "cargo test".to_string(),
            requested_command: None,
            cwd: ".".to_string(),
            exit_code: 1,
            duration_seconds: 2.5,
            cached: false,
            content_hash: Some(ContentHash::new("abc123")),
            extraction: Some(Extraction::new(
                "1 error",
                vec![ExtractedError::message("test foo failed")],
            )),
            output_files: Vec::new(),
        }
    }

    #[test]
    fn test_render_is_delimited() {
        let text = render(&ResultDocument::Run(run_doc())).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.first(), Some(&"---"));
        assert_eq!(lines.last(), Some(&"---"));
        assert!(text.contains("kind: run"));
        assert!(text.contains("command: cargo test"));
    }

    #[test]
    fn test_parse_rendered_document_among_noise() {
        let doc = ResultDocument::Run(run_doc());
        let stdout = format!("Compiling foo\n{}trailing text\n", render(&doc).unwrap());
        assert_eq!(parse(&stdout), ParseOutcome::Parsed(doc));
    }

    #[test]
    fn test_absent() {
        assert_eq!(parse("just some output\nno delimiters"), ParseOutcome::Absent);
    }

    #[test]
    fn test_foreign_front_matter_is_not_ours() {
        let stdout = "---\ntitle: Release notes\nauthor: someone\n---\n";
        assert_eq!(parse(stdout), ParseOutcome::NotOurFormat);
    }

    #[test]
    fn test_our_tool_with_bad_schema_is_malformed() {
        let stdout = "---\ntool: gauntlet\nkind: run\ncommand: [unclosed\n---\n";
        assert!(matches!(parse(stdout), ParseOutcome::Malformed(_)));

        let stdout = "---\ntool: gauntlet\nkind: teleport\n---\n";
        assert!(matches!(parse(stdout), ParseOutcome::Malformed(_)));
    }

    #[test]
    fn test_unterminated() {
        assert!(matches!(parse("---\ntool: gauntlet\n"), ParseOutcome::Malformed(_)));
    }
}
