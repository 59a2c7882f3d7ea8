//! Core type definitions for gauntlet runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Sentinel content hash used outside a version-controlled tree
pub const UNKNOWN_CONTENT_HASH: &str = "unknown";

/// Identity of the full working-tree content
///
/// The sentinel value `unknown` means caching is disabled for the call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(hash: impl Into<String>) -> Self {
        let hash = hash.into();
        if hash.trim().is_empty() {
            Self::unknown()
        } else {
            Self(hash)
        }
    }

    pub fn unknown() -> Self {
        Self(UNKNOWN_CONTENT_HASH.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_CONTENT_HASH
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix, used for log directory names
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(idx, _)| idx)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stream a captured line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line of captured process output, ANSI-stripped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputLine {
    pub timestamp: DateTime<Utc>,
    pub stream: Stream,
    pub text: String,
}

impl OutputLine {
    pub fn new(stream: Stream, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            text: text.into(),
        }
    }

    /// Render as `<iso timestamp> [stream] text`
    pub fn render(&self) -> String {
        format!(
            "{} [{}] {}",
            self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            self.stream,
            self.text
        )
    }
}

/// A single diagnostic pulled out of tool output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub message: String,
}

impl ExtractedError {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            file: None,
            line: None,
            column: None,
            message: message.into(),
        }
    }
}

/// Structured summary extracted from a command's output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    pub summary: String,
    #[serde(default)]
    pub error_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ExtractedError>,
}

/// Summary used for steps killed by a failing sibling
pub const FAIL_FAST_SUMMARY: &str = "terminated due to fail-fast";

impl Extraction {
    pub fn new(summary: impl Into<String>, errors: Vec<ExtractedError>) -> Self {
        Self {
            summary: summary.into(),
            error_count: errors.len(),
            errors,
        }
    }

    /// Extraction for a step killed because a sibling failed
    pub fn terminated_by_fail_fast(failed_sibling: &str) -> Self {
        Self::new(
            FAIL_FAST_SUMMARY,
            vec![ExtractedError::message(format!(
                "{FAIL_FAST_SUMMARY}: sibling step `{failed_sibling}` failed"
            ))],
        )
    }

    /// Extraction for a step whose process could not be started
    pub fn spawn_failure(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            format!("failed to spawn: {reason}"),
            vec![ExtractedError::message(reason)],
        )
    }

    pub fn is_fail_fast_termination(&self) -> bool {
        self.summary == FAIL_FAST_SUMMARY
    }

    /// True when there is nothing worth persisting
    pub fn is_trivial(&self) -> bool {
        self.errors.is_empty() && self.error_count == 0
    }
}

/// Persisted cache entry for a single successful command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub command: String,
    /// Working directory relative to the repository root
    pub cwd: String,
    pub timestamp: DateTime<Utc>,
    pub exit_code: i32,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<Extraction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_file_refs: Vec<PathBuf>,
    /// Set on records served from the cache, never persisted
    #[serde(skip)]
    pub from_cache: bool,
}

/// Result of one step within a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    /// Command that actually ran (unwrapped from a nested invocation)
    pub command: String,
    /// Command as configured, when it differs from `command`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_command: Option<String>,
    pub passed: bool,
    pub exit_code: i32,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_output_ref: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<Extraction>,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub terminated: bool,
}

impl StepResult {
    /// Build a step result from a cached run record
    pub fn from_cached(name: impl Into<String>, record: &RunRecord) -> Self {
        Self {
            name: name.into(),
            command: record.command.clone(),
            requested_command: None,
            passed: record.exit_code == 0,
            exit_code: record.exit_code,
            duration_seconds: record.duration_seconds,
            captured_output_ref: record.output_file_refs.first().cloned(),
            extraction: record.extraction.clone(),
            cached: true,
            terminated: false,
        }
    }

    /// Whether the configured command was unwrapped from a nested invocation
    pub fn is_unwrapped(&self) -> bool {
        self.requested_command
            .as_deref()
            .is_some_and(|requested| requested != self.command)
    }
}

/// Result of one phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub name: String,
    pub passed: bool,
    pub steps: Vec<StepResult>,
    pub duration_seconds: f64,
}

/// Result of a full pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub passed: bool,
    pub timestamp: DateTime<Utc>,
    pub content_hash: ContentHash,
    pub phases: Vec<PhaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step_output: Option<String>,
    #[serde(default)]
    pub cached: bool,
}

impl PipelineResult {
    pub fn duration_seconds(&self) -> f64 {
        self.phases.iter().map(|p| p.duration_seconds).sum()
    }

    pub fn failed_step(&self) -> Option<&StepResult> {
        let name = self.failed_step_name.as_deref()?;
        self.phases
            .iter()
            .flat_map(|p| p.steps.iter())
            .find(|s| s.name == name)
    }
}

/// A configured step: one shell command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub command: String,
    /// Working directory relative to the repository root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cwd: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// A configured phase: steps run together, gated on the previous phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_parallel() -> bool {
    true
}

impl Phase {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            parallel: true,
            steps,
        }
    }

    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_content_hash_is_unknown() {
        assert!(ContentHash::new("").is_unknown());
        assert!(ContentHash::new("unknown").is_unknown());
        assert!(!ContentHash::new("4b825dc6").is_unknown());
    }

    #[test]
    fn test_content_hash_short() {
        let hash = ContentHash::new("0123456789abcdef0123");
        assert_eq!(hash.short(), "0123456789ab");
        assert_eq!(ContentHash::new("abc").short(), "abc");
    }

    #[test]
    fn test_fail_fast_extraction_is_not_empty() {
        let extraction = Extraction::terminated_by_fail_fast("lint");
        assert!(extraction.is_fail_fast_termination());
        assert!(!extraction.is_trivial());
        assert_eq!(extraction.error_count, 1);
        assert!(extraction.errors[0].message.contains("lint"));
    }

    #[test]
    fn test_run_record_json_round_trip() {
        let record = RunRecord {
            command: "cargo test".to_string(),
            cwd: "crates/core".to_string(),
            timestamp: Utc::now(),
            exit_code: 0,
            duration_seconds: 1.5,
            extraction: Some(Extraction::new(
                "1 warning",
                vec![ExtractedError::message("unused import")],
            )),
            output_file_refs: vec![PathBuf::from("/tmp/gauntlet/run.log")],
            from_cache: true,
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("from_cache"));

        let parsed: RunRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.command, record.command);
        assert_eq!(parsed.extraction, record.extraction);
        assert!(!parsed.from_cache);
    }

    #[test]
    fn test_step_result_unwrapped() {
        let mut step = StepResult::from_cached(
            "test",
            &RunRecord {
                command: "cargo test".to_string(),
                cwd: ".".to_string(),
                timestamp: Utc::now(),
                exit_code: 0,
                duration_seconds: 0.1,
                extraction: None,
                output_file_refs: Vec::new(),
                from_cache: false,
            },
        );
        assert!(step.cached);
        assert!(!step.is_unwrapped());

        step.requested_command = Some("gauntlet run -- cargo test".to_string());
        assert!(step.is_unwrapped());
    }

    #[test]
    fn test_failed_step_is_found_by_name() {
        let step = |name: &str, passed: bool| StepResult {
            name: name.to_string(),
            command: format!("run {}", name),
            requested_command: None,
            passed,
            exit_code: if passed { 0 } else { 2 },
            duration_seconds: 0.5,
            captured_output_ref: None,
            extraction: None,
            cached: false,
            terminated: false,
        };
        let mut result = PipelineResult {
            passed: false,
            timestamp: Utc::now(),
            content_hash: ContentHash::new("tree"),
            phases: vec![
                PhaseResult {
                    name: "check".to_string(),
                    passed: true,
                    steps: vec![step("fmt", true)],
                    duration_seconds: 0.5,
                },
                PhaseResult {
                    name: "test".to_string(),
                    passed: false,
                    steps: vec![step("unit", false)],
                    duration_seconds: 0.5,
                },
            ],
            failed_step_name: Some("unit".to_string()),
            failed_step_output: None,
            cached: false,
        };

        assert_eq!(result.failed_step().map(|s| s.exit_code), Some(2));
        result.failed_step_name = None;
        assert!(result.failed_step().is_none());
    }

    #[test]
    fn test_phase_defaults_to_parallel() {
        let phase: Phase = toml::from_str("name = \"lint\"").unwrap();
        assert!(phase.parallel);
        assert!(phase.steps.is_empty());
    }
}
