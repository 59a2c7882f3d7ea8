//! Nested invocation handling
//!
//! When a step's command is itself a gauntlet invocation, its stdout carries
//! a structured document. The inner document knows which command really
//! ran and what it produced; the outer process knows how long the whole
//! thing took and what the caller saw as exit code. Merging keeps each
//! side authoritative for what it observed.

use gauntlet_core::{ExtractedError, Extraction, StepResult};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::document::{self, ParseOutcome, PipelineDocument, ResultDocument};
use crate::executor::CapturedOutput;
use crate::extract::{GenericParser, OutputParser, MAX_EXTRACTED_ERRORS};

/// Which kind of nested document was unwrapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedKind {
    Run,
    Pipeline,
}

/// Outer observation merged with any inner document
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRun {
    /// Command that actually ran
    pub command: String,
    /// The outer command, set only when it differs from `command`
    pub requested_command: Option<String>,
    pub exit_code: i32,
    pub duration_seconds: f64,
    pub extraction: Option<Extraction>,
    pub nested: Option<NestedKind>,
    pub output_file_refs: Vec<PathBuf>,
}

impl MergedRun {
    pub fn is_unwrapped(&self) -> bool {
        self.requested_command
            .as_deref()
            .is_some_and(|requested| requested != self.command)
    }
}

impl From<&StepResult> for MergedRun {
    fn from(step: &StepResult) -> Self {
        Self {
            command: step.command.clone(),
            requested_command: step.requested_command.clone(),
            exit_code: step.exit_code,
            duration_seconds: step.duration_seconds,
            extraction: step.extraction.clone(),
            nested: None,
            output_file_refs: step.captured_output_ref.iter().cloned().collect(),
        }
    }
}

/// Unwraps nested documents, falling back to generic extraction
#[derive(Clone)]
pub struct OutputMerger {
    parser: Arc<dyn OutputParser>,
}

impl Default for OutputMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputMerger {
    pub fn new() -> Self {
        Self {
            parser: Arc::new(GenericParser),
        }
    }

    pub fn with_parser(parser: Arc<dyn OutputParser>) -> Self {
        Self { parser }
    }

    /// Merge an outer observation with whatever its stdout contains
    pub fn merge(
        &self,
        outer_command: &str,
        captured: &CapturedOutput,
        outer_exit_code: i32,
        outer_duration_seconds: f64,
    ) -> MergedRun {
        let mut merged = MergedRun {
            command: outer_command.to_string(),
            requested_command: None,
            exit_code: outer_exit_code,
            duration_seconds: outer_duration_seconds,
            extraction: None,
            nested: None,
            output_file_refs: Vec::new(),
        };

        match document::parse(&captured.stdout) {
            ParseOutcome::Parsed(ResultDocument::Run(inner)) => {
                if inner.command != outer_command {
                    debug!(
                        outer = outer_command,
                        inner = %inner.command,
                        "Unwrapped nested run"
                    );
                    merged.requested_command = Some(outer_command.to_string());
                    merged.command = inner.command;
                }
                merged.extraction = inner.extraction;
                merged.output_file_refs = inner.output_files;
                merged.nested = Some(NestedKind::Run);
            }
            ParseOutcome::Parsed(ResultDocument::Pipeline(inner)) => {
                merged.extraction = Some(pipeline_extraction(&inner));
                merged.nested = Some(NestedKind::Pipeline);
            }
            ParseOutcome::Absent => {
                merged.extraction = Some(self.parser.extract(&captured.lines, outer_exit_code));
            }
            ParseOutcome::NotOurFormat => {
                debug!(
                    parser = self.parser.name(),
                    "Delimited block is not a gauntlet document, falling back"
                );
                merged.extraction = Some(self.parser.extract(&captured.lines, outer_exit_code));
            }
            ParseOutcome::Malformed(reason) => {
                debug!(
                    %reason,
                    parser = self.parser.name(),
                    "Nested document failed to parse, falling back"
                );
                merged.extraction = Some(self.parser.extract(&captured.lines, outer_exit_code));
            }
        }

        merged
    }
}

/// Summarize a nested pipeline as one extraction
fn pipeline_extraction(doc: &PipelineDocument) -> Extraction {
    let mut errors = Vec::new();
    let mut total = 0usize;

    for step in doc.phases.iter().flat_map(|p| p.steps.iter()) {
        if step.passed {
            continue;
        }
        let Some(extraction) = &step.extraction else {
            total += 1;
            if errors.len() < MAX_EXTRACTED_ERRORS {
                errors.push(ExtractedError::message(format!(
                    "{}: exited with code {}",
                    step.name, step.exit_code
                )));
            }
            continue;
        };
        total += extraction.error_count.max(extraction.errors.len());
        for error in &extraction.errors {
            if errors.len() >= MAX_EXTRACTED_ERRORS {
                break;
            }
            let mut error = error.clone();
            error.message = format!("{}: {}", step.name, error.message);
            errors.push(error);
        }
    }

    let summary = if doc.passed {
        format!("nested pipeline passed ({} phases)", doc.phases.len())
    } else {
        match &doc.failed_step_name {
            Some(name) => format!("nested pipeline failed at step `{}`", name),
            None => "nested pipeline failed".to_string(),
        }
    };

    Extraction {
        summary,
        error_count: total,
        errors,
    }
}
