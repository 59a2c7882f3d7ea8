//! Captured-output logs on disk
//!
//! Each executed step's lines go to `<log dir>/<hash prefix>/<phase>-<step>.jsonl`,
//! one JSON `OutputLine` per line, so a later cache hit can still show
//! `--head`/`--tail` output. A consolidated text log per pipeline is optional.
//! Every write here is fail-open.

use gauntlet_core::fail_open::fail_open;
use gauntlet_core::{ContentHash, GauntletError, OutputLine, PipelineResult, Result};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Name of the consolidated pipeline log inside a run directory
pub const CONSOLIDATED_LOG: &str = "pipeline.log";

/// Log directory for one content hash
#[derive(Debug, Clone)]
pub struct RunLog {
    dir: PathBuf,
}

impl RunLog {
    pub fn new(base: &Path, hash: &ContentHash) -> Self {
        Self {
            dir: base.join(hash.short()),
        }
    }

    pub fn step_path(&self, phase: &str, step: &str) -> PathBuf {
        self.dir
            .join(format!("{}-{}.jsonl", sanitize(phase), sanitize(step)))
    }

    pub fn run_path(&self, token: &str) -> PathBuf {
        let prefix: String = token.chars().take(16).collect();
        self.dir.join(format!("run-{}.jsonl", prefix))
    }

    /// Write a step's lines, returning the file on success
    pub async fn write_step(&self, phase: &str, step: &str, lines: &[OutputLine]) -> Option<PathBuf> {
        let path = self.step_path(phase, step);
        self.write_lines(path, lines).await
    }

    /// Write a single run's lines, returning the file on success
    pub async fn write_run(&self, token: &str, lines: &[OutputLine]) -> Option<PathBuf> {
        let path = self.run_path(token);
        self.write_lines(path, lines).await
    }

    async fn write_lines(&self, path: PathBuf, lines: &[OutputLine]) -> Option<PathBuf> {
        fail_open("run_log::write_lines", || async {
            let mut body = String::new();
            for line in lines {
                body.push_str(&serde_json::to_string(line)?);
                body.push('\n');
            }
            write_file(&path, body.as_bytes()).await
        })
        .await?;
        Some(path)
    }

    /// Read lines written by [`RunLog::write_step`] or [`RunLog::write_run`]
    ///
    /// Missing or unreadable files yield no lines; malformed lines are skipped.
    pub async fn read_lines(path: &Path) -> Vec<OutputLine> {
        let Some(content) = fail_open("run_log::read_lines", || async {
            Ok::<_, GauntletError>(fs::read_to_string(path).await?)
        })
        .await
        else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Write the consolidated log of every step in `result`
    pub async fn write_consolidated(
        &self,
        result: &PipelineResult,
        outputs: &[(String, Vec<OutputLine>)],
    ) -> Option<PathBuf> {
        let path = self.dir.join(CONSOLIDATED_LOG);
        let body = render_consolidated(result, outputs);
        fail_open("run_log::write_consolidated", || write_file(&path, body.as_bytes())).await?;
        Some(path)
    }
}

fn render_consolidated(result: &PipelineResult, outputs: &[(String, Vec<OutputLine>)]) -> String {
    let mut content = String::new();
    content.push_str("# gauntlet pipeline log\n");
    content.push_str(&format!("# timestamp: {}\n", result.timestamp.to_rfc3339()));
    content.push_str(&format!("# content hash: {}\n", result.content_hash));
    content.push_str(&format!(
        "# result: {}\n\n",
        if result.passed { "PASSED" } else { "FAILED" }
    ));

    for phase in &result.phases {
        for step in &phase.steps {
            content.push_str(&format!(
                "== {} / {} (exit {}, {:.2}s{}) ==\n",
                phase.name,
                step.name,
                step.exit_code,
                step.duration_seconds,
                if step.cached { ", cached" } else { "" }
            ));
            content.push_str(&format!("$ {}\n", step.command));
            if let Some((_, lines)) = outputs.iter().find(|(name, _)| name == &step.name) {
                for line in lines {
                    content.push_str(&line.render());
                    content.push('\n');
                }
            }
            content.push('\n');
        }
    }
    content
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

/// Keep file names portable
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "step".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gauntlet_core::{PhaseResult, StepResult, Stream};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_step_lines_round_trip() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::new(dir.path(), &ContentHash::new("abcdef0123456789abcdef"));
        let lines = vec![
            OutputLine::new(Stream::Stdout, "compiling"),
            OutputLine::new(Stream::Stderr, "warning: unused"),
        ];

        let path = log.write_step("lint", "clippy", &lines).await.unwrap();
        assert!(path.ends_with("abcdef012345/lint-clippy.jsonl"));
        assert_eq!(RunLog::read_lines(&path).await, lines);
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let lines = RunLog::read_lines(Path::new("/nonexistent/gauntlet.jsonl")).await;
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn test_unwritable_base_fails_open() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();

        let log = RunLog::new(&blocker, &ContentHash::new("abc"));
        assert!(log.write_step("p", "s", &[]).await.is_none());
    }

    #[tokio::test]
    async fn test_consolidated_log_includes_every_step() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::new(dir.path(), &ContentHash::new("abc"));
        let step = StepResult {
            name: "unit".to_string(),
            command: "cargo test".to_string(),
            requested_command: None,
            passed: true,
            exit_code: 0,
            duration_seconds: 1.0,
            captured_output_ref: None,
            extraction: None,
            cached: false,
            terminated: false,
        };
        let result = PipelineResult {
            passed: true,
            timestamp: Utc::now(),
            content_hash: ContentHash::new("abc"),
            phases: vec![PhaseResult {
                name: "test".to_string(),
                passed: true,
                steps: vec![step],
                duration_seconds: 1.0,
            }],
            failed_step_name: None,
            failed_step_output: None,
            cached: false,
        };
        let outputs = vec![(
            "unit".to_string(),
            vec![OutputLine::new(Stream::Stdout, "test result: ok")],
        )];

        let path = log.write_consolidated(&result, &outputs).await.unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("== test / unit (exit 0"));
        assert!(content.contains("$ cargo test"));
        assert!(content.contains("[stdout] test result: ok"));
    }

    #[test]
    fn test_sanitize_replaces_separators() {
        assert_eq!(sanitize("unit tests/x"), "unit_tests_x");
        assert_eq!(sanitize(""), "step");
    }
}
