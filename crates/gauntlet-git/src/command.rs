//! Git command execution abstraction

use async_trait::async_trait;
use gauntlet_core::{GauntletError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Output from a git command
#[derive(Debug, Clone, Default)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
        }
    }
}

impl From<Output> for GitOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }
}

/// Extra inputs for a git invocation
///
/// Untrusted content (command strings, note bodies) goes through `stdin`,
/// never through arguments, so nothing is ever shell-interpolated.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions<'a> {
    pub stdin: Option<&'a [u8]>,
    pub env: &'a [(&'a str, &'a str)],
}

impl<'a> ExecOptions<'a> {
    pub fn with_stdin(mut self, stdin: &'a [u8]) -> Self {
        self.stdin = Some(stdin);
        self
    }

    pub fn with_env(mut self, env: &'a [(&'a str, &'a str)]) -> Self {
        self.env = env;
        self
    }
}

/// Trait for executing git commands (allows mocking in tests)
#[async_trait]
pub trait GitExecutor: Send + Sync {
    /// Execute a git command with the given arguments
    async fn exec(&self, args: &[&str]) -> Result<GitOutput> {
        self.exec_with(args, ExecOptions::default()).await
    }

    /// Execute a git command with stdin and extra environment
    async fn exec_with(&self, args: &[&str], options: ExecOptions<'_>) -> Result<GitOutput>;

    /// Get the repository root
    fn repo_root(&self) -> &Path;
}

/// Real git command executor
#[derive(Debug, Clone)]
pub struct GitCommand {
    repo_root: PathBuf,
}

impl GitCommand {
    /// Create a new git command executor for the given repository
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// Detect the repository containing `dir`
    pub async fn detect(dir: &Path) -> Result<Self> {
        let output = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| GauntletError::GitCommand(format!("Failed to run git rev-parse: {}", e)))?;

        if !output.status.success() {
            return Err(GauntletError::NotInRepository);
        }

        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if root.is_empty() {
            return Err(GauntletError::NotInRepository);
        }
        Ok(Self::new(root))
    }
}

#[async_trait]
impl GitExecutor for GitCommand {
    #[instrument(skip(self, options), fields(repo = %self.repo_root.display()))]
    async fn exec_with(&self, args: &[&str], options: ExecOptions<'_>) -> Result<GitOutput> {
        debug!("Executing git {:?}", args);

        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(&self.repo_root)
            // Callers match on git's untranslated messages
            .env("LC_ALL", "C")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if options.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        for (key, value) in options.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| GauntletError::GitCommand(format!("Failed to execute git: {}", e)))?;

        if let (Some(input), Some(mut stdin)) = (options.stdin, child.stdin.take()) {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let git_output = GitOutput::from(output);

        if !git_output.success {
            debug!("git command failed: {}", git_output.stderr.trim());
        }

        Ok(git_output)
    }

    fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}

/// A call observed by [`MockGitExecutor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub env: Vec<(String, String)>,
}

/// Mock git executor for testing
#[derive(Clone)]
pub struct MockGitExecutor {
    repo_root: PathBuf,
    responses: HashMap<String, GitOutput>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl Default for MockGitExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGitExecutor {
    pub fn new() -> Self {
        Self {
            repo_root: PathBuf::from("/mock/repo"),
            responses: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.repo_root = root.into();
        self
    }

    pub fn with_response(mut self, command: &str, output: GitOutput) -> Self {
        self.responses.insert(command.to_string(), output);
        self
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl GitExecutor for MockGitExecutor {
    async fn exec_with(&self, args: &[&str], options: ExecOptions<'_>) -> Result<GitOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                args: args.iter().map(|a| a.to_string()).collect(),
                stdin: options.stdin.map(|s| s.to_vec()),
                env: options
                    .env
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            });
        }

        let key = args.join(" ");
        self.responses
            .get(&key)
            .cloned()
            .ok_or_else(|| GauntletError::GitCommand(format!("No mock response for: {}", key)))
    }

    fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_executor() {
        let executor = MockGitExecutor::new()
            .with_response("rev-parse HEAD", GitOutput::ok("abc123\n"));

        let output = executor.exec(&["rev-parse", "HEAD"]).await.unwrap();
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "abc123");
    }

    #[tokio::test]
    async fn test_mock_records_stdin() {
        let executor = MockGitExecutor::new().with_response("hash-object --stdin", GitOutput::ok("x"));

        executor
            .exec_with(
                &["hash-object", "--stdin"],
                ExecOptions::default().with_stdin(b"payload"),
            )
            .await
            .unwrap();

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].stdin.as_deref(), Some(&b"payload"[..]));
    }

    #[tokio::test]
    async fn test_mock_missing_response_errors() {
        let executor = MockGitExecutor::new();
        assert!(executor.exec(&["status"]).await.is_err());
    }

    #[tokio::test]
    async fn test_detect_outside_repository() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        match GitCommand::detect(temp_dir.path()).await {
            Err(GauntletError::NotInRepository) | Err(GauntletError::GitCommand(_)) => {}
            Ok(cmd) => {
                // The temp dir may live inside a checkout on some machines
                assert!(temp_dir.path().starts_with(cmd.repo_root()) || cmd.repo_root().exists());
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}
