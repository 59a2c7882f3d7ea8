//! Step process execution
//!
//! Each step runs through the platform shell in its own process group with
//! stdout and stderr captured line by line. Cancellation kills the whole
//! group; reader tasks get a bounded grace period to drain what is left.

use chrono::Utc;
use gauntlet_core::{GauntletError, OutputLine, Result, Stream};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::{kill_process_tree, ProcessRegistry};

/// Exit code reported when a process ends without one (signals)
pub const GENERIC_FAILURE_EXIT_CODE: i32 = 1;

/// Exit code reported when a command cannot be started
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// How long readers may keep draining after a normal exit
const READER_GRACE: Duration = Duration::from_secs(5);

/// How long readers may keep draining after a kill
const KILLED_READER_GRACE: Duration = Duration::from_millis(500);

/// Where and how to run one command
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl StepOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }
}

/// Everything a process wrote
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    /// Interleaved, ANSI-stripped lines in arrival order
    pub lines: Vec<OutputLine>,
}

impl CapturedOutput {
    /// Last `count` lines rendered as text
    pub fn tail(&self, count: usize) -> String {
        let start = self.lines.len().saturating_sub(count);
        self.lines[start..]
            .iter()
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Outcome of one process
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub exit_code: i32,
    pub duration_seconds: f64,
    /// Killed by cancellation rather than exiting on its own
    pub terminated: bool,
    pub output: CapturedOutput,
}

impl ExecutionOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.terminated
    }
}

#[derive(Default)]
struct CaptureSink {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    lines: Vec<OutputLine>,
}

/// Spawns shell commands and captures their output
#[derive(Clone, Default)]
pub struct StepExecutor {
    registry: Option<ProcessRegistry>,
}

impl StepExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every spawned process so a shutdown hook can reach it
    pub fn with_registry(registry: ProcessRegistry) -> Self {
        Self {
            registry: Some(registry),
        }
    }

    pub async fn run(&self, command: &str, options: &StepOptions) -> Result<ExecutionOutput> {
        self.run_cancellable(command, command, options, CancellationToken::new())
            .await
    }

    /// Run until the process exits or `cancel` fires
    pub async fn run_cancellable(
        &self,
        label: &str,
        command: &str,
        options: &StepOptions,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutput> {
        let started = Instant::now();
        let mut cmd = shell_command(command);
        cmd.current_dir(&options.cwd)
            .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| GauntletError::Spawn {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        debug!(label, ?pid, cwd = %options.cwd.display(), "Spawned step");

        let _guard = self
            .registry
            .as_ref()
            .map(|registry| registry.register(label, pid, cancel.clone()));

        let sink = Arc::new(Mutex::new(CaptureSink::default()));
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, Stream::Stdout, sink.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, Stream::Stderr, sink.clone())));
        }

        let (status, killed) = tokio::select! {
            biased;
            status = child.wait() => (status, false),
            _ = cancel.cancelled() => {
                debug!(label, "Cancelled, killing process group");
                if let Some(pid) = pid {
                    kill_process_tree(pid);
                }
                if let Err(e) = child.start_kill() {
                    debug!(label, "start_kill failed: {}", e);
                }
                (child.wait().await, true)
            }
        };

        let exit_code = match status {
            Ok(status) => status.code().unwrap_or(GENERIC_FAILURE_EXIT_CODE),
            Err(e) => {
                warn!(label, "Failed to wait for process: {}", e);
                GENERIC_FAILURE_EXIT_CODE
            }
        };

        // A kill from outside (shutdown hook) can win the race with the cancel
        // arm; a clean exit racing a cancel is not a termination.
        let terminated = (killed || cancel.is_cancelled()) && exit_code != 0;

        let grace = if killed {
            KILLED_READER_GRACE
        } else {
            READER_GRACE
        };
        for mut reader in readers {
            if tokio::time::timeout(grace, &mut reader).await.is_err() {
                debug!(label, "Output reader still open after grace period, aborting");
                reader.abort();
            }
        }

        let output = {
            let mut sink = sink.lock().unwrap_or_else(|p| p.into_inner());
            CapturedOutput {
                stdout: String::from_utf8_lossy(&sink.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&sink.stderr).into_owned(),
                lines: std::mem::take(&mut sink.lines),
            }
        };

        Ok(ExecutionOutput {
            exit_code,
            duration_seconds: started.elapsed().as_secs_f64(),
            terminated,
            output,
        })
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

async fn pump<R>(reader: R, stream: Stream, sink: Arc<Mutex<CaptureSink>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let raw = String::from_utf8_lossy(&buf);
                let text = strip_ansi_escapes::strip_str(raw.trim_end_matches(['\r', '\n']));
                let mut sink = sink.lock().unwrap_or_else(|p| p.into_inner());
                match stream {
                    Stream::Stdout => sink.stdout.extend_from_slice(&buf),
                    Stream::Stderr => sink.stderr.extend_from_slice(&buf),
                }
                if !text.trim().is_empty() {
                    sink.lines.push(OutputLine {
                        timestamp: Utc::now(),
                        stream,
                        text,
                    });
                }
            }
            Err(e) => {
                debug!(%stream, "Output reader failed: {}", e);
                break;
            }
        }
    }
}
