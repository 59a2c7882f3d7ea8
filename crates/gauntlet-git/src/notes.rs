//! Key/value storage on top of git notes
//!
//! Every store path maps to its own notes ref, `refs/notes/<path>`, with the
//! note attached to the empty tree object. Notes refs are not fetched or
//! pushed by default, so the cache stays local to the machine.

use async_trait::async_trait;
use gauntlet_core::{GauntletError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::command::{ExecOptions, GitExecutor};

/// Hierarchical key/value store
#[async_trait]
pub trait NoteStore: Send + Sync {
    /// Read the bytes stored at `path`, `None` when absent
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Store `bytes` at `path`; without `overwrite` an existing entry is an error
    async fn write(&self, path: &str, bytes: &[u8], overwrite: bool) -> Result<()>;
}

/// Check that a store path is safe to embed in a ref name
pub fn validate_note_path(path: &str) -> Result<()> {
    let invalid = |reason: &str| GauntletError::Cache(format!("Invalid note path `{}`: {}", path, reason));

    if path.is_empty() {
        return Err(invalid("empty"));
    }
    for segment in path.split('/') {
        if segment.is_empty() {
            return Err(invalid("empty segment"));
        }
        if segment.starts_with('.') || segment.ends_with(".lock") {
            return Err(invalid("reserved segment"));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid("unsupported character"));
        }
    }
    if path.contains("..") {
        return Err(invalid("`..` is not allowed"));
    }
    Ok(())
}

// Notes commits are owned by the tool, so a fixed identity is fine and keeps
// writes working on machines without user.name configured.
const NOTES_IDENTITY: [(&str, &str); 4] = [
    ("GIT_AUTHOR_NAME", "gauntlet"),
    ("GIT_AUTHOR_EMAIL", "gauntlet@localhost"),
    ("GIT_COMMITTER_NAME", "gauntlet"),
    ("GIT_COMMITTER_EMAIL", "gauntlet@localhost"),
];

/// NoteStore backed by `git notes`
pub struct GitNoteStore<E: GitExecutor> {
    executor: E,
    anchor: OnceCell<String>,
}

impl<E: GitExecutor> GitNoteStore<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            anchor: OnceCell::new(),
        }
    }

    fn notes_ref(path: &str) -> String {
        format!("refs/notes/{}", path)
    }

    /// Object every note hangs off: the empty tree, written once per process
    async fn anchor(&self) -> Result<&str> {
        let anchor = self
            .anchor
            .get_or_try_init(|| async {
                let output = self
                    .executor
                    .exec_with(
                        &["hash-object", "-t", "tree", "-w", "--stdin"],
                        ExecOptions::default().with_stdin(b""),
                    )
                    .await?;
                if !output.success {
                    return Err(GauntletError::GitCommand(format!(
                        "Failed to write note anchor: {}",
                        output.stderr.trim()
                    )));
                }
                Ok(output.stdout.trim().to_string())
            })
            .await?;
        Ok(anchor.as_str())
    }
}

#[async_trait]
impl<E: GitExecutor> NoteStore for GitNoteStore<E> {
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        validate_note_path(path)?;
        let anchor = self.anchor().await?;
        let notes_ref = Self::notes_ref(path);

        let output = self
            .executor
            .exec(&["notes", "--ref", &notes_ref, "show", anchor])
            .await?;

        if output.success {
            return Ok(Some(output.stdout.into_bytes()));
        }
        if output.stderr.contains("no note found") {
            debug!(path, "No note stored");
            return Ok(None);
        }
        Err(GauntletError::GitCommand(format!(
            "git notes show failed: {}",
            output.stderr.trim()
        )))
    }

    async fn write(&self, path: &str, bytes: &[u8], overwrite: bool) -> Result<()> {
        validate_note_path(path)?;
        let anchor = self.anchor().await?;
        let notes_ref = Self::notes_ref(path);

        let mut args = vec!["notes", "--ref", notes_ref.as_str(), "add"];
        if overwrite {
            args.push("-f");
        }
        args.extend(["-F", "-", anchor]);

        let output = self
            .executor
            .exec_with(
                &args,
                ExecOptions::default()
                    .with_stdin(bytes)
                    .with_env(&NOTES_IDENTITY),
            )
            .await?;

        if !output.success {
            return Err(GauntletError::GitCommand(format!(
                "git notes add failed: {}",
                output.stderr.trim()
            )));
        }
        debug!(path, bytes = bytes.len(), "Stored note");
        Ok(())
    }
}

/// In-memory NoteStore for tests
#[derive(Debug, Default)]
pub struct InMemoryNoteStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plant raw bytes at a path, bypassing validation
    pub fn insert_raw(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(path.into(), bytes.into());
        }
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.entries.lock().ok()?.get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .entries
            .lock()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl NoteStore for InMemoryNoteStore {
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(GauntletError::Cache("simulated read failure".to_string()));
        }
        validate_note_path(path)?;
        Ok(self.get(path))
    }

    async fn write(&self, path: &str, bytes: &[u8], overwrite: bool) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GauntletError::Cache("simulated write failure".to_string()));
        }
        validate_note_path(path)?;

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| GauntletError::Cache("store poisoned".to_string()))?;
        if !overwrite && entries.contains_key(path) {
            return Err(GauntletError::Cache(format!("Note already exists at {}", path)));
        }
        entries.insert(path.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
