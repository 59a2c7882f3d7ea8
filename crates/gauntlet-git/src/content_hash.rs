//! Working-tree content hashing
//!
//! The hash is the git tree id of the working tree as it would be committed
//! with `git add -A`: tracked and untracked files, excluding ignored ones.
//! It is computed against a throwaway index so the user's staging area is
//! never touched. A change to any path or byte, `.gitignore` included,
//! yields a different tree id.

use async_trait::async_trait;
use gauntlet_core::{ContentHash, GauntletError, Result};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

use crate::command::{ExecOptions, GitExecutor};

/// Computes the identity of the current working-tree content
#[async_trait]
pub trait ContentHashProvider: Send + Sync {
    /// Hash the working tree; `ContentHash::unknown()` outside a repository
    async fn hash(&self) -> Result<ContentHash>;
}

/// Content hash backed by `git write-tree` over a temporary index
pub struct GitContentHash<E: GitExecutor> {
    executor: E,
}

impl<E: GitExecutor> GitContentHash<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    async fn index_path(&self) -> Result<Option<PathBuf>> {
        let output = self
            .executor
            .exec(&["rev-parse", "--git-path", "index"])
            .await?;
        if !output.success {
            return Ok(None);
        }

        let path = PathBuf::from(output.stdout.trim());
        if path.is_absolute() {
            Ok(Some(path))
        } else {
            Ok(Some(self.executor.repo_root().join(path)))
        }
    }
}

#[async_trait]
impl<E: GitExecutor> ContentHashProvider for GitContentHash<E> {
    async fn hash(&self) -> Result<ContentHash> {
        let Some(real_index) = self.index_path().await? else {
            debug!("Not in a git repository, content hash unavailable");
            return Ok(ContentHash::unknown());
        };

        let scratch = tempfile::TempDir::new()?;
        let scratch_index = scratch.path().join("index");

        // Seeding with the real index lets git reuse cached stat data
        if real_index.exists() {
            if let Err(e) = tokio::fs::copy(&real_index, &scratch_index).await {
                debug!("Could not seed scratch index: {}", e);
            }
        }

        let index_str = scratch_index.to_string_lossy().to_string();
        let env = [("GIT_INDEX_FILE", index_str.as_str())];

        let add = self
            .executor
            .exec_with(&["add", "-A", "--", "."], ExecOptions::default().with_env(&env))
            .await?;
        if !add.success {
            return Err(GauntletError::GitCommand(format!(
                "git add -A failed: {}",
                add.stderr.trim()
            )));
        }

        let tree = self
            .executor
            .exec_with(&["write-tree"], ExecOptions::default().with_env(&env))
            .await?;
        if !tree.success {
            return Err(GauntletError::GitCommand(format!(
                "git write-tree failed: {}",
                tree.stderr.trim()
            )));
        }

        let hash = ContentHash::new(tree.stdout.trim());
        debug!(content_hash = %hash, "Computed working tree hash");
        Ok(hash)
    }
}

/// Provider for directories outside version control
#[derive(Debug, Clone, Copy, Default)]
pub struct UnknownContentHash;

#[async_trait]
impl ContentHashProvider for UnknownContentHash {
    async fn hash(&self) -> Result<ContentHash> {
        Ok(ContentHash::unknown())
    }
}

/// Fixed hash, for tests
#[derive(Debug)]
pub struct StaticContentHash {
    hash: ContentHash,
    calls: AtomicUsize,
}

impl StaticContentHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: ContentHash::new(hash),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentHashProvider for StaticContentHash {
    async fn hash(&self) -> Result<ContentHash> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.hash.clone())
    }
}

/// Hands out queued hashes in order, repeating the last one
///
/// Used to simulate a tree that changes while a pipeline runs.
#[derive(Debug)]
pub struct SequenceContentHash {
    queue: Mutex<VecDeque<ContentHash>>,
    last: Mutex<ContentHash>,
}

impl SequenceContentHash {
    pub fn new<I, S>(hashes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue: Mutex::new(hashes.into_iter().map(ContentHash::new).collect()),
            last: Mutex::new(ContentHash::unknown()),
        }
    }
}

#[async_trait]
impl ContentHashProvider for SequenceContentHash {
    async fn hash(&self) -> Result<ContentHash> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| GauntletError::Other("hash queue poisoned".to_string()))?;
        let mut last = self
            .last
            .lock()
            .map_err(|_| GauntletError::Other("hash queue poisoned".to_string()))?;

        if let Some(next) = queue.pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{GitOutput, MockGitExecutor};

    #[tokio::test]
    async fn test_outside_repository_is_unknown() {
        let executor = MockGitExecutor::new().with_response(
            "rev-parse --git-path index",
            GitOutput::failed("fatal: not a git repository"),
        );
        let hash = GitContentHash::new(executor).hash().await.unwrap();
        assert!(hash.is_unknown());
    }

    #[tokio::test]
    async fn test_hash_uses_scratch_index() {
        let executor = MockGitExecutor::new()
            .with_response("rev-parse --git-path index", GitOutput::ok(".git/index\n"))
            .with_response("add -A -- .", GitOutput::ok(""))
            .with_response("write-tree", GitOutput::ok("4b825dc642cb6eb9a060e54bf8d69288fbee4904\n"));

        let provider = GitContentHash::new(executor.clone());
        let hash = provider.hash().await.unwrap();
        assert_eq!(hash.as_str(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");

        let calls = executor.calls();
        let add = calls.iter().find(|c| c.args[0] == "add").unwrap();
        let index_env = add.env.iter().find(|(k, _)| k == "GIT_INDEX_FILE").unwrap();
        assert!(!index_env.1.ends_with(".git/index"));

        let write = calls.iter().find(|c| c.args[0] == "write-tree").unwrap();
        assert_eq!(write.env, add.env);
    }

    #[tokio::test]
    async fn test_add_failure_is_error() {
        let executor = MockGitExecutor::new()
            .with_response("rev-parse --git-path index", GitOutput::ok(".git/index"))
            .with_response("add -A -- .", GitOutput::failed("index.lock exists"));

        let result = GitContentHash::new(executor).hash().await;
        assert!(matches!(result, Err(GauntletError::GitCommand(_))));
    }

    #[tokio::test]
    async fn test_sequence_repeats_last() {
        let provider = SequenceContentHash::new(["a", "b"]);
        assert_eq!(provider.hash().await.unwrap().as_str(), "a");
        assert_eq!(provider.hash().await.unwrap().as_str(), "b");
        assert_eq!(provider.hash().await.unwrap().as_str(), "b");
    }
}
