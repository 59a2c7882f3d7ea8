//! `gauntlet run`: one command through the run cache

use gauntlet_core::{ContentHash, OutputLine, Result, RunRecord};
use gauntlet_git::ResolvedWorkdir;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::cache_key::{CacheKeyCodec, TOOL_NAMESPACE};
use crate::document::RunDocument;
use crate::executor::{StepExecutor, StepOptions};
use crate::merger::{MergedRun, OutputMerger};
use crate::run_cache::{CacheLookup, RunCache, StoreOutcome};
use crate::run_log::RunLog;

/// What `gauntlet run` produced
#[derive(Debug, Clone)]
pub struct SingleRunReport {
    pub document: RunDocument,
    /// Captured lines, read back from the log on a cache hit
    pub lines: Vec<OutputLine>,
    /// `None` when the result came from the cache
    pub store_outcome: Option<StoreOutcome>,
}

impl SingleRunReport {
    pub fn exit_code(&self) -> i32 {
        self.document.exit_code
    }
}

/// Runs single commands with caching
pub struct SingleRunner {
    cache: RunCache,
    executor: StepExecutor,
    merger: OutputMerger,
    log_base: Option<PathBuf>,
}

impl SingleRunner {
    pub fn new(cache: RunCache, executor: StepExecutor, merger: OutputMerger) -> Self {
        Self {
            cache,
            executor,
            merger,
            log_base: None,
        }
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_base = Some(dir.into());
        self
    }

    /// Report cache status without executing
    pub async fn check(&self, command: &str, cwd: Option<&str>) -> Result<CacheLookup> {
        self.cache.lookup(command, cwd).await
    }

    /// Serve from cache or execute, then record a cacheable result
    ///
    /// Fails before spawning on a rejected working directory, and on spawn
    /// failure.
    pub async fn run(&self, command: &str, cwd: Option<&str>) -> Result<SingleRunReport> {
        let workdir = self.cache.resolver().resolve(cwd)?;
        let hash = self.cache.current_hash().await;

        match self.cache.lookup_at(&hash, command, &workdir.relative).await {
            CacheLookup::Hit(record) => {
                info!(command, "Cache hit, not executing");
                let lines = match record.output_file_refs.first() {
                    Some(path) => RunLog::read_lines(path).await,
                    None => Vec::new(),
                };
                return Ok(SingleRunReport {
                    document: cached_document(&record, &hash),
                    lines,
                    store_outcome: None,
                });
            }
            CacheLookup::Miss(reason) => debug!(command, ?reason, "Cache miss"),
        }

        let options = StepOptions::new(&workdir.absolute).with_env(self.cache.context().child_env());
        let execution = self.executor.run(command, &options).await?;
        let mut merged = self.merger.merge(
            command,
            &execution.output,
            execution.exit_code,
            execution.duration_seconds,
        );

        if let Some(base) = &self.log_base {
            let token = CacheKeyCodec::encode(command, &workdir.relative);
            if let Some(path) = RunLog::new(base, &hash)
                .write_run(&token, &execution.output.lines)
                .await
            {
                merged.output_file_refs.push(path);
            }
        }

        let store_outcome = self.cache.store_resolved(command, &merged, &workdir).await;
        debug!(command, ?store_outcome, "Store finished");

        Ok(SingleRunReport {
            document: executed_document(&merged, &workdir, &hash),
            lines: execution.output.lines,
            store_outcome: Some(store_outcome),
        })
    }
}

fn known(hash: &ContentHash) -> Option<ContentHash> {
    (!hash.is_unknown()).then(|| hash.clone())
}

fn cached_document(record: &RunRecord, hash: &ContentHash) -> RunDocument {
    RunDocument {
        tool: TOOL_NAMESPACE.to_string(),
        command: record.command.clone(),
        requested_command: None,
        cwd: record.cwd.clone(),
        exit_code: record.exit_code,
        duration_seconds: record.duration_seconds,
        cached: true,
        content_hash: known(hash),
        extraction: record.extraction.clone(),
        output_files: record.output_file_refs.clone(),
    }
}

fn executed_document(merged: &MergedRun, workdir: &ResolvedWorkdir, hash: &ContentHash) -> RunDocument {
    RunDocument {
        tool: TOOL_NAMESPACE.to_string(),
        command: merged.command.clone(),
        requested_command: merged.requested_command.clone(),
        cwd: workdir.relative.clone(),
        exit_code: merged.exit_code,
        duration_seconds: merged.duration_seconds,
        cached: false,
        content_hash: known(hash),
        extraction: merged.extraction.clone(),
        output_files: merged.output_file_refs.clone(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use gauntlet_core::ExecutionContext;
    use gauntlet_git::{InMemoryNoteStore, StaticContentHash, WorkdirResolver};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn runner(dir: &TempDir, logs: &TempDir) -> SingleRunner {
        let cache = RunCache::new(
            Arc::new(InMemoryNoteStore::new()),
            Arc::new(StaticContentHash::new("tree")),
            WorkdirResolver::new(dir.path(), dir.path()),
            ExecutionContext::new(),
        );
        SingleRunner::new(cache, StepExecutor::new(), OutputMerger::new()).with_log_dir(logs.path())
    }

    #[tokio::test]
    async fn test_cache_hit_replays_logged_lines() {
        let dir = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        let runner = runner(&dir, &logs);

        let first = runner.run("echo one; echo two", None).await.unwrap();
        assert_eq!(first.store_outcome, Some(StoreOutcome::Stored));
        assert!(!first.document.cached);

        let second = runner.run("echo one; echo two", None).await.unwrap();
        assert!(second.document.cached);
        assert_eq!(second.store_outcome, None);
        let texts: Vec<&str> = second.lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_check_reports_without_running() {
        let dir = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        let runner = runner(&dir, &logs);

        assert!(!runner.check("true", None).await.unwrap().is_hit());
        runner.run("true", None).await.unwrap();
        assert!(runner.check("true", None).await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_exit_code_mirrors_command() {
        let dir = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        let report = runner(&dir, &logs).run("exit 4", None).await.unwrap();
        assert_eq!(report.exit_code(), 4);
        assert_eq!(report.store_outcome, Some(StoreOutcome::SkippedFailure));
    }
}
