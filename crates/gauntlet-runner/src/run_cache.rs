//! Single-command run cache
//!
//! Successful runs are recorded under `gauntlet/run/<content hash>/<token>`
//! so an identical command against identical tree content is answered
//! without spawning anything. Every store-side failure degrades to a miss
//! or a skipped write; only working-directory validation can fail a call.

use chrono::Utc;
use gauntlet_core::fail_open::fail_open;
use gauntlet_core::{ContentHash, ExecutionContext, Result, RunRecord};
use gauntlet_git::{ContentHashProvider, NoteStore, ResolvedWorkdir, WorkdirResolver};
use std::sync::Arc;
use tracing::debug;

use crate::cache_key::{CacheKey, CacheNamespace};
use crate::merger::MergedRun;

/// Why a lookup did not produce a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// The force flag bypasses reads
    Forced,
    /// Outside a repository, caching is disabled
    NoContentHash,
    NotFound,
    /// The store could not be read
    Unavailable,
    /// An entry exists but could not be used
    Corrupt,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(RunRecord),
    Miss(MissReason),
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn into_record(self) -> Option<RunRecord> {
        match self {
            Self::Hit(record) => Some(record),
            Self::Miss(_) => None,
        }
    }
}

/// What a store call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// Nonzero exit codes are never cached
    SkippedFailure,
    /// The inner invocation owns caching for an unwrapped command
    SkippedUnwrapped,
    SkippedNoContentHash,
    /// The write was attempted and failed
    Failed,
}

/// Content-addressed cache of successful single-command runs
#[derive(Clone)]
pub struct RunCache {
    store: Arc<dyn NoteStore>,
    hasher: Arc<dyn ContentHashProvider>,
    resolver: WorkdirResolver,
    context: ExecutionContext,
}

impl RunCache {
    pub fn new(
        store: Arc<dyn NoteStore>,
        hasher: Arc<dyn ContentHashProvider>,
        resolver: WorkdirResolver,
        context: ExecutionContext,
    ) -> Self {
        Self {
            store,
            hasher,
            resolver,
            context,
        }
    }

    pub fn resolver(&self) -> &WorkdirResolver {
        &self.resolver
    }

    pub fn note_store(&self) -> Arc<dyn NoteStore> {
        self.store.clone()
    }

    pub fn hasher(&self) -> Arc<dyn ContentHashProvider> {
        self.hasher.clone()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn is_forced(&self) -> bool {
        self.context.force
    }

    /// Current tree hash; any failure means caching is off for this call
    pub async fn current_hash(&self) -> ContentHash {
        fail_open("content_hash", || self.hasher.hash())
            .await
            .unwrap_or_else(ContentHash::unknown)
    }

    /// Look up `command` run in `explicit_workdir` (or the invoking directory)
    ///
    /// Errors only when the working directory is rejected.
    pub async fn lookup(&self, command: &str, explicit_workdir: Option<&str>) -> Result<CacheLookup> {
        let workdir = self.resolver.resolve(explicit_workdir)?;
        if self.is_forced() {
            debug!(command, "Force flag set, bypassing cache read");
            return Ok(CacheLookup::Miss(MissReason::Forced));
        }
        let hash = self.current_hash().await;
        Ok(self.lookup_at(&hash, command, &workdir.relative).await)
    }

    /// Look up under an already computed hash and resolved workdir
    pub async fn lookup_at(&self, hash: &ContentHash, command: &str, workdir: &str) -> CacheLookup {
        if self.is_forced() {
            return CacheLookup::Miss(MissReason::Forced);
        }
        if hash.is_unknown() {
            return CacheLookup::Miss(MissReason::NoContentHash);
        }

        let path = CacheKey::new(hash.clone(), workdir, command).path(CacheNamespace::Run);
        let bytes = match fail_open("note_store::read", || self.store.read(&path)).await {
            Some(Some(bytes)) => bytes,
            Some(None) => return CacheLookup::Miss(MissReason::NotFound),
            None => return CacheLookup::Miss(MissReason::Unavailable),
        };

        let mut record: RunRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => {
                debug!(%path, "Corrupt cache entry: {}", e);
                return CacheLookup::Miss(MissReason::Corrupt);
            }
        };
        if record.command != command || record.exit_code != 0 {
            debug!(%path, "Cache entry does not match its key, ignoring");
            return CacheLookup::Miss(MissReason::Corrupt);
        }

        debug!(%path, "Cache hit");
        record.from_cache = true;
        CacheLookup::Hit(record)
    }

    /// Record a run of `command` if it is cacheable
    ///
    /// The content hash is computed fresh at store time.
    pub async fn store(
        &self,
        command: &str,
        result: &MergedRun,
        explicit_workdir: Option<&str>,
    ) -> Result<StoreOutcome> {
        let workdir = self.resolver.resolve(explicit_workdir)?;
        Ok(self.store_resolved(command, result, &workdir).await)
    }

    pub async fn store_resolved(
        &self,
        command: &str,
        result: &MergedRun,
        workdir: &ResolvedWorkdir,
    ) -> StoreOutcome {
        if let Some(skip) = precheck(command, result) {
            return skip;
        }
        let hash = self.current_hash().await;
        self.store_at(&hash, command, result, &workdir.relative).await
    }

    /// Store under an already computed hash
    pub async fn store_at(
        &self,
        hash: &ContentHash,
        command: &str,
        result: &MergedRun,
        workdir: &str,
    ) -> StoreOutcome {
        if let Some(skip) = precheck(command, result) {
            return skip;
        }
        if hash.is_unknown() {
            return StoreOutcome::SkippedNoContentHash;
        }

        let record = RunRecord {
            command: command.to_string(),
            cwd: workdir.to_string(),
            timestamp: Utc::now(),
            exit_code: result.exit_code,
            duration_seconds: result.duration_seconds,
            extraction: result
                .extraction
                .clone()
                .filter(|extraction| !extraction.is_trivial()),
            output_file_refs: result.output_file_refs.clone(),
            from_cache: false,
        };

        let path = CacheKey::new(hash.clone(), workdir, command).path(CacheNamespace::Run);
        let bytes = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(%path, "Failed to encode run record: {}", e);
                return StoreOutcome::Failed;
            }
        };
        let written = fail_open("note_store::write", || self.store.write(&path, &bytes, true)).await;

        match written {
            Some(()) => {
                debug!(%path, "Stored run record");
                StoreOutcome::Stored
            }
            None => StoreOutcome::Failed,
        }
    }
}

fn precheck(command: &str, result: &MergedRun) -> Option<StoreOutcome> {
    if result.exit_code != 0 {
        return Some(StoreOutcome::SkippedFailure);
    }
    if result.command != command {
        debug!(
            requested = command,
            actual = %result.command,
            "Unwrapped nested command, inner invocation owns caching"
        );
        return Some(StoreOutcome::SkippedUnwrapped);
    }
    None
}
