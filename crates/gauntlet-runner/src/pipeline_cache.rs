//! Pipeline-level result cache
//!
//! A passing pipeline is recorded under `gauntlet/validate/<hash>/<token>`
//! where the token covers the full phase configuration, so editing a step
//! command never serves a stale pass.

use gauntlet_core::fail_open::fail_open;
use gauntlet_core::{ContentHash, Phase, PipelineResult};
use gauntlet_git::NoteStore;
use std::sync::Arc;
use tracing::debug;

use crate::cache_key::{CacheKey, CacheNamespace};

#[derive(Clone)]
pub struct PipelineCache {
    store: Arc<dyn NoteStore>,
    force: bool,
}

impl PipelineCache {
    pub fn new(store: Arc<dyn NoteStore>, force: bool) -> Self {
        Self { store, force }
    }

    fn canonical(phases: &[Phase]) -> String {
        // Phase and Step serialize with a fixed field order
        serde_json::to_string(phases).unwrap_or_default()
    }

    fn path(hash: &ContentHash, phases: &[Phase], workdir: &str) -> String {
        CacheKey::new(hash.clone(), workdir, Self::canonical(phases)).path(CacheNamespace::Validate)
    }

    /// A previously cached pass for this tree and configuration
    pub async fn lookup(
        &self,
        hash: &ContentHash,
        phases: &[Phase],
        workdir: &str,
    ) -> Option<PipelineResult> {
        if self.force || hash.is_unknown() {
            return None;
        }
        let path = Self::path(hash, phases, workdir);
        let bytes = fail_open("note_store::read", || self.store.read(&path))
            .await
            .flatten()?;

        let mut result: PipelineResult = match serde_json::from_slice(&bytes) {
            Ok(result) => result,
            Err(e) => {
                debug!(%path, "Corrupt pipeline cache entry: {}", e);
                return None;
            }
        };
        if !result.passed || &result.content_hash != hash {
            debug!(%path, "Pipeline cache entry does not match its key, ignoring");
            return None;
        }

        debug!(%path, "Pipeline cache hit");
        result.cached = true;
        for step in result.phases.iter_mut().flat_map(|p| p.steps.iter_mut()) {
            step.cached = true;
        }
        Some(result)
    }

    /// Record a passing pipeline; returns whether anything was written
    pub async fn store(&self, result: &PipelineResult, phases: &[Phase], workdir: &str) -> bool {
        if !result.passed || result.content_hash.is_unknown() {
            return false;
        }
        let path = Self::path(&result.content_hash, phases, workdir);
        let mut stored = result.clone();
        stored.cached = false;
        let bytes = match serde_json::to_vec(&stored) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(%path, "Failed to encode pipeline result: {}", e);
                return false;
            }
        };
        fail_open("note_store::write", || self.store.write(&path, &bytes, true))
            .await
            .is_some()
    }
}
