//! Pipeline execution
//!
//! Phases run strictly in order; the first failing phase stops the
//! pipeline. A passing pipeline for the current tree and configuration is
//! answered from the pipeline cache without running anything. On a miss,
//! each step may still be answered by the run cache.
//!
//! Cache writes are deferred until the run is over and only happen when the
//! tree hash taken afterwards matches the one taken before.

use chrono::Utc;
use gauntlet_core::{
    ContentHash, GauntletConfig, OutputLine, Phase, PhaseResult, PipelineResult, Result,
    StepResult,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::merger::MergedRun;
use crate::observer::{ObserverSet, PipelineObserver};
use crate::pipeline_cache::PipelineCache;
use crate::run_cache::{CacheLookup, RunCache};
use crate::run_log::RunLog;
use crate::scheduler::{ParallelScheduler, PreparedStep, SchedulerOptions};
use crate::state::{transition, PipelineAction, PipelineEvent, PipelineState};

/// Lines of the failing step's output carried in the result
pub const FAILED_OUTPUT_TAIL_LINES: usize = 40;

/// Workdir component of the pipeline cache key; step cwds are root-relative
const PIPELINE_WORKDIR: &str = ".";

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub fail_fast: bool,
    pub stability_check: bool,
    pub consolidated_log: bool,
    /// Run every phase sequentially regardless of its own setting
    pub force_sequential: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            fail_fast: true,
            stability_check: true,
            consolidated_log: true,
            force_sequential: false,
        }
    }
}

impl From<&GauntletConfig> for PipelineOptions {
    fn from(config: &GauntletConfig) -> Self {
        Self {
            fail_fast: config.fail_fast,
            stability_check: config.stability_check,
            consolidated_log: config.consolidated_log,
            force_sequential: false,
        }
    }
}

/// A run-cache write held back until the stability check passes
struct PendingStore {
    command: String,
    workdir: String,
    run: MergedRun,
}

/// Everything collected while the phases run
#[derive(Default)]
struct RunState {
    phases: Vec<PhaseResult>,
    outputs: Vec<(String, Vec<OutputLine>)>,
    pending: Vec<PendingStore>,
    failed_step_name: Option<String>,
    failed_step_output: Option<String>,
}

/// Runs ordered phases through the scheduler and both caches
pub struct PipelineRunner {
    scheduler: ParallelScheduler,
    run_cache: RunCache,
    pipeline_cache: PipelineCache,
    log_base: Option<PathBuf>,
    observers: ObserverSet,
}

impl PipelineRunner {
    pub fn new(scheduler: ParallelScheduler, run_cache: RunCache) -> Self {
        let pipeline_cache = PipelineCache::new(run_cache.note_store(), run_cache.is_forced());
        Self {
            scheduler,
            run_cache,
            pipeline_cache,
            log_base: None,
            observers: ObserverSet::new(),
        }
    }

    /// Write per-step and consolidated logs under `dir`
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_base = Some(dir.into());
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observers.add(observer);
        self
    }

    /// Run `phases` to completion or first failure
    ///
    /// Errors only when a step's working directory is rejected; nothing is
    /// spawned in that case.
    pub async fn run(&self, phases: &[Phase], options: &PipelineOptions) -> Result<PipelineResult> {
        let prepared = self.prepare(phases)?;

        let hash_before = self.run_cache.current_hash().await;
        if let Some(cached) = self
            .pipeline_cache
            .lookup(&hash_before, phases, PIPELINE_WORKDIR)
            .await
        {
            info!(hash = %hash_before.short(), "Pipeline passed previously for this tree");
            return Ok(cached);
        }

        let log = self
            .log_base
            .as_ref()
            .map(|base| RunLog::new(base, &hash_before));
        let mut run = RunState::default();

        let (mut state, mut actions) = transition(
            PipelineState::NotStarted,
            PipelineEvent::Start {
                phase_count: phases.len(),
            },
        );
        while let Some(action) = actions.pop() {
            match action {
                PipelineAction::RunPhase { index } => {
                    let phase = &phases[index];
                    self.observers.phase_started(phase, index);
                    let result = self
                        .run_phase(phase, &prepared[index], &hash_before, log.as_ref(), options, &mut run)
                        .await;
                    self.observers.phase_completed(phase, &result);

                    let event = if result.passed {
                        PipelineEvent::PhasePassed
                    } else {
                        PipelineEvent::PhaseFailed
                    };
                    run.phases.push(result);
                    (state, actions) = transition(state, event);
                }
                PipelineAction::Finish { passed } => {
                    debug!(passed, ?state, "Pipeline finished");
                }
            }
        }

        let result = PipelineResult {
            passed: state == PipelineState::Passed,
            timestamp: Utc::now(),
            content_hash: hash_before.clone(),
            phases: run.phases,
            failed_step_name: run.failed_step_name,
            failed_step_output: run.failed_step_output,
            cached: false,
        };

        if self.is_stable(&hash_before, options).await {
            for pending in &run.pending {
                self.run_cache
                    .store_at(&hash_before, &pending.command, &pending.run, &pending.workdir)
                    .await;
            }
            if self
                .pipeline_cache
                .store(&result, phases, PIPELINE_WORKDIR)
                .await
            {
                debug!("Stored pipeline result");
            }
        }

        if let (Some(log), true) = (&log, options.consolidated_log) {
            if let Some(path) = log.write_consolidated(&result, &run.outputs).await {
                info!("Consolidated log written to {}", path.display());
            }
        }

        Ok(result)
    }

    /// Validate every step's working directory before anything runs
    fn prepare(&self, phases: &[Phase]) -> Result<Vec<Vec<PreparedStep>>> {
        let resolver = self.run_cache.resolver();
        let mut prepared = Vec::with_capacity(phases.len());
        for phase in phases {
            let mut steps = Vec::with_capacity(phase.steps.len());
            for step in &phase.steps {
                let workdir = resolver.resolve(Some(step.cwd.as_deref().unwrap_or(".")))?;
                steps.push(PreparedStep {
                    step: step.clone(),
                    workdir,
                });
            }
            prepared.push(steps);
        }
        Ok(prepared)
    }

    async fn is_stable(&self, hash_before: &ContentHash, options: &PipelineOptions) -> bool {
        if hash_before.is_unknown() || !options.stability_check {
            return true;
        }
        let hash_after = self.run_cache.current_hash().await;
        if &hash_after != hash_before {
            warn!(
                before = %hash_before.short(),
                after = %hash_after.short(),
                "Working tree changed during the run, results will not be cached"
            );
            return false;
        }
        true
    }

    async fn run_phase(
        &self,
        phase: &Phase,
        prepared: &[PreparedStep],
        hash: &ContentHash,
        log: Option<&RunLog>,
        options: &PipelineOptions,
        run: &mut RunState,
    ) -> PhaseResult {
        let mut slots: Vec<Option<StepResult>> = vec![None; prepared.len()];
        let mut to_run: Vec<PreparedStep> = Vec::new();
        let mut to_run_slots: Vec<usize> = Vec::new();

        for (idx, step) in prepared.iter().enumerate() {
            match self
                .run_cache
                .lookup_at(hash, &step.step.command, &step.workdir.relative)
                .await
            {
                CacheLookup::Hit(record) => {
                    debug!(step = %step.step.name, "Step answered from cache");
                    let result = StepResult::from_cached(&step.step.name, &record);
                    if let Some(path) = &result.captured_output_ref {
                        run.outputs
                            .push((result.name.clone(), RunLog::read_lines(path).await));
                    }
                    slots[idx] = Some(result);
                }
                CacheLookup::Miss(reason) => {
                    debug!(step = %step.step.name, ?reason, "Step cache miss");
                    to_run.push(step.clone());
                    to_run_slots.push(idx);
                }
            }
        }

        let scheduler_options = SchedulerOptions {
            fail_fast: options.fail_fast,
            parallel: phase.parallel && !options.force_sequential,
            context: self.run_cache.context().clone(),
        };
        let mut outcome = self
            .scheduler
            .run(&to_run, &phase.name, &scheduler_options)
            .await;

        // Results are in configured order; a sequential stop only drops the tail
        for (mut result, slot) in outcome.step_results.into_iter().zip(to_run_slots) {
            let output = outcome.outputs_by_step_name.remove(&result.name);
            if let (Some(log), Some(output)) = (log, &output) {
                result.captured_output_ref = log.write_step(&phase.name, &result.name, &output.lines).await;
            }
            if result.passed {
                run.pending.push(PendingStore {
                    command: prepared[slot].step.command.clone(),
                    workdir: prepared[slot].workdir.relative.clone(),
                    run: MergedRun::from(&result),
                });
            }
            if run.failed_step_name.is_none() && outcome.failed_step.as_deref() == Some(result.name.as_str()) {
                run.failed_step_name = Some(result.name.clone());
                run.failed_step_output = output.as_ref().map(|o| o.tail(FAILED_OUTPUT_TAIL_LINES));
            }
            if let Some(output) = output {
                run.outputs.push((result.name.clone(), output.lines));
            }
            slots[slot] = Some(result);
        }

        let steps: Vec<StepResult> = slots.into_iter().flatten().collect();
        PhaseResult {
            name: phase.name.clone(),
            passed: outcome.success && steps.iter().all(|s| s.passed),
            steps,
            duration_seconds: outcome.duration_seconds,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::observer::{ChannelObserver, PhaseEvent};
    use gauntlet_core::{ExecutionContext, Step};
    use gauntlet_git::{InMemoryNoteStore, StaticContentHash, WorkdirResolver};
    use tempfile::TempDir;

    fn runner(dir: &TempDir, notes: Arc<InMemoryNoteStore>) -> PipelineRunner {
        let cache = RunCache::new(
            notes,
            Arc::new(StaticContentHash::new("tree")),
            WorkdirResolver::new(dir.path(), dir.path()),
            ExecutionContext::new(),
        );
        PipelineRunner::new(ParallelScheduler::default(), cache)
    }

    #[tokio::test]
    async fn test_phase_events_reach_observers() {
        let dir = TempDir::new().unwrap();
        let (observer, mut rx) = ChannelObserver::channel();
        let runner = runner(&dir, Arc::new(InMemoryNoteStore::new())).with_observer(Arc::new(observer));
        let phases = vec![Phase::new("only", vec![Step::new("ok", "true")])];

        let result = runner.run(&phases, &PipelineOptions::default()).await.unwrap();
        assert!(result.passed);
        assert!(matches!(rx.try_recv().unwrap(), PhaseEvent::Started { index: 0, .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            PhaseEvent::Completed { passed: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_step_output_is_tail() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, Arc::new(InMemoryNoteStore::new()));
        let phases = vec![Phase::new(
            "check",
            vec![Step::new("noisy", "for i in $(seq 1 60); do echo line$i; done; exit 1")],
        )];

        let result = runner.run(&phases, &PipelineOptions::default()).await.unwrap();
        let output = result.failed_step_output.unwrap();
        assert_eq!(output.lines().count(), FAILED_OUTPUT_TAIL_LINES);
        assert!(output.ends_with("line60"));
        assert_eq!(result.failed_step_name.as_deref(), Some("noisy"));
    }

    #[tokio::test]
    async fn test_pipeline_pass_is_cached() {
        let dir = TempDir::new().unwrap();
        let notes = Arc::new(InMemoryNoteStore::new());
        let runner = runner(&dir, notes.clone());
        let phases = vec![Phase::new("only", vec![Step::new("ok", "true")])];

        let first = runner.run(&phases, &PipelineOptions::default()).await.unwrap();
        assert!(!first.cached);
        let second = runner.run(&phases, &PipelineOptions::default()).await.unwrap();
        assert!(second.cached);
        assert!(notes.paths().iter().any(|p| p.starts_with("gauntlet/validate/")));
        assert!(notes.paths().iter().any(|p| p.starts_with("gauntlet/run/")));
    }

    #[tokio::test]
    async fn test_step_logs_are_written() {
        let dir = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        let runner = runner(&dir, Arc::new(InMemoryNoteStore::new())).with_log_dir(logs.path());
        let phases = vec![Phase::new("lint", vec![Step::new("echo", "echo hi")])];

        let result = runner.run(&phases, &PipelineOptions::default()).await.unwrap();
        let path = result.phases[0].steps[0].captured_output_ref.clone().unwrap();
        assert!(path.ends_with("tree/lint-echo.jsonl"));
        assert_eq!(RunLog::read_lines(&path).await[0].text, "hi");
        assert!(logs.path().join("tree").join(crate::run_log::CONSOLIDATED_LOG).exists());
    }

    #[tokio::test]
    async fn test_traversing_step_cwd_is_rejected() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let runner = runner(&dir, Arc::new(InMemoryNoteStore::new()));
        let phases = vec![Phase::new(
            "p",
            vec![
                Step::new("ok", format!("touch {}", marker.display())),
                Step::new("bad", "true").with_cwd("../.."),
            ],
        )];

        assert!(runner.run(&phases, &PipelineOptions::default()).await.is_err());
        assert!(!marker.exists());
    }
}
