//! Phase scheduling
//!
//! All steps of a phase start together (or one after another for a
//! sequential phase). With fail-fast on, the first failing step cancels the
//! phase token and every sibling still running is killed and reported as
//! terminated, never as a clean pass.

use gauntlet_core::{ExecutionContext, Extraction, GauntletError, Step, StepResult};
use gauntlet_git::ResolvedWorkdir;
use std::collections::HashMap;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::{CapturedOutput, StepExecutor, StepOptions, SPAWN_FAILURE_EXIT_CODE};
use crate::merger::OutputMerger;

/// A step with its working directory already validated
#[derive(Debug, Clone)]
pub struct PreparedStep {
    pub step: Step,
    pub workdir: ResolvedWorkdir,
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerOptions {
    pub fail_fast: bool,
    pub parallel: bool,
    pub context: ExecutionContext,
}

/// Aggregate result of one phase's executed steps
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub success: bool,
    pub outputs_by_step_name: HashMap<String, CapturedOutput>,
    /// In configured order; steps a sequential fail-fast never reached are absent
    pub step_results: Vec<StepResult>,
    pub failed_step: Option<String>,
    pub duration_seconds: f64,
}

struct StepRun {
    result: StepResult,
    output: CapturedOutput,
}

/// Runs the steps of one phase
#[derive(Clone, Default)]
pub struct ParallelScheduler {
    executor: StepExecutor,
    merger: OutputMerger,
}

impl ParallelScheduler {
    pub fn new(executor: StepExecutor, merger: OutputMerger) -> Self {
        Self { executor, merger }
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub fn merger(&self) -> &OutputMerger {
        &self.merger
    }

    pub async fn run(
        &self,
        steps: &[PreparedStep],
        phase_name: &str,
        options: &SchedulerOptions,
    ) -> PhaseOutcome {
        let started = Instant::now();
        debug!(
            phase = phase_name,
            steps = steps.len(),
            parallel = options.parallel,
            fail_fast = options.fail_fast,
            "Scheduling phase"
        );

        let (mut slots, failed_step) = if options.parallel {
            self.run_parallel(steps, phase_name, options).await
        } else {
            self.run_sequential(steps, phase_name, options).await
        };

        if let Some(failed) = &failed_step {
            for run in slots.iter_mut().flatten() {
                if run.result.terminated {
                    run.result.extraction = Some(Extraction::terminated_by_fail_fast(failed));
                }
            }
        }

        let all_ran = slots.iter().all(Option::is_some);
        let mut outputs_by_step_name = HashMap::new();
        let mut step_results = Vec::with_capacity(slots.len());
        for run in slots.into_iter().flatten() {
            outputs_by_step_name.insert(run.result.name.clone(), run.output);
            step_results.push(run.result);
        }
        let success = all_ran && step_results.iter().all(|r| r.passed);

        PhaseOutcome {
            success,
            outputs_by_step_name,
            step_results,
            failed_step,
            duration_seconds: started.elapsed().as_secs_f64(),
        }
    }

    async fn run_parallel(
        &self,
        steps: &[PreparedStep],
        phase_name: &str,
        options: &SchedulerOptions,
    ) -> (Vec<Option<StepRun>>, Option<String>) {
        let phase_cancel = CancellationToken::new();
        let env = options.context.child_env();
        let mut join_set: JoinSet<(usize, StepRun)> = JoinSet::new();

        for (idx, prepared) in steps.iter().cloned().enumerate() {
            let executor = self.executor.clone();
            let merger = self.merger.clone();
            let env = env.clone();
            let cancel = phase_cancel.child_token();
            join_set.spawn(async move {
                (idx, run_step(&executor, &merger, &prepared, env, cancel).await)
            });
        }

        let mut slots: Vec<Option<StepRun>> = (0..steps.len()).map(|_| None).collect();
        let mut failed_step: Option<String> = None;

        while let Some(joined) = join_set.join_next().await {
            let (idx, run) = match joined {
                Ok(joined) => joined,
                Err(e) => {
                    warn!(phase = phase_name, "Step task did not complete: {}", e);
                    continue;
                }
            };
            if !run.result.passed && !run.result.terminated && failed_step.is_none() {
                failed_step = Some(run.result.name.clone());
                if options.fail_fast {
                    info!(
                        phase = phase_name,
                        step = %run.result.name,
                        "Step failed, terminating siblings"
                    );
                    phase_cancel.cancel();
                }
            }
            slots[idx] = Some(run);
        }

        // A task that panicked still needs a slot
        for (idx, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                let step = &steps[idx].step;
                failed_step.get_or_insert_with(|| step.name.clone());
                *slot = Some(StepRun {
                    result: failed_result(step, 1, Extraction::new("step task aborted", Vec::new())),
                    output: CapturedOutput::default(),
                });
            }
        }

        (slots, failed_step)
    }

    async fn run_sequential(
        &self,
        steps: &[PreparedStep],
        phase_name: &str,
        options: &SchedulerOptions,
    ) -> (Vec<Option<StepRun>>, Option<String>) {
        let env = options.context.child_env();
        let mut slots: Vec<Option<StepRun>> = (0..steps.len()).map(|_| None).collect();
        let mut failed_step: Option<String> = None;

        for (idx, prepared) in steps.iter().enumerate() {
            let run = run_step(
                &self.executor,
                &self.merger,
                prepared,
                env.clone(),
                CancellationToken::new(),
            )
            .await;
            let failed = !run.result.passed;
            if failed && failed_step.is_none() {
                failed_step = Some(run.result.name.clone());
            }
            slots[idx] = Some(run);

            if failed && options.fail_fast {
                info!(
                    phase = phase_name,
                    skipped = steps.len() - idx - 1,
                    "Step failed, skipping remaining sequential steps"
                );
                break;
            }
        }

        (slots, failed_step)
    }
}

async fn run_step(
    executor: &StepExecutor,
    merger: &OutputMerger,
    prepared: &PreparedStep,
    env: Vec<(String, String)>,
    cancel: CancellationToken,
) -> StepRun {
    let step = &prepared.step;
    let options = StepOptions::new(&prepared.workdir.absolute).with_env(env);

    let execution = match executor
        .run_cancellable(&step.name, &step.command, &options, cancel)
        .await
    {
        Ok(execution) => execution,
        Err(GauntletError::Spawn { reason, .. }) => {
            warn!(step = %step.name, "Failed to spawn: {}", reason);
            return StepRun {
                result: failed_result(step, SPAWN_FAILURE_EXIT_CODE, Extraction::spawn_failure(reason)),
                output: CapturedOutput::default(),
            };
        }
        Err(e) => {
            warn!(step = %step.name, "Step execution failed: {}", e);
            return StepRun {
                result: failed_result(step, 1, Extraction::new(e.to_string(), Vec::new())),
                output: CapturedOutput::default(),
            };
        }
    };

    if execution.terminated {
        let mut result = failed_result(
            step,
            execution.exit_code,
            Extraction::new("terminated", Vec::new()),
        );
        result.duration_seconds = execution.duration_seconds;
        result.terminated = true;
        return StepRun {
            result,
            output: execution.output,
        };
    }

    let merged = merger.merge(
        &step.command,
        &execution.output,
        execution.exit_code,
        execution.duration_seconds,
    );
    StepRun {
        result: StepResult {
            name: step.name.clone(),
            command: merged.command,
            requested_command: merged.requested_command,
            passed: merged.exit_code == 0,
            exit_code: merged.exit_code,
            duration_seconds: merged.duration_seconds,
            captured_output_ref: None,
            extraction: merged.extraction,
            cached: false,
            terminated: false,
        },
        output: execution.output,
    }
}

fn failed_result(step: &Step, exit_code: i32, extraction: Extraction) -> StepResult {
    StepResult {
        name: step.name.clone(),
        command: step.command.clone(),
        requested_command: None,
        passed: false,
        exit_code,
        duration_seconds: 0.0,
        captured_output_ref: None,
        extraction: Some(extraction),
        cached: false,
        terminated: false,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use gauntlet_core::FORCE_ENV_VAR;
    use tempfile::TempDir;

    fn prepared(dir: &TempDir, name: &str, command: &str) -> PreparedStep {
        PreparedStep {
            step: Step::new(name, command),
            workdir: ResolvedWorkdir {
                absolute: dir.path().to_path_buf(),
                relative: ".".to_string(),
            },
        }
    }

    fn options(fail_fast: bool, parallel: bool) -> SchedulerOptions {
        SchedulerOptions {
            fail_fast,
            parallel,
            context: ExecutionContext::new(),
        }
    }

    #[tokio::test]
    async fn test_results_keep_configured_order() {
        let dir = TempDir::new().unwrap();
        let steps = vec![
            prepared(&dir, "slow", "sleep 0.3; echo slow"),
            prepared(&dir, "fast", "echo fast"),
        ];
        let outcome = ParallelScheduler::default()
            .run(&steps, "check", &options(true, true))
            .await;

        assert!(outcome.success);
        let names: Vec<&str> = outcome.step_results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["slow", "fast"]);
        assert_eq!(outcome.outputs_by_step_name["fast"].stdout, "fast\n");
    }

    #[tokio::test]
    async fn test_sequential_fail_fast_skips_remaining() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let steps = vec![
            prepared(&dir, "first", "exit 2"),
            prepared(&dir, "second", &format!("touch {}", marker.display())),
        ];
        let outcome = ParallelScheduler::default()
            .run(&steps, "seq", &options(true, false))
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.failed_step.as_deref(), Some("first"));
        assert_eq!(outcome.step_results.len(), 1);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_as_failed_step() {
        let dir = TempDir::new().unwrap();
        let mut step = prepared(&dir, "ghost", "true");
        step.workdir.absolute = dir.path().join("missing");
        let outcome = ParallelScheduler::default()
            .run(&[step], "p", &options(true, true))
            .await;

        let result = &outcome.step_results[0];
        assert!(!outcome.success);
        assert_eq!(result.exit_code, SPAWN_FAILURE_EXIT_CODE);
        assert!(result.extraction.as_ref().unwrap().summary.starts_with("failed to spawn"));
    }

    #[tokio::test]
    async fn test_force_flag_reaches_children() {
        let dir = TempDir::new().unwrap();
        let steps = vec![prepared(&dir, "env", &format!("echo ${}", FORCE_ENV_VAR))];
        let mut opts = options(true, true);
        opts.context = ExecutionContext::new().with_force(true);

        let outcome = ParallelScheduler::default().run(&steps, "p", &opts).await;
        assert_eq!(outcome.outputs_by_step_name["env"].stdout.trim(), "1");
    }
}
