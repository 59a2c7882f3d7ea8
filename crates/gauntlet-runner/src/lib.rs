//! # gauntlet-runner
//!
//! Execution engine and run cache for gauntlet.
//!
//! This crate provides:
//! - Cache key encoding and the single-command run cache
//! - The pipeline-level result cache
//! - Step execution with process-group cancellation
//! - Parallel and sequential phase scheduling with fail-fast
//! - Pipeline control flow as a pure state machine
//! - Structured result documents and nested-invocation unwrapping

mod cache_key;
pub mod document;
mod executor;
mod extract;
mod merger;
mod observer;
mod pipeline;
mod pipeline_cache;
mod registry;
mod run_cache;
mod run_log;
mod scheduler;
mod single;
pub mod state;

pub use cache_key::{CacheKey, CacheKeyCodec, CacheNamespace, TOOL_NAMESPACE};
pub use document::{ParseOutcome, PipelineDocument, ResultDocument, RunDocument};
pub use executor::{
    CapturedOutput, ExecutionOutput, StepExecutor, StepOptions, GENERIC_FAILURE_EXIT_CODE,
    SPAWN_FAILURE_EXIT_CODE,
};
pub use extract::{GenericParser, OutputParser, MAX_EXTRACTED_ERRORS};
pub use merger::{MergedRun, NestedKind, OutputMerger};
pub use observer::{ChannelObserver, ObserverSet, PhaseEvent, PipelineObserver, TracingObserver};
pub use pipeline::{PipelineOptions, PipelineRunner, FAILED_OUTPUT_TAIL_LINES};
pub use pipeline_cache::PipelineCache;
pub use registry::{
    install_shutdown_hook, kill_process_tree, ProcessGuard, ProcessRegistry, INTERRUPTED_EXIT_CODE,
};
pub use run_cache::{CacheLookup, MissReason, RunCache, StoreOutcome};
pub use run_log::{RunLog, CONSOLIDATED_LOG};
pub use scheduler::{ParallelScheduler, PhaseOutcome, PreparedStep, SchedulerOptions};
pub use single::{SingleRunReport, SingleRunner};
