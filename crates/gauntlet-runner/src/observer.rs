//! Phase lifecycle observers
//!
//! Observers are advisory: they see phase boundaries for progress
//! reporting and can never change what the pipeline does. A panicking
//! observer is logged and skipped.

use gauntlet_core::{Phase, PhaseResult};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Receives phase boundary notifications
pub trait PipelineObserver: Send + Sync {
    fn on_phase_start(&self, _phase: &Phase, _index: usize) {}

    fn on_phase_complete(&self, _phase: &Phase, _result: &PhaseResult) {}
}

/// Logs phase boundaries through tracing
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_phase_start(&self, phase: &Phase, index: usize) {
        info!(
            "Starting phase {} `{}` ({} steps)",
            index + 1,
            phase.name,
            phase.steps.len()
        );
    }

    fn on_phase_complete(&self, phase: &Phase, result: &PhaseResult) {
        info!(
            "Phase `{}` {} in {:.2}s",
            phase.name,
            if result.passed { "passed" } else { "failed" },
            result.duration_seconds
        );
    }
}

/// Lifecycle event delivered over a channel
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseEvent {
    Started { name: String, index: usize },
    Completed { name: String, passed: bool, duration_seconds: f64 },
}

/// Forwards lifecycle events to an unbounded channel
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<PhaseEvent>,
}

impl ChannelObserver {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PhaseEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PipelineObserver for ChannelObserver {
    fn on_phase_start(&self, phase: &Phase, index: usize) {
        // A dropped receiver just means nobody is listening
        let _ = self.tx.send(PhaseEvent::Started {
            name: phase.name.clone(),
            index,
        });
    }

    fn on_phase_complete(&self, phase: &Phase, result: &PhaseResult) {
        let _ = self.tx.send(PhaseEvent::Completed {
            name: phase.name.clone(),
            passed: result.passed,
            duration_seconds: result.duration_seconds,
        });
    }
}

/// Ordered set of observers, notified fail-open
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn PipelineObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: Arc<dyn PipelineObserver>) {
        self.observers.push(observer);
    }

    pub fn phase_started(&self, phase: &Phase, index: usize) {
        for (idx, observer) in self.observers.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| observer.on_phase_start(phase, index)));
            if outcome.is_err() {
                warn!("Observer {} panicked on phase start (continuing)", idx + 1);
            }
        }
    }

    pub fn phase_completed(&self, phase: &Phase, result: &PhaseResult) {
        for (idx, observer) in self.observers.iter().enumerate() {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| observer.on_phase_complete(phase, result)));
            if outcome.is_err() {
                warn!("Observer {} panicked on phase completion (continuing)", idx + 1);
            }
        }
    }
}
