//! Pure state machine for pipeline control flow
//!
//! `transition(state, event)` decides which phase runs next and when the
//! pipeline is finished. No I/O and no async: the runner feeds it phase
//! outcomes and executes the actions it returns.

/// Pipeline progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    NotStarted,
    /// Phase `index` of `total` is executing
    RunningPhase { index: usize, total: usize },
    Passed,
    /// Stopped at phase `phase`; later phases never start
    Failed { phase: usize },
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed { .. })
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    Start { phase_count: usize },
    PhasePassed,
    PhaseFailed,
}

/// Side effects the runner should carry out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineAction {
    RunPhase { index: usize },
    Finish { passed: bool },
}

/// Pure state transition function
///
/// Events that make no sense in the current state leave it unchanged and
/// produce no actions. Never panics.
pub fn transition(state: PipelineState, event: PipelineEvent) -> (PipelineState, Vec<PipelineAction>) {
    match (state, event) {
        (PipelineState::NotStarted, PipelineEvent::Start { phase_count: 0 }) => (
            PipelineState::Passed,
            vec![PipelineAction::Finish { passed: true }],
        ),
        (PipelineState::NotStarted, PipelineEvent::Start { phase_count }) => (
            PipelineState::RunningPhase {
                index: 0,
                total: phase_count,
            },
            vec![PipelineAction::RunPhase { index: 0 }],
        ),

        (PipelineState::RunningPhase { index, total }, PipelineEvent::PhasePassed) => {
            let next = index + 1;
            if next < total {
                (
                    PipelineState::RunningPhase { index: next, total },
                    vec![PipelineAction::RunPhase { index: next }],
                )
            } else {
                (
                    PipelineState::Passed,
                    vec![PipelineAction::Finish { passed: true }],
                )
            }
        }
        (PipelineState::RunningPhase { index, .. }, PipelineEvent::PhaseFailed) => (
            PipelineState::Failed { phase: index },
            vec![PipelineAction::Finish { passed: false }],
        ),

        (state, _) => (state, Vec::new()),
    }
}
