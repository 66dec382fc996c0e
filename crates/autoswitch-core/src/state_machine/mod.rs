use crate::error::LifecycleError;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a supervised worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Process started, not yet accepting traffic
    Spawning,
    /// Accepting traffic
    Listening,
    /// Asked to be replaced; a successor is being brought up
    Retiring,
    /// Shutdown sent, grace timer running
    ShuttingDown,
    /// Process gone
    Exited,
}

/// Validates a state transition.
///
/// Illegal transitions indicate a supervisor bug. They are reported as an
/// error so the event loop can log and carry on; the `strict-debug` feature
/// turns them into a panic.
pub fn validate_transition(from: WorkerState, to: WorkerState) -> Result<(), LifecycleError> {
    if allowed(from, to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal worker transition attempted: {from:?} -> {to:?}");

        Err(LifecycleError::IllegalTransition { from, to })
    }
}

/// States reachable from `from` in one step.
pub fn allowed_transitions(from: WorkerState) -> Vec<WorkerState> {
    use WorkerState::*;
    match from {
        // A workload that never binds a socket may still observe drift.
        Spawning => vec![Listening, Retiring, ShuttingDown, Exited],
        Listening => vec![Retiring, ShuttingDown, Exited],
        // Back to Listening when the replacement is abandoned.
        Retiring => vec![Listening, ShuttingDown, Exited],
        ShuttingDown => vec![Exited],
        Exited => vec![],
    }
}

fn allowed(from: WorkerState, to: WorkerState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}
