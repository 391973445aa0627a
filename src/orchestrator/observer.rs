//! Caller-supplied observer for state transitions.

use tracing::info;

use crate::models::restart::RestartSession;
use crate::models::termination::TerminationAttempt;
use crate::models::throttle::ThrottleLevel;

/// Receives every state transition the orchestrator makes.
///
/// Callbacks run inline on the orchestrator's tasks and must not block.
pub trait TransitionObserver: Send + Sync {
    /// A termination attempt entered a new state.
    fn termination_transition(&self, _attempt: &TerminationAttempt) {}

    /// A restart session entered a new step.
    fn restart_transition(&self, _session: &RestartSession) {}

    /// The governor published a new throttle level.
    fn throttle_changed(&self, _from: ThrottleLevel, _to: ThrottleLevel) {}
}

/// Observer that writes every transition to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TransitionObserver for TracingObserver {
    fn termination_transition(&self, attempt: &TerminationAttempt) {
        info!(
            pid = attempt.target.process_id,
            name = %attempt.target.display_name,
            state = ?attempt.state,
            failure = ?attempt.failure,
            "termination transition"
        );
    }

    fn restart_transition(&self, session: &RestartSession) {
        info!(
            session_id = %session.id,
            pid = session.target.process_id,
            step = session.step.as_str(),
            "restart transition"
        );
    }

    fn throttle_changed(&self, from: ThrottleLevel, to: ThrottleLevel) {
        info!(from = from.as_str(), to = to.as_str(), "throttle transition");
    }
}
