//! Termination attempt model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::process::ProcessHandle;

/// State of a single termination attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TerminationState {
    /// Attempt created; nothing sent yet.
    Requested,
    /// Graceful signal delivered.
    GracefulSent,
    /// Waiting for the process to leave the registry.
    WaitingForExit,
    /// Grace period expired; hard kill delivered.
    ForceSent,
    /// Process confirmed gone.
    Confirmed,
    /// Attempt ended without confirming exit.
    Failed,
}

impl TerminationState {
    /// Whether no further transitions can follow.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

/// Why an attempt ended in [`TerminationState::Failed`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum FailureReason {
    /// Target is classified `Protected`.
    ProtectedProcessRejected,
    /// Neither graceful nor forced signal produced an exit in time.
    TerminationTimeout,
    /// A signal could not be delivered.
    SignalFailed(String),
    /// Caller cancelled before the attempt completed.
    Cancelled,
}

/// One recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Transition {
    /// State entered.
    pub state: TerminationState,
    /// When it was entered.
    pub at: DateTime<Utc>,
}

/// Per-process termination record, owned by the protocol while running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TerminationAttempt {
    /// Process being terminated.
    pub target: ProcessHandle,
    /// Current state.
    pub state: TerminationState,
    /// Creation time.
    pub started_at: DateTime<Utc>,
    /// Deadline of the wait currently in progress, if any.
    pub deadline: Option<DateTime<Utc>>,
    /// Failure reason once `state == Failed`.
    pub failure: Option<FailureReason>,
    /// Every state entered, in order, starting with `Requested`.
    pub transitions: Vec<Transition>,
}

impl TerminationAttempt {
    /// Create a new attempt in `Requested` state.
    #[must_use]
    pub fn new(target: ProcessHandle) -> Self {
        let now = Utc::now();
        Self {
            target,
            state: TerminationState::Requested,
            started_at: now,
            deadline: None,
            failure: None,
            transitions: vec![Transition {
                state: TerminationState::Requested,
                at: now,
            }],
        }
    }

    /// Move to `next`, recording the transition.
    pub fn advance(&mut self, next: TerminationState) {
        self.state = next;
        self.transitions.push(Transition {
            state: next,
            at: Utc::now(),
        });
    }

    /// Move to `Failed` with the given reason.
    pub fn fail(&mut self, reason: FailureReason) {
        self.failure = Some(reason);
        self.deadline = None;
        self.advance(TerminationState::Failed);
    }

    /// Ordered list of states visited.
    #[must_use]
    pub fn path(&self) -> Vec<TerminationState> {
        self.transitions.iter().map(|t| t.state).collect()
    }

    /// Whether the process was confirmed gone.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.state == TerminationState::Confirmed
    }
}

/// Tally of a bulk termination run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BulkSummary {
    /// Attempts that ended `Confirmed`.
    pub confirmed: usize,
    /// Attempts that ended `Failed`.
    pub failed: usize,
    /// Processes left untouched because of their classification.
    pub preserved: usize,
}

impl BulkSummary {
    /// Count outcomes of a finished bulk run.
    #[must_use]
    pub fn tally(attempts: &[TerminationAttempt], preserved: usize) -> Self {
        let confirmed = attempts.iter().filter(|a| a.is_confirmed()).count();
        Self {
            confirmed,
            failed: attempts.len() - confirmed,
            preserved,
        }
    }
}
