//! Restart session model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::process::ProcessHandle;
use super::termination::TerminationAttempt;

/// Opaque application state produced by a capture hook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapturedState(pub serde_json::Value);

/// Step of a restart cycle. The last three are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RestartStep {
    /// Running the capture hook.
    Capturing,
    /// Running the termination protocol.
    Terminating,
    /// Launching the replacement and waiting for it to appear.
    WaitingRelaunch,
    /// Running the restore hook.
    Restoring,
    /// Finished; state restored or no state to restore.
    Restored,
    /// Finished; restore hook reported partial success or failed after capture.
    PartiallyRestored,
    /// Finished unsuccessfully.
    Failed,
}

impl RestartStep {
    /// Whether the session has finished.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Restored | Self::PartiallyRestored | Self::Failed)
    }

    /// Short lowercase label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Capturing => "capturing",
            Self::Terminating => "terminating",
            Self::WaitingRelaunch => "waiting_relaunch",
            Self::Restoring => "restoring",
            Self::Restored => "restored",
            Self::PartiallyRestored => "partially_restored",
            Self::Failed => "failed",
        }
    }
}

/// Result of the relaunch step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RelaunchResult {
    /// Replacement appeared in the registry.
    Success,
    /// Host refused to launch.
    LaunchFailed,
    /// Replacement did not appear before the launch timeout.
    Timeout,
}

/// Result of the restoration step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestorationResult {
    /// Hook restored everything.
    Restored,
    /// Hook restored part of the state.
    PartiallyRestored,
    /// No captured state; nothing to restore.
    Skipped,
    /// Hook raised an error or timed out.
    Failed,
}

/// Outcome reported by a restore hook that did not raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// All captured state was applied.
    Complete,
    /// Some captured state could not be applied.
    Partial,
}

/// Diagnostic for a failed (or cancelled) session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RestartFailure {
    /// Step that was running when the session failed.
    pub step: RestartStep,
    /// Human-readable reason.
    pub reason: String,
}

/// Per-process record spanning one full restart cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RestartSession {
    /// Unique session identifier.
    pub id: String,
    /// Process being restarted.
    pub target: ProcessHandle,
    /// Current step.
    pub step: RestartStep,
    /// State returned by the capture hook, if any.
    pub captured_state: Option<CapturedState>,
    /// Termination record, once the termination step ran.
    pub termination: Option<TerminationAttempt>,
    /// Relaunch result, once the relaunch step ran.
    pub relaunch_result: Option<RelaunchResult>,
    /// Restoration result, once the restore step ran.
    pub restoration_result: Option<RestorationResult>,
    /// Handle of the relaunched process.
    pub replacement: Option<ProcessHandle>,
    /// Failure diagnostic when `step == Failed`.
    pub failure: Option<RestartFailure>,
    /// Creation time.
    pub started_at: DateTime<Utc>,
    /// Completion time.
    pub finished_at: Option<DateTime<Utc>>,
}

impl RestartSession {
    /// Start a new session in `Capturing`.
    #[must_use]
    pub fn new(target: ProcessHandle) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target,
            step: RestartStep::Capturing,
            captured_state: None,
            termination: None,
            relaunch_result: None,
            restoration_result: None,
            replacement: None,
            failure: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// End the session in `Failed`, recording the step that failed.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failure = Some(RestartFailure {
            step: self.step,
            reason: reason.into(),
        });
        self.finish(RestartStep::Failed);
    }

    /// End the session in the given terminal step.
    pub fn finish(&mut self, step: RestartStep) {
        self.step = step;
        self.finished_at = Some(Utc::now());
    }
}
