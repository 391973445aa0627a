//! Process-wide throttle level computed by the resource governor.

use serde::{Deserialize, Serialize};

/// Self-imposed operating mode of the orchestrator.
///
/// Ordered from least to most constrained so levels compare naturally.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleLevel {
    /// No resource pressure.
    #[default]
    Normal,
    /// Memory above the warning threshold or host under thermal/power pressure.
    Constrained,
    /// Memory above the emergency threshold or host in critical state.
    Emergency,
}

impl ThrottleLevel {
    /// Multiplier applied to the registry's base reconciliation interval.
    #[must_use]
    pub fn interval_multiplier(self) -> u32 {
        match self {
            Self::Normal => 1,
            Self::Constrained => 2,
            Self::Emergency => 4,
        }
    }

    /// Maximum number of termination attempts allowed in flight.
    #[must_use]
    pub fn max_concurrent(self) -> usize {
        match self {
            Self::Normal => 8,
            Self::Constrained => 4,
            Self::Emergency => 1,
        }
    }

    /// The next level towards `target`, one step at a time.
    #[must_use]
    pub fn step_towards(self, target: Self) -> Self {
        match self.cmp(&target) {
            std::cmp::Ordering::Less => match self {
                Self::Normal => Self::Constrained,
                Self::Constrained | Self::Emergency => Self::Emergency,
            },
            std::cmp::Ordering::Greater => match self {
                Self::Emergency => Self::Constrained,
                Self::Constrained | Self::Normal => Self::Normal,
            },
            std::cmp::Ordering::Equal => self,
        }
    }

    /// Short lowercase label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Constrained => "constrained",
            Self::Emergency => "emergency",
        }
    }
}
