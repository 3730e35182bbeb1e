//! Run lifecycle state and status snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a [`RunController`](super::RunController).
///
/// # State Machine
///
/// ```text
/// Idle ──start──> Running ──(sequence exhausted)──> Done
///                  │   ▲                             ▲
///             pause│   │resume / start               │
///                  ▼   │                             │
///                 Paused ─────────stop───────────────┤
///                                                    │
/// Running ──(write error / reply timeout)──> Failed  │
/// any state ───────────────stop──────────────────────┘
/// ```
///
/// `Done` and `Failed` are terminal. `stop()` leaves `Failed` in place so the
/// error stays visible to pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Connected, no run started yet
    Idle,
    /// Sequencing loop active
    Running,
    /// Loop suspended at a check-point, channel parked
    Paused,
    /// Sequence completed or stopped
    Done,
    /// Loop aborted by a transport error
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "Idle"),
            RunState::Running => write!(f, "Running"),
            RunState::Paused => write!(f, "Paused"),
            RunState::Done => write!(f, "Done"),
            RunState::Failed => write!(f, "Failed"),
        }
    }
}

impl RunState {
    /// Check if the state allows `start`.
    pub fn can_start(&self) -> bool {
        matches!(self, RunState::Idle | RunState::Paused)
    }

    /// Check if the state allows pausing.
    pub fn can_pause(&self) -> bool {
        matches!(self, RunState::Running)
    }

    /// Check if the state allows resuming. From `Running` a resume only
    /// cancels a pending pause.
    pub fn can_resume(&self) -> bool {
        matches!(self, RunState::Paused | RunState::Running)
    }

    /// `Done` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

/// Point-in-time view of the controller for pollers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatus {
    /// Lifecycle state
    pub state: RunState,
    /// Index of the next RUN command to send
    pub position: usize,
    /// Fraction count of the active run
    pub fraction_count: Option<usize>,
    /// Dwell per tube of the active run
    pub dwell: Option<Duration>,
    /// When the first `start` was accepted
    pub started_at: Option<DateTime<Utc>>,
    /// A pause was requested and has not reached a check-point yet
    pub pause_requested: bool,
    /// Error that moved the run to `Failed`
    pub last_error: Option<String>,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self {
            state: RunState::Idle,
            position: 0,
            fraction_count: None,
            dwell: None,
            started_at: None,
            pause_requested: false,
            last_error: None,
        }
    }
}

impl RunStatus {
    /// RUN commands still to be sent in the active run.
    pub fn remaining(&self) -> Option<usize> {
        self.fraction_count
            .map(|count| (count + 1).saturating_sub(self.position))
    }

    /// Lower bound on the time left, counting one dwell per remaining command.
    pub fn remaining_time(&self) -> Option<Duration> {
        let remaining = u32::try_from(self.remaining()?).ok()?;
        self.dwell?.checked_mul(remaining)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at position {}", self.state, self.position)?;
        if let Some(count) = self.fraction_count {
            write!(f, " of {}", count + 1)?;
        }
        if self.pause_requested {
            write!(f, " (pause pending)")?;
        }
        if let Some(error) = &self.last_error {
            write!(f, ": {}", error)?;
        }
        Ok(())
    }
}
