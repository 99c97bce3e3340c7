//! Job and task state machine vocabulary.
//!
//! Jobs and tasks share one set of states. Terminality is a static property
//! of the state and is the guard used everywhere a transition could touch a
//! finished job or task.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Created, not yet committed.
    New,
    /// Committed, waiting for predecessors to complete.
    Waiting,
    /// Eligible for dispatch.
    Ready,
    /// Claimed by a worker or awaiting an asynchronous report.
    Active,
    /// Canary task completed; waiting for an operator confirmation.
    Confirm,
    /// Active for longer than the expiry window.
    Timeout,
    Failed,
    Cancelled,
    Skipped,
    Rejected,
    Completed,
}

impl State {
    pub const ALL: [State; 11] = [
        State::New,
        State::Waiting,
        State::Ready,
        State::Active,
        State::Confirm,
        State::Timeout,
        State::Failed,
        State::Cancelled,
        State::Skipped,
        State::Rejected,
        State::Completed,
    ];

    /// Stable upper-case name, also used as the persisted column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::New => "NEW",
            State::Waiting => "WAITING",
            State::Ready => "READY",
            State::Active => "ACTIVE",
            State::Confirm => "CONFIRM",
            State::Timeout => "TIMEOUT",
            State::Failed => "FAILED",
            State::Cancelled => "CANCELLED",
            State::Skipped => "SKIPPED",
            State::Rejected => "REJECTED",
            State::Completed => "COMPLETED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            State::Failed | State::Cancelled | State::Skipped | State::Rejected | State::Completed
        )
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, State::Completed)
    }

    /// Task outcomes that fail the owning job.
    pub fn is_failure(&self) -> bool {
        matches!(self, State::Failed | State::Rejected)
    }

    /// Whether a resume operation may re-arm a task in this state to WAITING.
    pub fn is_resumable(&self) -> bool {
        !matches!(self, State::New | State::Active | State::Completed)
    }
}

impl core::fmt::Display for State {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::validation(format!("unknown state: {s}")))
    }
}
