//! Task lifecycle status and its transition state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Task lifecycle status.
///
/// Six closed-set values. `Blocked` is derived-but-storable: the
/// [`crate::service::TaskService`] may set and clear it automatically as
/// dependencies change (see [`TaskStatus::can_transition_to`] for the edges
/// a caller may request directly).
///
/// # State Machine
///
/// ```text
///  pending ───► in-progress ───► done
///  │               │    ▲
///  │               └──► blocked ──┘
///  │               │
///  └──────────────────────► cancelled ◄─────┘
///  done ─► archived
///  cancelled ─► archived
/// ```
///
/// `pending -> done` is deliberately absent: a task must pass through
/// `in-progress` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet started; the default status for a new task.
    Pending,
    /// Actively being worked on.
    InProgress,
    /// Storable-but-derived: waiting on an incomplete dependency.
    Blocked,
    /// Finished successfully (terminal with respect to active work).
    Done,
    /// Abandoned (terminal with respect to active work).
    Cancelled,
    /// Retired from view; reachable only from `Done` or `Cancelled`.
    Archived,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Archived => "archived",
        };
        write!(f, "{s}")
    }
}

impl TaskStatus {
    /// Statuses that represent a task still subject to active planning.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Archived)
    }

    /// Whether a direct, caller-requested transition from `self` to `next`
    /// is allowed by the state machine in this type's documentation.
    ///
    /// Note: the `Blocked` transitions into/out of `Pending` are normally
    /// performed by the service's auto-cascade rule, not a direct caller
    /// request, but they are *structurally* legal transitions -- callers
    /// that manage their own blocking (e.g. administrative tools) are not
    /// forbidden from requesting them explicitly.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self == next {
            return false;
        }
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Blocked)
                | (Pending, Cancelled)
                | (InProgress, Done)
                | (InProgress, Blocked)
                | (InProgress, Cancelled)
                | (Blocked, InProgress)
                | (Blocked, Pending)
                | (Blocked, Cancelled)
                | (Done, Archived)
                | (Cancelled, Archived)
        )
    }

    /// Validates a transition, producing a structured
    /// [`EngineError::IllegalTransition`] on rejection.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskgraph_engine::types::TaskStatus;
    ///
    /// assert!(TaskStatus::Pending.validate_transition(&TaskStatus::Done).is_err());
    /// assert!(TaskStatus::Pending.validate_transition(&TaskStatus::InProgress).is_ok());
    /// ```
    pub fn validate_transition(&self, next: &Self) -> Result<(), EngineError> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        let reason = if *self == TaskStatus::Pending && *next == TaskStatus::Done {
            "pending must pass through in-progress before done".to_string()
        } else if self.is_terminal() {
            "archived is terminal and accepts no further transitions".to_string()
        } else if self == next {
            format!("task is already {self}")
        } else {
            format!("{self} has no direct transition to {next}")
        };
        Err(EngineError::IllegalTransition {
            from: *self,
            to: *next,
            reason,
        })
    }
}
