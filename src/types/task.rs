//! Core task entity and its construction/validation rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::types::id::TaskId;
use crate::types::priority::{validate_priority_score, DEFAULT_PRIORITY_SCORE};
use crate::types::status::TaskStatus;

/// Minimum accepted title length, inclusive.
pub const MIN_TITLE_LEN: usize = 1;
/// Maximum accepted title length, inclusive.
pub const MAX_TITLE_LEN: usize = 200;
/// Maximum accepted description length, inclusive.
pub const MAX_DESCRIPTION_LEN: usize = 2000;

/// A unit of work: the atomic entity this crate tracks.
///
/// `prd` and `context_digest` are opaque blobs produced by external
/// generators -- this crate stores and returns them unchanged, never
/// interpreting their contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier, persistent or temporary (see [`TaskId`]).
    pub id: TaskId,
    /// Parent task id. `None` for a root task.
    pub parent_id: Option<TaskId>,
    /// Required, 1-200 characters.
    pub title: String,
    /// Optional, at most 2000 characters.
    pub description: Option<String>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Canonical priority in `[0.0, 100.0]`.
    pub priority_score: f64,
    /// Opaque generator payload, stored and returned unchanged.
    pub prd: Option<Value>,
    /// Opaque generator payload, stored and returned unchanged.
    pub context_digest: Option<Value>,
    /// Set by the store on insert; never mutated thereafter.
    pub created_at: DateTime<Utc>,
    /// Set by the store on insert and every update; monotonically
    /// non-decreasing per task.
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied fields for creating a new task. Identifiers and
/// timestamps are assigned by the store, never by the caller.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    /// Parent task id, if any.
    pub parent_id: Option<TaskId>,
    /// Required title.
    pub title: String,
    /// Optional description.
    pub description: Option<String>,
    /// Initial status; defaults to `Pending` when `None`.
    pub status: Option<TaskStatus>,
    /// Initial priority score; defaults to
    /// [`DEFAULT_PRIORITY_SCORE`] when `None`. A `Some` value outside
    /// `[0, 100]` is rejected, not clamped (spec boundary behavior).
    pub priority_score: Option<f64>,
    /// Opaque generator payload.
    pub prd: Option<Value>,
    /// Opaque generator payload.
    pub context_digest: Option<Value>,
}

/// A partial update applied to an existing task. `None` fields are left
/// untouched; `Some(None)` on an `Option<T>` field clears it.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    /// New parent, if changing. `Some(None)` detaches to a root task --
    /// callers should prefer [`crate::service::TaskService::move_subtree`]
    /// for that, which also validates against descendant cycles.
    pub parent_id: Option<Option<TaskId>>,
    /// New title.
    pub title: Option<String>,
    /// New description. `Some(None)` clears it.
    pub description: Option<Option<String>>,
    /// New status. Status changes made through this update bypass the
    /// service's dependency-aware checks -- callers that need those
    /// checks should use [`crate::service::TaskService::update_task_status`].
    pub status: Option<TaskStatus>,
    /// New priority score. A value outside `[0, 100]` is rejected, not
    /// clamped (spec boundary behavior).
    pub priority_score: Option<f64>,
    /// New `prd` payload. `Some(None)` clears it.
    pub prd: Option<Option<Value>>,
    /// New `context_digest` payload. `Some(None)` clears it.
    pub context_digest: Option<Option<Value>>,
}

impl TaskUpdate {
    /// `true` if this update would change nothing. Consolidation uses this
    /// to drop no-op `task_update` operations rather than emit them.
    pub fn is_empty(&self) -> bool {
        self.parent_id.is_none()
            && self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.priority_score.is_none()
            && self.prd.is_none()
            && self.context_digest.is_none()
    }

    /// Key-wise merges `other` over `self`: fields set in `other` win
    /// (last-writer-wins), fields left `None` in `other` keep `self`'s
    /// value. Used by tracking-tree consolidation (§4.5).
    pub fn merge_over(mut self, other: TaskUpdate) -> TaskUpdate {
        if other.parent_id.is_some() {
            self.parent_id = other.parent_id;
        }
        if other.title.is_some() {
            self.title = other.title;
        }
        if other.description.is_some() {
            self.description = other.description;
        }
        if other.status.is_some() {
            self.status = other.status;
        }
        if other.priority_score.is_some() {
            self.priority_score = other.priority_score;
        }
        if other.prd.is_some() {
            self.prd = other.prd;
        }
        if other.context_digest.is_some() {
            self.context_digest = other.context_digest;
        }
        self
    }
}

/// Validates a title against [`MIN_TITLE_LEN`]/[`MAX_TITLE_LEN`].
pub fn validate_title(title: &str) -> Result<(), EngineError> {
    let len = title.chars().count();
    if !(MIN_TITLE_LEN..=MAX_TITLE_LEN).contains(&len) {
        return Err(EngineError::Corrupt {
            what: format!(
                "title length {len} outside [{MIN_TITLE_LEN}, {MAX_TITLE_LEN}]"
            ),
        });
    }
    Ok(())
}

/// Validates a description against [`MAX_DESCRIPTION_LEN`].
pub fn validate_description(description: &str) -> Result<(), EngineError> {
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::Corrupt {
            what: format!("description longer than {MAX_DESCRIPTION_LEN} characters"),
        });
    }
    Ok(())
}

impl NewTask {
    /// Builds the fields a store would assign to a fresh [`Task`], applying
    /// validation (rejecting an out-of-range `priority_score` rather than
    /// clamping it). The store is responsible for assigning `id`,
    /// `created_at`, and `updated_at`.
    pub fn validated(self) -> Result<(String, Option<String>, TaskStatus, f64, Option<Value>, Option<Value>, Option<TaskId>), EngineError> {
        validate_title(&self.title)?;
        if let Some(ref d) = self.description {
            validate_description(d)?;
        }
        let score = self.priority_score.unwrap_or(DEFAULT_PRIORITY_SCORE);
        validate_priority_score(score)?;
        let status = self.status.unwrap_or(TaskStatus::Pending);
        Ok((
            self.title,
            self.description,
            status,
            score,
            self.prd,
            self.context_digest,
            self.parent_id,
        ))
    }
}
