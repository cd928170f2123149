//! Error taxonomy.
//!
//! Mirrors the split between a domain-facing error ([`EngineError`]) and a
//! storage-facing error ([`StoreIoError`]): callers of
//! [`crate::service::TaskService`] only ever see [`EngineError`], while
//! [`crate::store::StorageBackend`] implementors report in terms of
//! [`StoreIoError`], which the generic store layer translates.

use crate::types::id::TaskId;
use crate::types::status::TaskStatus;

/// Errors surfaced by the public API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No task exists with the given id.
    #[error("task {id} not found")]
    NotFound {
        /// The id that was looked up.
        id: TaskId,
    },

    /// A requested status transition is not legal from the task's current
    /// status.
    #[error("cannot transition {from} -> {to}: {reason}")]
    IllegalTransition {
        /// Status the task was in.
        from: TaskStatus,
        /// Status that was requested.
        to: TaskStatus,
        /// Human-readable explanation, specific to the rejected edge.
        reason: String,
    },

    /// A task cannot move to `in-progress` because one or more of its
    /// dependencies is not yet `done`.
    #[error("task {id} is blocked by incomplete dependencies: {blockers:?}")]
    Blocked {
        /// The task that was denied the transition.
        id: TaskId,
        /// The incomplete dependencies causing the block.
        blockers: Vec<TaskId>,
    },

    /// A requested mutation would violate a structural invariant of the
    /// dependency graph or task tree.
    #[error("graph invariant violated: {reason}")]
    GraphInvariant {
        /// Description of the violated invariant (self-dependency, a cycle,
        /// an edge naming an unknown task, or a tree edge that would orphan
        /// or re-parent a subtree into itself).
        reason: String,
    },

    /// An optimistic write lost a race: the record's version at commit time
    /// no longer matched the version the caller last read.
    #[error("conflict: expected version {expected}, store is at {actual}")]
    Conflict {
        /// Version the caller believed it was updating.
        expected: u64,
        /// Version actually present in the store.
        actual: u64,
    },

    /// The cooperative file lock is held by another process and could not
    /// be acquired within the configured retry budget.
    #[error("Database is currently in use by {holder}")]
    LockBusy {
        /// Description of the lock holder, e.g. `pid 4821`.
        holder: String,
    },

    /// Stored data failed validation on read, or a caller-supplied value
    /// failed validation on write.
    #[error("corrupt or invalid data: {what}")]
    Corrupt {
        /// What was found to be invalid.
        what: String,
    },

    /// An underlying storage operation failed in a way the domain layer
    /// cannot interpret or recover from. Not locally recoverable; the
    /// caller should surface this and abort the enclosing operation.
    #[error("fatal store error: {0}")]
    Fatal(#[from] StoreIoError),

    /// A reconciliation plan was explicitly rolled back by the closure
    /// that built it (e.g. a mid-transaction validation failure the
    /// closure detected itself).
    #[error("transaction rolled back: {reason}")]
    RolledBack {
        /// Why the closure rolled back.
        reason: String,
    },
}

impl EngineError {
    /// A short, stable machine-readable code for this error variant, for
    /// callers that want to branch on error kind without matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::Blocked { .. } => "blocked",
            Self::GraphInvariant { .. } => "graph_invariant",
            Self::Conflict { .. } => "conflict",
            Self::LockBusy { .. } => "lock_busy",
            Self::Corrupt { .. } => "corrupt",
            Self::Fatal(_) => "fatal",
            Self::RolledBack { .. } => "rolled_back",
        }
    }
}

/// Errors reported by a [`crate::store::StorageBackend`] implementation.
///
/// This is the narrow contract a backend author has to satisfy; the
/// generic store layer is responsible for turning these into the richer
/// [`EngineError`] variants the rest of the crate deals in.
#[derive(Debug, thiserror::Error)]
pub enum StoreIoError {
    /// The key was not present.
    #[error("key not found: {0}")]
    NotFound(String),

    /// A `put_if_version` compare-and-swap failed because the stored
    /// version had already moved on.
    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        /// The key being written.
        key: String,
        /// Version the caller expected.
        expected: u64,
        /// Version actually stored.
        actual: u64,
    },

    /// The backend's underlying medium (filesystem, lock file, serialized
    /// record) could not be read or written.
    #[error("backend I/O failure: {0}")]
    Io(String),

    /// A stored value could not be deserialized into the expected shape.
    #[error("deserialization failure: {0}")]
    Deserialize(String),
}
