//! Persistent store contract (C2).
//!
//! # Architecture
//!
//! The storage system has three layers, mirroring the split the rest of
//! this crate's teacher lineage uses:
//!
//! 1. **[`Store`]** -- the dyn-safe, domain-shaped CRUD surface
//!    ([`crate::service::TaskService`] and adapters code against this).
//! 2. **[`generic::GenericStore<B>`]** -- all domain logic (validation,
//!    cascade-delete of incident dependency edges, monotonic `updated_at`,
//!    the tree-wide version counter, and the transactional `transaction`
//!    entry point the [`crate::reconcile::Reconciler`] runs inside). Has a
//!    blanket [`Store`] impl for any `B: `[`StorageBackend`].
//! 3. **[`StorageBackend`]** -- a dumb `(key, bytes)` KV trait backends
//!    implement; no domain logic.
//!
//! To build a store: `GenericStore::new(InMemoryBackend::new())`, then
//! wrap in `Arc` for [`crate::service::TaskService::new`].

pub mod backend;
pub mod generic;
pub mod memory;

use async_trait::async_trait;

pub use backend::{StorageBackend, StorageError, VersionedRecord};

use crate::error::EngineError;
use crate::types::{Dependency, NewTask, Task, TaskId, TaskStatus, TaskUpdate};

/// Filter predicate for [`Store::list_tasks`]. All set fields are ANDed;
/// `None` means "don't filter on this field".
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Restrict to tasks with this status.
    pub status: Option<TaskStatus>,
    /// Restrict to tasks with this parent. `Some(None)` matches root tasks
    /// (no parent); `None` means "don't filter by parent".
    pub parent_id: Option<Option<TaskId>>,
    /// Restrict to exactly these ids, if given.
    pub ids: Option<Vec<TaskId>>,
}

impl TaskFilter {
    /// Returns `true` if `task` satisfies every set predicate.
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(ref parent) = self.parent_id {
            if &task.parent_id != parent {
                return false;
            }
        }
        if let Some(ref ids) = self.ids {
            if !ids.contains(&task.id) {
                return false;
            }
        }
        true
    }
}

/// Tuning knobs for the store's lock and commit behavior.
///
/// # Defaults
///
/// | Setting | Default | §  |
/// |---|---|---|
/// | `lock_acquire_budget` | 2s  | §5 "bounded total budget ~2s" |
/// | `stale_lock_threshold` | 30s | §4.2 "older than a configurable threshold (default ~30s)" |
/// | `lock_retry_initial_backoff` | 20ms | §4.2 "bounded retry with exponential-ish backoff" |
/// | `lock_retry_max_backoff` | 250ms | same |
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Total wall-clock budget for acquiring the cooperative file lock
    /// before surfacing [`EngineError::LockBusy`].
    pub lock_acquire_budget: std::time::Duration,
    /// A lock whose `acquired_at` is older than this is a candidate for
    /// stale reclamation (subject also to the PID-liveness probe).
    pub stale_lock_threshold: std::time::Duration,
    /// First retry delay when the lock is contended.
    pub lock_retry_initial_backoff: std::time::Duration,
    /// Retry delay ceiling; backoff never grows past this.
    pub lock_retry_max_backoff: std::time::Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_acquire_budget: std::time::Duration::from_secs(2),
            stale_lock_threshold: std::time::Duration::from_secs(30),
            lock_retry_initial_backoff: std::time::Duration::from_millis(20),
            lock_retry_max_backoff: std::time::Duration::from_millis(250),
        }
    }
}

/// The durable CRUD + query contract the core depends on (§4.2's
/// operation table). Dyn-safe: no generic methods, no transaction entry
/// point -- that lives on [`generic::GenericStore`] directly, since it is
/// necessarily generic over the closure it runs.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetches a task by id.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if no task exists with `id`.
    async fn get_task(&self, id: &TaskId) -> Result<Task, EngineError>;

    /// Lists tasks matching `filter`. Order is unspecified.
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, EngineError>;

    /// Lists the direct children of `parent_id` only.
    async fn list_subtasks(&self, parent_id: &TaskId) -> Result<Vec<Task>, EngineError>;

    /// Creates a task, minting a fresh persistent id and stamping
    /// `created_at`/`updated_at`.
    async fn add_task(&self, data: NewTask) -> Result<Task, EngineError>;

    /// Creates a task with an explicit persistent id (used inside
    /// reconciliation, where the id was already minted earlier in the
    /// same plan).
    async fn add_task_with_id(&self, id: TaskId, data: NewTask) -> Result<Task, EngineError>;

    /// Applies a partial update, bumping `updated_at`.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if `id` does not exist.
    async fn update_task(&self, id: &TaskId, update: TaskUpdate) -> Result<Task, EngineError>;

    /// Deletes a single task row and cascades: every dependency edge
    /// incident on `id` (as either endpoint) is also removed. Does not
    /// recurse into children -- callers needing subtree deletion compose
    /// this per descendant (see [`crate::service::TaskService::delete_subtree`]).
    ///
    /// Returns `true` iff a row existed to delete.
    async fn delete_task(&self, id: &TaskId) -> Result<bool, EngineError>;

    /// Adds a dependency edge. Does not check for cycles -- callers
    /// validate with [`crate::graph::DependencyGraph::would_create_cycle`]
    /// first; this method enforces only the row-level invariants (no
    /// self-loop, both endpoints exist, no duplicate).
    ///
    /// # Errors
    ///
    /// [`EngineError::GraphInvariant`] on a self-loop, an unknown
    /// endpoint, or a duplicate edge.
    async fn add_dependency(
        &self,
        dependent_id: TaskId,
        dependency_id: TaskId,
    ) -> Result<Dependency, EngineError>;

    /// Removes a dependency edge. Returns `true` iff a row existed to
    /// remove.
    async fn remove_dependency(
        &self,
        dependent_id: &TaskId,
        dependency_id: &TaskId,
    ) -> Result<bool, EngineError>;

    /// Ids this task depends on (forward edges).
    async fn list_dependencies(&self, id: &TaskId) -> Result<Vec<TaskId>, EngineError>;

    /// Ids that depend on this task (reverse edges).
    async fn list_dependents(&self, id: &TaskId) -> Result<Vec<TaskId>, EngineError>;

    /// The tree-wide version counter, bumped by every committed
    /// transaction. Used by the reconciler's optimistic-concurrency check
    /// (§4.6 step 1).
    async fn tree_version(&self) -> Result<u64, EngineError>;

    /// Repairs corrupt timestamps (§6): any `created_at`/`updated_at`
    /// before the year 2020 or more than one day in the future is reset
    /// to the current time. Returns the number of rows repaired.
    async fn repair_timestamps(&self) -> Result<usize, EngineError>;
}

#[async_trait]
impl<B: StorageBackend + 'static> Store for generic::GenericStore<B> {
    async fn get_task(&self, id: &TaskId) -> Result<Task, EngineError> {
        self.get_task(id).await
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, EngineError> {
        self.list_tasks(filter).await
    }

    async fn list_subtasks(&self, parent_id: &TaskId) -> Result<Vec<Task>, EngineError> {
        self.list_subtasks(parent_id).await
    }

    async fn add_task(&self, data: NewTask) -> Result<Task, EngineError> {
        self.add_task(data).await
    }

    async fn add_task_with_id(&self, id: TaskId, data: NewTask) -> Result<Task, EngineError> {
        self.add_task_with_id(id, data).await
    }

    async fn update_task(&self, id: &TaskId, update: TaskUpdate) -> Result<Task, EngineError> {
        self.update_task(id, update).await
    }

    async fn delete_task(&self, id: &TaskId) -> Result<bool, EngineError> {
        self.delete_task(id).await
    }

    async fn add_dependency(
        &self,
        dependent_id: TaskId,
        dependency_id: TaskId,
    ) -> Result<Dependency, EngineError> {
        self.add_dependency(dependent_id, dependency_id).await
    }

    async fn remove_dependency(
        &self,
        dependent_id: &TaskId,
        dependency_id: &TaskId,
    ) -> Result<bool, EngineError> {
        self.remove_dependency(dependent_id, dependency_id).await
    }

    async fn list_dependencies(&self, id: &TaskId) -> Result<Vec<TaskId>, EngineError> {
        self.list_dependencies(id).await
    }

    async fn list_dependents(&self, id: &TaskId) -> Result<Vec<TaskId>, EngineError> {
        self.list_dependents(id).await
    }

    async fn tree_version(&self) -> Result<u64, EngineError> {
        self.tree_version().await
    }

    async fn repair_timestamps(&self) -> Result<usize, EngineError> {
        self.repair_timestamps().await
    }
}
