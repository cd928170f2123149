//! Domain logic shared by every [`StorageBackend`]: row schema, cascade
//! delete, monotonic timestamps, the tree-wide version counter, and the
//! transactional entry point the [`crate::reconcile::Reconciler`] runs
//! inside.
//!
//! Implemented once, generically over `B: StorageBackend` -- exactly the
//! split the rest of this crate's store layer follows (a dumb KV backend
//! underneath a single domain-aware layer on top).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::EngineError;
use crate::store::backend::{
    context_key, dependency_key, deps_prefix, task_key, tasks_prefix, StorageBackend,
    StorageError, KEY_TREE_VERSION,
};
use crate::types::{
    validate_description, validate_priority_score, validate_title, Dependency, NewTask, Task,
    TaskId, TaskStatus, TaskUpdate,
};

use super::TaskFilter;

/// Earliest timestamp considered plausible (§6: "before the year 2020").
fn earliest_sane_timestamp() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
}

/// A clock that hands out strictly increasing timestamps even when called
/// faster than the system clock's resolution, so `updated_at` is always
/// non-decreasing per task and strictly later across successive commits
/// (§5 ordering guarantees).
#[derive(Debug, Default)]
struct MonotonicClock {
    last_nanos: AtomicI64,
}

impl MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut prev = self.last_nanos.load(Ordering::SeqCst);
        loop {
            let candidate = wall.max(prev + 1);
            match self.last_nanos.compare_exchange_weak(
                prev,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Utc.timestamp_nanos(candidate);
                }
                Err(actual) => prev = actual,
            }
        }
    }
}

/// The canonical on-disk row for a task (§6 `tasks` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskRow {
    id: TaskId,
    parent_id: Option<TaskId>,
    title: String,
    description: Option<String>,
    status: TaskStatus,
    priority_score: f64,
    prd: Option<Value>,
    context_digest: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<Task> for TaskRow {
    fn from(t: Task) -> Self {
        Self {
            id: t.id,
            parent_id: t.parent_id,
            title: t.title,
            description: t.description,
            status: t.status,
            priority_score: t.priority_score,
            prd: t.prd,
            context_digest: t.context_digest,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

impl From<TaskRow> for Task {
    fn from(r: TaskRow) -> Self {
        Self {
            id: r.id,
            parent_id: r.parent_id,
            title: r.title,
            description: r.description,
            status: r.status,
            priority_score: r.priority_score,
            prd: r.prd,
            context_digest: r.context_digest,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// The canonical on-disk row for a dependency edge (§6 `task_dependencies`
/// table).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DependencyRow {
    dependent_id: TaskId,
    dependency_id: TaskId,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

/// Domain-aware store layered over any [`StorageBackend`].
///
/// Owns no state of its own beyond the backend handle and an in-process
/// transaction mutex (serializing concurrent callers *within* one
/// process -- the cooperative file lock in [`crate::lock`] serializes
/// writers *across* processes; both apply together, per §5).
#[derive(Debug)]
pub struct GenericStore<B: StorageBackend> {
    backend: B,
    clock: MonotonicClock,
    txn_lock: AsyncMutex<()>,
}

impl<B: StorageBackend> GenericStore<B> {
    /// Wraps a backend in the domain logic layer.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            clock: MonotonicClock::default(),
            txn_lock: AsyncMutex::new(()),
        }
    }

    /// Borrows the underlying backend (test/inspection use).
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn serialize_row(row: &TaskRow) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(row).map_err(|e| EngineError::Corrupt {
            what: format!("failed to serialize task row: {e}"),
        })
    }

    fn deserialize_row(bytes: &[u8]) -> Result<TaskRow, EngineError> {
        serde_json::from_slice(bytes).map_err(|e| EngineError::Corrupt {
            what: format!("failed to deserialize task row: {e}"),
        })
    }

    async fn load_task_row(&self, id: &TaskId) -> Result<(TaskRow, u64), EngineError> {
        match self.backend.get(&task_key(id.as_str())).await {
            Ok(record) => Ok((Self::deserialize_row(&record.data)?, record.version)),
            Err(StorageError::NotFound { .. }) => Err(EngineError::NotFound { id: id.clone() }),
            Err(e) => Err(Self::map_backend_err(e)),
        }
    }

    fn map_backend_err(err: StorageError) -> EngineError {
        match err {
            StorageError::NotFound { key } => EngineError::Corrupt {
                what: format!("expected row missing: {key}"),
            },
            other => EngineError::Fatal(crate::error::StoreIoError::Io(other.to_string())),
        }
    }

    /// Validates a [`NewTask`] and assigns it a fresh id + timestamps,
    /// without yet touching the backend.
    fn materialize_new(&self, id: TaskId, data: NewTask) -> Result<Task, EngineError> {
        validate_title(&data.title)?;
        if let Some(ref d) = data.description {
            validate_description(d)?;
        }
        let score = data
            .priority_score
            .unwrap_or(crate::types::DEFAULT_PRIORITY_SCORE);
        validate_priority_score(score)?;
        let now = self.clock.now();
        Ok(Task {
            id,
            parent_id: data.parent_id,
            title: data.title,
            description: data.description,
            status: data.status.unwrap_or(TaskStatus::Pending),
            priority_score: score,
            prd: data.prd,
            context_digest: data.context_digest,
            created_at: now,
            updated_at: now,
        })
    }

    async fn put_task_row(&self, row: &TaskRow) -> Result<(), EngineError> {
        self.backend
            .put(&task_key(row.id.as_str()), &Self::serialize_row(row)?)
            .await
            .map_err(Self::map_backend_err)?;
        Ok(())
    }

    async fn bump_tree_version(&self) -> Result<u64, EngineError> {
        loop {
            match self.backend.get(KEY_TREE_VERSION).await {
                Ok(record) => {
                    let current: u64 = std::str::from_utf8(&record.data)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    let next = current + 1;
                    match self
                        .backend
                        .put_if_version(
                            KEY_TREE_VERSION,
                            next.to_string().as_bytes(),
                            record.version,
                        )
                        .await
                    {
                        Ok(_) => return Ok(next),
                        Err(StorageError::VersionConflict { .. }) => continue,
                        Err(e) => return Err(Self::map_backend_err(e)),
                    }
                }
                Err(StorageError::NotFound { .. }) => match self.backend.put(KEY_TREE_VERSION, b"1").await {
                    Ok(_) => return Ok(1),
                    Err(e) => return Err(Self::map_backend_err(e)),
                },
                Err(e) => return Err(Self::map_backend_err(e)),
            }
        }
    }

    // ---- Store operation table (§4.2) ----

    /// See [`crate::store::Store::get_task`].
    pub async fn get_task(&self, id: &TaskId) -> Result<Task, EngineError> {
        let (row, _version) = self.load_task_row(id).await?;
        Ok(row.into())
    }

    /// See [`crate::store::Store::list_tasks`].
    pub async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, EngineError> {
        let rows = self
            .backend
            .list_by_prefix(&tasks_prefix())
            .await
            .map_err(Self::map_backend_err)?;
        let mut out = Vec::with_capacity(rows.len());
        for (_key, record) in rows {
            let task: Task = Self::deserialize_row(&record.data)?.into();
            if filter.matches(&task) {
                out.push(task);
            }
        }
        Ok(out)
    }

    /// See [`crate::store::Store::list_subtasks`].
    pub async fn list_subtasks(&self, parent_id: &TaskId) -> Result<Vec<Task>, EngineError> {
        self.list_tasks(TaskFilter {
            parent_id: Some(Some(parent_id.clone())),
            ..Default::default()
        })
        .await
    }

    /// See [`crate::store::Store::add_task`].
    pub async fn add_task(&self, data: NewTask) -> Result<Task, EngineError> {
        let id = TaskId::new_persistent();
        self.add_task_with_id(id, data).await
    }

    /// See [`crate::store::Store::add_task_with_id`].
    pub async fn add_task_with_id(&self, id: TaskId, data: NewTask) -> Result<Task, EngineError> {
        let task = self.materialize_new(id, data)?;
        self.put_task_row(&task.clone().into()).await?;
        self.bump_tree_version().await?;
        Ok(task)
    }

    /// See [`crate::store::Store::update_task`].
    pub async fn update_task(&self, id: &TaskId, update: TaskUpdate) -> Result<Task, EngineError> {
        let (mut row, version) = self.load_task_row(id).await?;
        if let Some(ref title) = update.title {
            validate_title(title)?;
            row.title = title.clone();
        }
        if let Some(description) = update.description {
            if let Some(ref d) = description {
                validate_description(d)?;
            }
            row.description = description;
        }
        if let Some(parent_id) = update.parent_id {
            row.parent_id = parent_id;
        }
        if let Some(status) = update.status {
            row.status = status;
        }
        if let Some(score) = update.priority_score {
            validate_priority_score(score)?;
            row.priority_score = score;
        }
        if let Some(prd) = update.prd {
            row.prd = prd;
        }
        if let Some(context_digest) = update.context_digest {
            row.context_digest = context_digest;
        }
        row.updated_at = self.clock.now();
        let bytes = Self::serialize_row(&row)?;
        self.backend
            .put_if_version(&task_key(id.as_str()), &bytes, version)
            .await
            .map_err(|e| match e {
                StorageError::VersionConflict { .. } => EngineError::Conflict {
                    expected: version,
                    actual: version + 1,
                },
                other => Self::map_backend_err(other),
            })?;
        self.bump_tree_version().await?;
        Ok(row.into())
    }

    /// See [`crate::store::Store::delete_task`].
    pub async fn delete_task(&self, id: &TaskId) -> Result<bool, EngineError> {
        let existed = self
            .backend
            .delete(&task_key(id.as_str()))
            .await
            .map_err(Self::map_backend_err)?;
        if !existed {
            return Ok(false);
        }
        for dependent in self.list_dependents(id).await? {
            self.remove_dependency(&dependent, id).await?;
        }
        for dependency in self.list_dependencies(id).await? {
            self.remove_dependency(id, &dependency).await?;
        }
        self.backend
            .delete(&context_key(id.as_str()))
            .await
            .map_err(Self::map_backend_err)?;
        self.bump_tree_version().await?;
        Ok(true)
    }

    /// See [`crate::store::Store::add_dependency`].
    pub async fn add_dependency(
        &self,
        dependent_id: TaskId,
        dependency_id: TaskId,
    ) -> Result<Dependency, EngineError> {
        let edge = Dependency::new(dependent_id.clone(), dependency_id.clone()).map_err(|e| {
            EngineError::GraphInvariant {
                reason: e.to_string(),
            }
        })?;
        // Existence check -- both endpoints must already be persisted.
        self.get_task(&dependent_id).await?;
        self.get_task(&dependency_id).await?;
        let key = dependency_key(dependent_id.as_str(), dependency_id.as_str());
        if self.backend.get(&key).await.is_ok() {
            return Err(EngineError::GraphInvariant {
                reason: format!("duplicate edge {dependent_id} -> {dependency_id}"),
            });
        }
        let row = DependencyRow {
            dependent_id,
            dependency_id,
            created_at: self.clock.now(),
        };
        let bytes = serde_json::to_vec(&row).map_err(|e| EngineError::Corrupt {
            what: e.to_string(),
        })?;
        self.backend
            .put(&key, &bytes)
            .await
            .map_err(Self::map_backend_err)?;
        self.bump_tree_version().await?;
        Ok(edge)
    }

    /// See [`crate::store::Store::remove_dependency`].
    pub async fn remove_dependency(
        &self,
        dependent_id: &TaskId,
        dependency_id: &TaskId,
    ) -> Result<bool, EngineError> {
        let key = dependency_key(dependent_id.as_str(), dependency_id.as_str());
        let removed = self
            .backend
            .delete(&key)
            .await
            .map_err(Self::map_backend_err)?;
        if removed {
            self.bump_tree_version().await?;
        }
        Ok(removed)
    }

    /// See [`crate::store::Store::list_dependencies`].
    pub async fn list_dependencies(&self, id: &TaskId) -> Result<Vec<TaskId>, EngineError> {
        let rows = self
            .backend
            .list_by_prefix(&deps_prefix())
            .await
            .map_err(Self::map_backend_err)?;
        let mut out = Vec::new();
        for (_key, record) in rows {
            let row: DependencyRow =
                serde_json::from_slice(&record.data).map_err(|e| EngineError::Corrupt {
                    what: e.to_string(),
                })?;
            if &row.dependent_id == id {
                out.push(row.dependency_id);
            }
        }
        Ok(out)
    }

    /// See [`crate::store::Store::list_dependents`].
    pub async fn list_dependents(&self, id: &TaskId) -> Result<Vec<TaskId>, EngineError> {
        let rows = self
            .backend
            .list_by_prefix(&deps_prefix())
            .await
            .map_err(Self::map_backend_err)?;
        let mut out = Vec::new();
        for (_key, record) in rows {
            let row: DependencyRow =
                serde_json::from_slice(&record.data).map_err(|e| EngineError::Corrupt {
                    what: e.to_string(),
                })?;
            if &row.dependency_id == id {
                out.push(row.dependent_id);
            }
        }
        Ok(out)
    }

    /// See [`crate::store::Store::tree_version`].
    pub async fn tree_version(&self) -> Result<u64, EngineError> {
        match self.backend.get(KEY_TREE_VERSION).await {
            Ok(record) => Ok(std::str::from_utf8(&record.data)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)),
            Err(StorageError::NotFound { .. }) => Ok(0),
            Err(e) => Err(Self::map_backend_err(e)),
        }
    }

    /// See [`crate::store::Store::repair_timestamps`].
    pub async fn repair_timestamps(&self) -> Result<usize, EngineError> {
        let rows = self
            .backend
            .list_by_prefix(&tasks_prefix())
            .await
            .map_err(Self::map_backend_err)?;
        let earliest = earliest_sane_timestamp();
        let tomorrow = Utc::now() + chrono::Duration::days(1);
        let mut repaired = 0usize;
        for (key, record) in rows {
            let mut row = Self::deserialize_row(&record.data)?;
            let mut dirty = false;
            if row.created_at < earliest || row.created_at > tomorrow {
                row.created_at = self.clock.now();
                dirty = true;
            }
            if row.updated_at < earliest || row.updated_at > tomorrow {
                row.updated_at = self.clock.now();
                dirty = true;
            }
            if dirty {
                let bytes = Self::serialize_row(&row)?;
                self.backend
                    .put(&key, &bytes)
                    .await
                    .map_err(Self::map_backend_err)?;
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    // ---- Transactional entry point for the reconciler (§4.6) ----

    /// Runs `f` against an in-memory snapshot of the whole task/dependency
    /// set, inside the process-local transaction mutex, committing every
    /// change back to the backend only if `f` returns `Ok` and never
    /// called [`Tx::rollback`]. On any failure nothing reaches the
    /// backend.
    ///
    /// Per §9 ("cooperative lock + transaction order"), this method
    /// assumes the caller already holds the cross-process
    /// [`crate::lock::FileLock`] for writing -- it only serializes callers
    /// *within* this process.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut Tx) -> Result<T, EngineError>,
    {
        let _guard = self.txn_lock.lock().await;
        self.transaction_locked(f).await
    }

    /// Like [`Self::transaction`], but first re-checks `expected_version`
    /// against the live tree version while still holding `txn_lock`, so
    /// the optimistic-concurrency check and the commit are atomic with
    /// respect to other callers racing for the same lock. Used by the
    /// reconciler (§4.6), whose plain read-then-act version check would
    /// otherwise leave a window between reading `tree_version()` and
    /// acquiring the lock in which a concurrent caller could commit first.
    ///
    /// # Errors
    ///
    /// [`EngineError::Conflict`] if the live version no longer matches
    /// `expected_version` once the lock is held.
    pub async fn transaction_with_expected_version<F, T>(
        &self,
        expected_version: u64,
        f: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce(&mut Tx) -> Result<T, EngineError>,
    {
        let _guard = self.txn_lock.lock().await;
        let actual_version = self.tree_version().await?;
        if actual_version != expected_version {
            return Err(EngineError::Conflict {
                expected: expected_version,
                actual: actual_version,
            });
        }
        self.transaction_locked(f).await
    }

    /// Shared body of [`Self::transaction`]/
    /// [`Self::transaction_with_expected_version`]: both already hold
    /// `txn_lock` by the time this runs.
    async fn transaction_locked<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut Tx) -> Result<T, EngineError>,
    {
        let task_rows = self
            .backend
            .list_by_prefix(&tasks_prefix())
            .await
            .map_err(Self::map_backend_err)?;
        let mut tasks = HashMap::new();
        for (_key, record) in task_rows {
            let task: Task = Self::deserialize_row(&record.data)?.into();
            tasks.insert(task.id.clone(), task);
        }
        let dep_rows = self
            .backend
            .list_by_prefix(&deps_prefix())
            .await
            .map_err(Self::map_backend_err)?;
        let mut deps = HashSet::new();
        for (_key, record) in dep_rows {
            let row: DependencyRow =
                serde_json::from_slice(&record.data).map_err(|e| EngineError::Corrupt {
                    what: e.to_string(),
                })?;
            deps.insert(Dependency {
                dependent_id: row.dependent_id,
                dependency_id: row.dependency_id,
            });
        }
        let before_tasks = tasks.clone();
        let before_deps = deps.clone();

        let mut tx = Tx {
            tasks,
            deps,
            deleted: HashSet::new(),
            clock: &self.clock,
            rolled_back: None,
        };

        let result = f(&mut tx);

        if let Some(reason) = tx.rolled_back.take() {
            return Err(EngineError::RolledBack { reason });
        }
        let result = result?;

        // Commit the diff: rows present before but gone (or explicitly
        // deleted) after are removed; everything else is upserted if
        // changed.
        for id in before_tasks.keys() {
            if !tx.tasks.contains_key(id) || tx.deleted.contains(id) {
                self.backend
                    .delete(&task_key(id.as_str()))
                    .await
                    .map_err(Self::map_backend_err)?;
                self.backend
                    .delete(&context_key(id.as_str()))
                    .await
                    .map_err(Self::map_backend_err)?;
            }
        }
        for (id, task) in tx.tasks.iter() {
            if tx.deleted.contains(id) {
                continue;
            }
            if before_tasks.get(id) != Some(task) {
                let row: TaskRow = task.clone().into();
                self.put_task_row(&row).await?;
            }
        }
        for removed in before_deps.difference(&tx.deps) {
            self.backend
                .delete(&dependency_key(
                    removed.dependent_id.as_str(),
                    removed.dependency_id.as_str(),
                ))
                .await
                .map_err(Self::map_backend_err)?;
        }
        for added in tx.deps.difference(&before_deps) {
            let row = DependencyRow {
                dependent_id: added.dependent_id.clone(),
                dependency_id: added.dependency_id.clone(),
                created_at: self.clock.now(),
            };
            let bytes = serde_json::to_vec(&row).map_err(|e| EngineError::Corrupt {
                what: e.to_string(),
            })?;
            self.backend
                .put(
                    &dependency_key(added.dependent_id.as_str(), added.dependency_id.as_str()),
                    &bytes,
                )
                .await
                .map_err(Self::map_backend_err)?;
        }
        if before_tasks != tx.tasks || before_deps != tx.deps {
            self.bump_tree_version().await?;
        }
        Ok(result)
    }
}

/// The mutable working set a transaction closure operates against: an
/// in-memory snapshot of every task and dependency edge, mutated in place
/// and diffed against the pre-transaction snapshot on commit.
///
/// Pure and synchronous -- no I/O happens while a `Tx` is in scope.
pub struct Tx<'a> {
    tasks: HashMap<TaskId, Task>,
    deps: HashSet<Dependency>,
    deleted: HashSet<TaskId>,
    clock: &'a MonotonicClock,
    rolled_back: Option<String>,
}

impl<'a> Tx<'a> {
    /// Looks up a task by id within the transaction's working set.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Every task currently in the working set (post any prior mutations
    /// in this transaction).
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Creates a task with an explicit id (used when the id was already
    /// minted earlier in the same plan, e.g. a `child_add` whose id was
    /// recorded in the id map before its own row was written).
    pub fn add_task_with_id(&mut self, id: TaskId, data: NewTask) -> Result<Task, EngineError> {
        validate_title(&data.title)?;
        if let Some(ref d) = data.description {
            validate_description(d)?;
        }
        let score = data
            .priority_score
            .unwrap_or(crate::types::DEFAULT_PRIORITY_SCORE);
        validate_priority_score(score)?;
        let now = self.clock.now();
        let task = Task {
            id: id.clone(),
            parent_id: data.parent_id,
            title: data.title,
            description: data.description,
            status: data.status.unwrap_or(TaskStatus::Pending),
            priority_score: score,
            prd: data.prd,
            context_digest: data.context_digest,
            created_at: now,
            updated_at: now,
        };
        self.tasks.insert(id, task.clone());
        Ok(task)
    }

    /// Mints a fresh persistent id and creates the task under it.
    pub fn add_task(&mut self, data: NewTask) -> Result<Task, EngineError> {
        self.add_task_with_id(TaskId::new_persistent(), data)
    }

    /// Applies a partial update to an existing task in the working set.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if `id` is not present.
    pub fn update_task(&mut self, id: &TaskId, update: TaskUpdate) -> Result<Task, EngineError> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound { id: id.clone() })?;
        if let Some(ref title) = update.title {
            validate_title(title)?;
            task.title = title.clone();
        }
        if let Some(description) = update.description {
            if let Some(ref d) = description {
                validate_description(d)?;
            }
            task.description = description;
        }
        if let Some(parent_id) = update.parent_id {
            task.parent_id = parent_id;
        }
        if let Some(status) = update.status {
            task.status = status;
        }
        if let Some(score) = update.priority_score {
            validate_priority_score(score)?;
            task.priority_score = score;
        }
        if let Some(prd) = update.prd {
            task.prd = prd;
        }
        if let Some(context_digest) = update.context_digest {
            task.context_digest = context_digest;
        }
        task.updated_at = self.clock.now();
        Ok(task.clone())
    }

    /// Marks a single task row for deletion and removes every dependency
    /// edge incident on it. Does not recurse into children -- the
    /// reconciler walks the subtree leaves-first and calls this once per
    /// node (§4.6 step 2, `child_remove`).
    pub fn delete_task(&mut self, id: &TaskId) -> bool {
        let existed = self.tasks.remove(id).is_some();
        if existed {
            self.deleted.insert(id.clone());
            self.deps
                .retain(|d| &d.dependent_id != id && &d.dependency_id != id);
        }
        existed
    }

    /// Adds a dependency edge to the working set. Validates only row-level
    /// invariants (existence, no self-loop, no duplicate); cycle checking
    /// is the reconciler's job, run against a [`crate::graph::DependencyGraph`]
    /// built from [`Tx::dependency_snapshot`].
    pub fn add_dependency(
        &mut self,
        dependent_id: TaskId,
        dependency_id: TaskId,
    ) -> Result<Dependency, EngineError> {
        let edge = Dependency::new(dependent_id.clone(), dependency_id.clone()).map_err(|e| {
            EngineError::GraphInvariant {
                reason: e.to_string(),
            }
        })?;
        if !self.tasks.contains_key(&dependent_id) {
            return Err(EngineError::GraphInvariant {
                reason: format!("unknown endpoint {dependent_id}"),
            });
        }
        if !self.tasks.contains_key(&dependency_id) {
            return Err(EngineError::GraphInvariant {
                reason: format!("unknown endpoint {dependency_id}"),
            });
        }
        if !self.deps.insert(edge.clone()) {
            return Err(EngineError::GraphInvariant {
                reason: format!("duplicate edge {dependent_id} -> {dependency_id}"),
            });
        }
        Ok(edge)
    }

    /// Removes a dependency edge from the working set, returning `true`
    /// iff it was present.
    pub fn remove_dependency(&mut self, dependent_id: &TaskId, dependency_id: &TaskId) -> bool {
        self.deps.remove(&Dependency {
            dependent_id: dependent_id.clone(),
            dependency_id: dependency_id.clone(),
        })
    }

    /// A read-only snapshot of the current edge set, suitable for building
    /// a [`crate::graph::DependencyGraph`] mid-transaction.
    pub fn dependency_snapshot(&self) -> Vec<Dependency> {
        self.deps.iter().cloned().collect()
    }

    /// Aborts the transaction: no change made in this closure reaches the
    /// backend, and the caller receives [`EngineError::RolledBack`].
    pub fn rollback(&mut self, reason: impl Into<String>) {
        self.rolled_back = Some(reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryBackend;

    fn new_task(title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn add_and_get_round_trips() {
        let store = GenericStore::new(InMemoryBackend::new());
        let task = store.add_task(new_task("first")).await.unwrap();
        let fetched = store.get_task(&task.id).await.unwrap();
        assert_eq!(fetched.title, "first");
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn update_bumps_updated_at_and_leaves_created_at() {
        let store = GenericStore::new(InMemoryBackend::new());
        let task = store.add_task(new_task("t")).await.unwrap();
        let updated = store
            .update_task(
                &task.id,
                TaskUpdate {
                    title: Some("t2".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "t2");
        assert_eq!(updated.created_at, task.created_at);
        assert!(updated.updated_at >= task.updated_at);
    }

    #[tokio::test]
    async fn update_missing_task_is_not_found() {
        let store = GenericStore::new(InMemoryBackend::new());
        let err = store
            .update_task(&TaskId::new_persistent(), TaskUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_cascades_incident_dependency_edges() {
        let store = GenericStore::new(InMemoryBackend::new());
        let a = store.add_task(new_task("a")).await.unwrap();
        let b = store.add_task(new_task("b")).await.unwrap();
        store
            .add_dependency(a.id.clone(), b.id.clone())
            .await
            .unwrap();
        store.delete_task(&b.id).await.unwrap();
        assert!(store.list_dependencies(&a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_dependency_rejects_unknown_endpoint() {
        let store = GenericStore::new(InMemoryBackend::new());
        let a = store.add_task(new_task("a")).await.unwrap();
        let err = store
            .add_dependency(a.id.clone(), TaskId::new_persistent())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn add_dependency_rejects_duplicate() {
        let store = GenericStore::new(InMemoryBackend::new());
        let a = store.add_task(new_task("a")).await.unwrap();
        let b = store.add_task(new_task("b")).await.unwrap();
        store
            .add_dependency(a.id.clone(), b.id.clone())
            .await
            .unwrap();
        let err = store
            .add_dependency(a.id.clone(), b.id.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::GraphInvariant { .. }));
    }

    #[tokio::test]
    async fn remove_dependency_then_add_leaves_set_unchanged() {
        let store = GenericStore::new(InMemoryBackend::new());
        let a = store.add_task(new_task("a")).await.unwrap();
        let b = store.add_task(new_task("b")).await.unwrap();
        store
            .add_dependency(a.id.clone(), b.id.clone())
            .await
            .unwrap();
        assert!(store.remove_dependency(&a.id, &b.id).await.unwrap());
        assert!(store.list_dependencies(&a.id).await.unwrap().is_empty());
        store
            .add_dependency(a.id.clone(), b.id.clone())
            .await
            .unwrap();
        assert_eq!(store.list_dependencies(&a.id).await.unwrap(), vec![b.id]);
    }

    #[tokio::test]
    async fn transaction_rollback_leaves_store_untouched() {
        let store = GenericStore::new(InMemoryBackend::new());
        let before = store.tree_version().await.unwrap();
        let result: Result<(), EngineError> = store
            .transaction(|tx| {
                tx.add_task(new_task("ghost")).unwrap();
                tx.rollback("changed my mind");
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(EngineError::RolledBack { .. })));
        assert!(store
            .list_tasks(TaskFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.tree_version().await.unwrap(), before);
    }

    #[tokio::test]
    async fn transaction_commits_all_mutations_atomically() {
        let store = GenericStore::new(InMemoryBackend::new());
        let (parent_id, child_id) = store
            .transaction(|tx| {
                let parent = tx.add_task(new_task("parent"))?;
                let mut child_data = new_task("child");
                child_data.parent_id = Some(parent.id.clone());
                let child = tx.add_task(child_data)?;
                tx.add_dependency(child.id.clone(), parent.id.clone())?;
                Ok((parent.id, child.id))
            })
            .await
            .unwrap();
        let child = store.get_task(&child_id).await.unwrap();
        assert_eq!(child.parent_id, Some(parent_id.clone()));
        assert_eq!(
            store.list_dependencies(&child_id).await.unwrap(),
            vec![parent_id]
        );
    }

    #[tokio::test]
    async fn repair_timestamps_fixes_pre_2020_dates() {
        let store = GenericStore::new(InMemoryBackend::new());
        let task = store.add_task(new_task("old")).await.unwrap();
        let mut row: TaskRow = {
            let record = store
                .backend()
                .get(&task_key(task.id.as_str()))
                .await
                .unwrap();
            GenericStore::<InMemoryBackend>::deserialize_row(&record.data).unwrap()
        };
        row.created_at = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        row.updated_at = row.created_at;
        let bytes = GenericStore::<InMemoryBackend>::serialize_row(&row).unwrap();
        store
            .backend()
            .put(&task_key(task.id.as_str()), &bytes)
            .await
            .unwrap();
        let repaired = store.repair_timestamps().await.unwrap();
        assert_eq!(repaired, 1);
        let fixed = store.get_task(&task.id).await.unwrap();
        assert!(fixed.created_at > earliest_sane_timestamp());
    }
}
