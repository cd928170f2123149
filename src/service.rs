//! Task service (C7): the orchestration layer composing the store, the
//! dependency graph, the task tree, and the reconciler into the
//! operations a caller actually invokes.
//!
//! Generic over [`StorageBackend`] rather than boxed behind
//! [`crate::store::Store`], because [`reconcile::apply`] needs the
//! concrete [`GenericStore<B>`] for its `transaction` entry point --
//! `TaskService<B>` is the thing a binary constructs once, parameterized
//! by its chosen backend, mirroring how the teacher's in-memory store
//! was itself the concrete type handlers were built against.
//!
//! Every mutating method acquires the cooperative file lock (if one was
//! configured via [`TaskService::with_file_lock`]) before touching the
//! store and releases it before returning, retrying lock acquisition up
//! to [`crate::config::EngineConfig::lock_retry_budget`] times on
//! [`EngineError::LockBusy`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::graph::DependencyGraph;
use crate::lock::{FileLock, LockHolder, ProcessKind};
use crate::reconcile::{self, ReconcileOutcome};
use crate::store::generic::GenericStore;
use crate::store::{StorageBackend, TaskFilter};
use crate::tracking::{DependencyOp, ReconciliationPlan};
use crate::tree::TaskTree;
use crate::types::{Dependency, Priority, Task, TaskId, TaskStatus, TaskUpdate};

/// Filter predicate for [`TaskService::get_available_tasks`]. All set
/// fields are ANDed on top of the fixed "not blocked and still pending"
/// rule (§4.7).
#[derive(Debug, Clone, Default)]
pub struct AvailableFilter {
    /// Restrict to tasks under this parent. `Some(None)` matches root
    /// tasks; `None` means "any parent".
    pub parent_id: Option<Option<TaskId>>,
    /// Restrict to this priority bucket.
    pub priority_band: Option<Priority>,
}

/// The result of validating a would-be dependency edge without applying
/// it (§4.3).
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// `true` iff `errors` is empty.
    pub valid: bool,
    /// Reasons the edge would be rejected.
    pub errors: Vec<String>,
    /// Non-fatal observations (currently unused, reserved for callers
    /// that want to surface soft warnings alongside hard errors).
    pub warnings: Vec<String>,
    /// Witness cycles the edge would close, each a sequence of ids
    /// starting and ending at the same task.
    pub cycles: Vec<Vec<TaskId>>,
}

/// The orchestration layer: one instance per open store, shared behind
/// an `Arc` by every caller in a process.
pub struct TaskService<B: StorageBackend> {
    store: Arc<GenericStore<B>>,
    lock: Option<Arc<FileLock>>,
    config: EngineConfig,
}

impl<B: StorageBackend + 'static> TaskService<B> {
    /// Builds a service over `store` with `config`. No file lock is
    /// attached by default -- use [`TaskService::with_file_lock`] for
    /// multi-process deployments.
    pub fn new(store: Arc<GenericStore<B>>, config: EngineConfig) -> Self {
        Self {
            store,
            lock: None,
            config,
        }
    }

    /// Attaches a cooperative file lock rooted at `db_path`, so every
    /// mutating method serializes against other processes sharing the
    /// same path.
    #[must_use]
    pub fn with_file_lock(mut self, db_path: impl AsRef<std::path::Path>, kind: ProcessKind) -> Self {
        self.lock = Some(Arc::new(FileLock::new(db_path, kind)));
        self
    }

    async fn acquire_lock(&self) -> Result<(), EngineError> {
        let Some(lock) = &self.lock else {
            return Ok(());
        };
        let mut attempts = 0u32;
        loop {
            match lock.acquire(&self.config.store).await {
                Ok(()) => return Ok(()),
                Err(EngineError::LockBusy { holder }) => {
                    attempts += 1;
                    if attempts > self.config.lock_retry_budget {
                        return Err(EngineError::LockBusy { holder });
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Acquires the lock (if any), runs `op` once, and releases the lock
    /// before returning -- the §5 "acquire -> mutate -> release" shape,
    /// without holding the lock across the caller's own retries.
    async fn with_lock<F, Fut, T>(&self, op: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.acquire_lock().await?;
        let result = op().await;
        if let Some(lock) = &self.lock {
            lock.release();
        }
        result
    }

    async fn build_graph(&self) -> Result<(DependencyGraph, Vec<Task>), EngineError> {
        let tasks = self.store.list_tasks(TaskFilter::default()).await?;
        let mut edges = Vec::new();
        for task in &tasks {
            for dependency_id in self.store.list_dependencies(&task.id).await? {
                edges.push(Dependency {
                    dependent_id: task.id.clone(),
                    dependency_id,
                });
            }
        }
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
        Ok((DependencyGraph::from_edges(ids, &edges), tasks))
    }

    async fn build_tree(&self) -> Result<TaskTree, EngineError> {
        let tasks = self.store.list_tasks(TaskFilter::default()).await?;
        TaskTree::build(tasks).map_err(|e| EngineError::Corrupt {
            what: e.to_string(),
        })
    }

    /// Dependencies of `id` that are not yet `done`, i.e. what is
    /// actually still blocking it right now.
    async fn incomplete_blockers(&self, id: &TaskId) -> Result<Vec<TaskId>, EngineError> {
        let mut out = Vec::new();
        for dep_id in self.store.list_dependencies(id).await? {
            let dep = self.store.get_task(&dep_id).await?;
            if dep.status != TaskStatus::Done {
                out.push(dep_id);
            }
        }
        Ok(out)
    }

    /// If `id` is currently `blocked` and no longer has any incomplete
    /// dependency, clears it back to `pending` (§4.7 auto-cascade).
    async fn maybe_clear_blocked(&self, id: &TaskId) -> Result<(), EngineError> {
        let task = self.store.get_task(id).await?;
        if task.status != TaskStatus::Blocked {
            return Ok(());
        }
        if self.incomplete_blockers(id).await?.is_empty() {
            let id = id.clone();
            self.with_lock(|| async move {
                self.store
                    .update_task(
                        &id,
                        TaskUpdate {
                            status: Some(TaskStatus::Pending),
                            ..Default::default()
                        },
                    )
                    .await
            })
            .await?;
        }
        Ok(())
    }

    async fn cascade_clear_dependents(&self, completed_id: &TaskId) -> Result<(), EngineError> {
        for dependent_id in self.store.list_dependents(completed_id).await? {
            self.maybe_clear_blocked(&dependent_id).await?;
        }
        Ok(())
    }

    // -- Tree navigation (read-only, no lock) ---------------------------

    /// The task tree, optionally scoped to the subtree rooted at `root`
    /// (with the root's own `parent_id` cleared so it reads as a
    /// self-contained forest).
    #[tracing::instrument(skip(self))]
    pub async fn get_task_tree(&self, root: Option<TaskId>) -> Result<TaskTree, EngineError> {
        let tree = self.build_tree().await?;
        let Some(root_id) = root else {
            return Ok(tree);
        };
        let mut root_task = tree
            .get(&root_id)
            .ok_or_else(|| EngineError::NotFound { id: root_id.clone() })?
            .clone();
        root_task.parent_id = None;
        let mut tasks = vec![root_task];
        tasks.extend(tree.descendants_of(&root_id).into_iter().cloned());
        TaskTree::build(tasks).map_err(|e| EngineError::Corrupt {
            what: e.to_string(),
        })
    }

    /// `id`'s ancestors, closest-first, ending at the root.
    pub async fn get_task_ancestors(&self, id: &TaskId) -> Result<Vec<Task>, EngineError> {
        let tree = self.build_tree().await?;
        let mut path: Vec<Task> = tree
            .path_to(id)
            .ok_or_else(|| EngineError::NotFound { id: id.clone() })?
            .into_iter()
            .cloned()
            .collect();
        path.pop();
        path.reverse();
        Ok(path)
    }

    /// Every descendant of `id`, depth-first pre-order.
    pub async fn get_task_descendants(&self, id: &TaskId) -> Result<Vec<Task>, EngineError> {
        let tree = self.build_tree().await?;
        if tree.get(id).is_none() {
            return Err(EngineError::NotFound { id: id.clone() });
        }
        Ok(tree.descendants_of(id).into_iter().cloned().collect())
    }

    /// `id`'s depth in the tree (`0` for a root).
    pub async fn get_task_depth(&self, id: &TaskId) -> Result<usize, EngineError> {
        let tree = self.build_tree().await?;
        tree.depth_of(id)
            .ok_or_else(|| EngineError::NotFound { id: id.clone() })
    }

    // -- Tree mutation ---------------------------------------------------

    /// Re-parents `id` under `new_parent` (`None` detaches it to a root).
    /// A no-op (no version bump) if `id` is already there.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if either id is unknown;
    /// [`EngineError::GraphInvariant`] if `new_parent` is `id` itself or
    /// one of `id`'s own descendants.
    #[tracing::instrument(skip(self))]
    pub async fn move_subtree(
        &self,
        id: &TaskId,
        new_parent: Option<TaskId>,
    ) -> Result<Task, EngineError> {
        let tree = self.build_tree().await?;
        let current = tree
            .get(id)
            .ok_or_else(|| EngineError::NotFound { id: id.clone() })?
            .clone();
        if current.parent_id == new_parent {
            return Ok(current);
        }
        if let Some(ref np) = new_parent {
            if tree.get(np).is_none() {
                return Err(EngineError::NotFound { id: np.clone() });
            }
            if tree.is_ancestor_of(id, np) {
                return Err(EngineError::GraphInvariant {
                    reason: format!("cannot move {id} under its own descendant {np}"),
                });
            }
        }
        let id = id.clone();
        self.with_lock(|| async move {
            self.store
                .update_task(
                    &id,
                    TaskUpdate {
                        parent_id: Some(new_parent),
                        ..Default::default()
                    },
                )
                .await
        })
        .await
    }

    /// Deletes `id` and (if `cascade`) every descendant, leaves first.
    /// Accepts an optional `cancellation` token, checked once before the
    /// transaction begins -- the long-running half of this operation is
    /// gathering the subtree, which happens before any lock is held.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if `id` is unknown;
    /// [`EngineError::GraphInvariant`] if `id` has children and
    /// `cascade` is `false`.
    #[tracing::instrument(skip(self, cancellation))]
    pub async fn delete_subtree(
        &self,
        id: &TaskId,
        cascade: bool,
        cancellation: Option<CancellationToken>,
    ) -> Result<usize, EngineError> {
        let tree = self.build_tree().await?;
        if tree.get(id).is_none() {
            return Err(EngineError::NotFound { id: id.clone() });
        }
        let descendant_count = tree.descendant_count(id);
        if !cascade && descendant_count > 0 {
            return Err(EngineError::GraphInvariant {
                reason: format!("{id} has {descendant_count} children; cascade=false"),
            });
        }
        if cancellation.is_some_and(|t| t.is_cancelled()) {
            return Err(EngineError::RolledBack {
                reason: "cancelled before commit".to_string(),
            });
        }
        let id = id.clone();
        self.with_lock(|| async move {
            self.store
                .transaction(|tx| reconcile::delete_subtree_recursive(tx, &id))
                .await
        })
        .await?;
        Ok(descendant_count + 1)
    }

    /// Sets `status` on `root` and every descendant in one transaction.
    /// Bypasses the dependency-aware checks
    /// [`TaskService::update_task_status`] performs -- an administrative
    /// bulk operation, not a per-task lifecycle request.
    #[tracing::instrument(skip(self))]
    pub async fn update_tree_status(
        &self,
        root: &TaskId,
        status: TaskStatus,
    ) -> Result<usize, EngineError> {
        let tree = self.build_tree().await?;
        if tree.get(root).is_none() {
            return Err(EngineError::NotFound { id: root.clone() });
        }
        let mut ids = vec![root.clone()];
        ids.extend(tree.descendants_of(root).into_iter().map(|t| t.id.clone()));
        let count = ids.len();
        self.with_lock(|| async move {
            self.store
                .transaction(|tx| {
                    for id in &ids {
                        tx.update_task(
                            id,
                            TaskUpdate {
                                status: Some(status),
                                ..Default::default()
                            },
                        )?;
                    }
                    Ok(())
                })
                .await
        })
        .await?;
        Ok(count)
    }

    // -- Lifecycle ---------------------------------------------------------

    /// Requests a status transition for a single task, applying the
    /// dependency-blocking rule (§4.7): a transition into `in-progress`
    /// is refused with [`EngineError::Blocked`] while any dependency is
    /// not yet `done`, unless `force` is set. Completing or cancelling a
    /// task re-checks every direct dependent and clears its `blocked`
    /// status if it has become unblocked.
    #[tracing::instrument(skip(self))]
    pub async fn update_task_status(
        &self,
        id: &TaskId,
        new_status: TaskStatus,
        force: bool,
    ) -> Result<Task, EngineError> {
        let current = self.store.get_task(id).await?;
        if !force {
            current.status.validate_transition(&new_status)?;
        }
        if new_status == TaskStatus::InProgress && !force {
            let blockers = self.incomplete_blockers(id).await?;
            if !blockers.is_empty() {
                return Err(EngineError::Blocked {
                    id: id.clone(),
                    blockers,
                });
            }
        }
        let id_owned = id.clone();
        let updated = self
            .with_lock(|| async move {
                self.store
                    .update_task(
                        &id_owned,
                        TaskUpdate {
                            status: Some(new_status),
                            ..Default::default()
                        },
                    )
                    .await
            })
            .await?;
        if matches!(new_status, TaskStatus::Done | TaskStatus::Cancelled) {
            self.cascade_clear_dependents(id).await?;
        }
        Ok(updated)
    }

    /// Every `pending`, not-blocked task, optionally narrowed by
    /// `filter` (§4.7).
    pub async fn get_available_tasks(
        &self,
        filter: AvailableFilter,
    ) -> Result<Vec<Task>, EngineError> {
        let tasks = self.store.list_tasks(TaskFilter::default()).await?;
        let mut out = Vec::new();
        for task in tasks {
            if task.status != TaskStatus::Pending {
                continue;
            }
            if let Some(ref parent) = filter.parent_id {
                if &task.parent_id != parent {
                    continue;
                }
            }
            if let Some(band) = filter.priority_band {
                if Priority::from_score(task.priority_score) != band {
                    continue;
                }
            }
            if !self.incomplete_blockers(&task.id).await?.is_empty() {
                continue;
            }
            out.push(task);
        }
        Ok(out)
    }

    /// The single best available task: highest `priority_score`, ties
    /// broken by earliest `created_at`, then by id, for a deterministic
    /// pick across repeated calls against the same state.
    pub async fn get_next_task(&self) -> Result<Option<Task>, EngineError> {
        let mut available = self.get_available_tasks(AvailableFilter::default()).await?;
        available.sort_by(|a, b| {
            b.priority_score
                .partial_cmp(&a.priority_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(available.into_iter().next())
    }

    // -- Dependency graph --------------------------------------------------

    /// A deterministic topological order. `ids` restricts the result to
    /// a subset, preserving every transitive ordering constraint between
    /// members of the subset even when it runs through a task outside
    /// it; any requested id unknown to the store is reported separately
    /// rather than failing the whole call.
    ///
    /// # Errors
    ///
    /// [`EngineError::GraphInvariant`] if the (sub)graph is cyclic.
    pub async fn get_topological_order(
        &self,
        ids: Option<Vec<TaskId>>,
    ) -> Result<(Vec<TaskId>, Vec<TaskId>), EngineError> {
        let (graph, tasks) = self.build_graph().await?;
        let priorities: std::collections::HashMap<TaskId, f64> =
            tasks.iter().map(|t| (t.id.clone(), t.priority_score)).collect();

        let Some(subset) = ids else {
            return match graph.topological_order(&priorities) {
                Some(order) => Ok((order, Vec::new())),
                None => Err(EngineError::GraphInvariant {
                    reason: "dependency graph contains a cycle".to_string(),
                }),
            };
        };

        let known_ids: HashSet<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
        let mut known = Vec::new();
        let mut unresolvable = Vec::new();
        for id in subset {
            if known_ids.contains(&id) {
                known.push(id);
            } else {
                unresolvable.push(id);
            }
        }

        let mut induced_edges = Vec::new();
        for a in &known {
            for b in &known {
                if a != b && graph.shortest_path(a, b).is_some() {
                    induced_edges.push(Dependency {
                        dependent_id: a.clone(),
                        dependency_id: b.clone(),
                    });
                }
            }
        }
        let induced = DependencyGraph::from_edges(known, &induced_edges);
        match induced.topological_order(&priorities) {
            Some(order) => Ok((order, unresolvable)),
            None => Err(EngineError::GraphInvariant {
                reason: "induced subgraph contains a cycle".to_string(),
            }),
        }
    }

    /// Checks whether adding `dependent_id -> dependency_id` would be
    /// legal, without applying it. Unknown ids, a self-loop, and a
    /// would-be cycle (with a witness path) are all reported as errors
    /// rather than raised as an [`EngineError`].
    pub async fn validate_dependency(
        &self,
        dependent_id: &TaskId,
        dependency_id: &TaskId,
    ) -> Result<ValidationResult, EngineError> {
        let mut errors = Vec::new();
        let mut cycles = Vec::new();

        if dependent_id == dependency_id {
            errors.push(format!("task {dependent_id} cannot depend on itself"));
        }

        let (graph, tasks) = self.build_graph().await?;
        let known_ids: HashSet<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
        if !known_ids.contains(dependent_id) {
            errors.push(format!("unknown task {dependent_id}"));
        }
        if !known_ids.contains(dependency_id) {
            errors.push(format!("unknown task {dependency_id}"));
        }

        if errors.is_empty() && graph.would_create_cycle(dependent_id, dependency_id) {
            let mut witness = vec![dependent_id.clone()];
            if let Some(path) = graph.shortest_path(dependency_id, dependent_id) {
                witness.extend(path);
            }
            cycles.push(witness);
            errors.push(format!(
                "adding {dependent_id} -> {dependency_id} would create a cycle"
            ));
        }

        Ok(ValidationResult {
            valid: errors.is_empty(),
            warnings: Vec::new(),
            errors,
            cycles,
        })
    }

    /// Adds a dependency edge, rejecting one that would close a cycle.
    /// If `dependency_id` is not yet `done` and `dependent_id` is
    /// `pending`, marks `dependent_id` as `blocked` (§4.7 auto-block).
    #[tracing::instrument(skip(self))]
    pub async fn add_dependency(
        &self,
        dependent_id: TaskId,
        dependency_id: TaskId,
    ) -> Result<Dependency, EngineError> {
        let validation = self
            .validate_dependency(&dependent_id, &dependency_id)
            .await?;
        if !validation.valid {
            return Err(EngineError::GraphInvariant {
                reason: validation.errors.join("; "),
            });
        }
        let edge = {
            let dependent_id = dependent_id.clone();
            let dependency_id = dependency_id.clone();
            self.with_lock(|| async move {
                self.store.add_dependency(dependent_id, dependency_id).await
            })
            .await?
        };
        let dependency_task = self.store.get_task(&dependency_id).await?;
        if dependency_task.status != TaskStatus::Done {
            let dependent_task = self.store.get_task(&dependent_id).await?;
            if dependent_task.status == TaskStatus::Pending {
                let dependent_id = dependent_id.clone();
                self.with_lock(|| async move {
                    self.store
                        .update_task(
                            &dependent_id,
                            TaskUpdate {
                                status: Some(TaskStatus::Blocked),
                                ..Default::default()
                            },
                        )
                        .await
                })
                .await?;
            }
        }
        Ok(edge)
    }

    /// Removes a dependency edge, clearing `dependent_id`'s `blocked`
    /// status if this was its last incomplete dependency.
    #[tracing::instrument(skip(self))]
    pub async fn remove_dependency(
        &self,
        dependent_id: &TaskId,
        dependency_id: &TaskId,
    ) -> Result<bool, EngineError> {
        let a = dependent_id.clone();
        let b = dependency_id.clone();
        let removed = self
            .with_lock(|| async move { self.store.remove_dependency(&a, &b).await })
            .await?;
        if removed {
            self.maybe_clear_blocked(dependent_id).await?;
        }
        Ok(removed)
    }

    // -- Reconciliation and lock administration -----------------------------

    /// Applies a consolidated reconciliation plan and its parallel
    /// dependency ops inside one transaction. Accepts an optional
    /// `cancellation` token, checked once before the lock is acquired --
    /// cancellation after that point is a no-op, since the transaction
    /// itself runs to completion or rolls back atomically regardless.
    #[tracing::instrument(skip(self, plan, dependency_ops, cancellation))]
    pub async fn apply_reconciliation_plan(
        &self,
        plan: ReconciliationPlan,
        dependency_ops: Vec<DependencyOp>,
        cancellation: Option<CancellationToken>,
    ) -> Result<ReconcileOutcome, EngineError> {
        if cancellation.is_some_and(|t| t.is_cancelled()) {
            return Err(EngineError::RolledBack {
                reason: "cancelled before commit".to_string(),
            });
        }
        self.with_lock(|| async move { reconcile::apply(&self.store, plan, dependency_ops).await })
            .await
    }

    /// The current lock holder, if the lock file exists and this
    /// service has a file lock configured.
    pub fn lock_status(&self) -> Option<LockHolder> {
        self.lock.as_ref().and_then(|l| l.status())
    }

    /// Unconditionally removes the lock file, regardless of holder.
    pub fn force_unlock(&self) {
        if let Some(lock) = &self.lock {
            lock.force_unlock();
        }
    }
}
