//! Mutation-tracking tree and reconciliation-plan consolidation (C5).
//!
//! A [`TrackingTree`] lives in a single client process: it is built from a
//! snapshot of the persistent tree, mutated in place as the caller calls
//! [`TrackingTree::update_task`]/[`TrackingTree::add_child`]/
//! [`TrackingTree::remove_child`], and consolidated into a
//! [`ReconciliationPlan`] the [`crate::reconcile::Reconciler`] applies
//! inside one store transaction. Every mutation method here is pure CPU
//! over in-memory maps -- no I/O, matching [`crate::graph::DependencyGraph`]
//! and [`crate::tree::TaskTree`]'s non-suspending contract.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::{NewTask, Task, TaskId, TaskUpdate};

/// A temp-id -> persistent-id mapping produced by reconciliation.
pub type IdMap = HashMap<TaskId, TaskId>;

/// A not-yet-materialized subtree attached by a `child_add` operation.
/// May carry a temporary id for itself and for any of its own children.
#[derive(Debug, Clone)]
pub struct SubtreeSpec {
    /// This subtree's own id, temporary or persistent.
    pub id: TaskId,
    /// The fields to create the task with (its `parent_id` is supplied
    /// separately by the enclosing `child_add` op, not stored here).
    pub data: NewTask,
    /// Nested subtrees to attach beneath this one, depth-first.
    pub children: Vec<SubtreeSpec>,
}

impl SubtreeSpec {
    /// A leaf subtree spec with no children.
    pub fn leaf(id: TaskId, data: NewTask) -> Self {
        Self {
            id,
            data,
            children: Vec::new(),
        }
    }

    fn collect_ids(&self, out: &mut Vec<TaskId>) {
        out.push(self.id.clone());
        for child in &self.children {
            child.collect_ids(out);
        }
    }

    /// Finds `target` anywhere in this subtree (itself or a descendant)
    /// and applies `updates` onto its pending `data`, returning `true` on
    /// a match.
    fn merge_update(&mut self, target: &TaskId, updates: &TaskUpdate) -> bool {
        if &self.id == target {
            apply_update_to_new_task(&mut self.data, updates);
            return true;
        }
        self.children
            .iter_mut()
            .any(|child| child.merge_update(target, updates))
    }
}

/// Applies a [`TaskUpdate`]'s set fields onto a not-yet-created
/// [`NewTask`] -- used when a `task_update` targeting a still-pending
/// `child_add` is folded into that subtree's data instead of being
/// emitted as its own operation.
fn apply_update_to_new_task(data: &mut NewTask, updates: &TaskUpdate) {
    if let Some(ref parent_id) = updates.parent_id {
        data.parent_id = parent_id.clone();
    }
    if let Some(ref title) = updates.title {
        data.title = title.clone();
    }
    if let Some(ref description) = updates.description {
        data.description = description.clone();
    }
    if let Some(status) = updates.status {
        data.status = Some(status);
    }
    if let Some(score) = updates.priority_score {
        data.priority_score = Some(score);
    }
    if let Some(ref prd) = updates.prd {
        data.prd = prd.clone();
    }
    if let Some(ref context_digest) = updates.context_digest {
        data.context_digest = context_digest.clone();
    }
}

/// One pending mutation recorded against a [`TrackingTree`].
#[derive(Debug, Clone)]
pub enum TrackedOp {
    /// A partial field change for an existing (persistent or temporary)
    /// task id.
    TaskUpdate {
        /// The task being updated.
        task_id: TaskId,
        /// The fields to change.
        updates: TaskUpdate,
        /// When this op was recorded.
        ts: DateTime<Utc>,
    },
    /// Attaches a (possibly temp-id-bearing) subtree beneath a parent.
    ChildAdd {
        /// `None` attaches at the root.
        parent_id: Option<TaskId>,
        /// The subtree to create.
        subtree: SubtreeSpec,
        /// When this op was recorded.
        ts: DateTime<Utc>,
    },
    /// Detaches and marks a subtree for deletion.
    ChildRemove {
        /// The parent the child is being removed from, for validation.
        parent_id: Option<TaskId>,
        /// The subtree root to delete.
        child_id: TaskId,
        /// When this op was recorded.
        ts: DateTime<Utc>,
    },
}

impl TrackedOp {
    fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::TaskUpdate { ts, .. } => *ts,
            Self::ChildAdd { ts, .. } => *ts,
            Self::ChildRemove { ts, .. } => *ts,
        }
    }
}

/// A dependency-edge mutation, traveling in a channel parallel to the
/// task op log (§4.5 "Dependency ops").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyOp {
    /// Add an edge.
    Add {
        /// The task that would become blocked.
        dependent_id: TaskId,
        /// The task that must complete first.
        dependency_id: TaskId,
    },
    /// Remove an edge.
    Remove {
        /// The task that was blocked.
        dependent_id: TaskId,
        /// The task it depended on.
        dependency_id: TaskId,
    },
}

impl DependencyOp {
    /// Rewrites a batch of dependency ops through a temp->persistent id
    /// map. Idempotent: an id already persistent (or already equal to its
    /// mapped target) passes through unchanged.
    ///
    /// # Errors
    ///
    /// [`EngineError::GraphInvariant`] if any op names a temporary id with
    /// no entry in `id_map` -- per §4.5, an unmapped temporary id is fatal
    /// for the whole batch.
    pub fn rewrite_through_map(
        ops: &[DependencyOp],
        id_map: &IdMap,
    ) -> Result<Vec<DependencyOp>, EngineError> {
        let resolve = |id: &TaskId| -> Result<TaskId, EngineError> {
            if id.is_persistent() {
                return Ok(id.clone());
            }
            id_map.get(id).cloned().ok_or_else(|| EngineError::GraphInvariant {
                reason: format!("temporary id {id} has no entry in the id map"),
            })
        };
        ops.iter()
            .map(|op| match op {
                DependencyOp::Add {
                    dependent_id,
                    dependency_id,
                } => Ok(DependencyOp::Add {
                    dependent_id: resolve(dependent_id)?,
                    dependency_id: resolve(dependency_id)?,
                }),
                DependencyOp::Remove {
                    dependent_id,
                    dependency_id,
                } => Ok(DependencyOp::Remove {
                    dependent_id: resolve(dependent_id)?,
                    dependency_id: resolve(dependency_id)?,
                }),
            })
            .collect()
    }
}

/// The consolidated, ordered set of operations submitted from a
/// [`TrackingTree`] to the store, together with the base version it was
/// built against (§4.5).
#[derive(Debug, Clone)]
pub struct ReconciliationPlan {
    /// Identifies the tracking tree this plan came from, for diagnostics.
    pub tree_id: String,
    /// The tree-wide version observed when the tracking tree was created
    /// or last cleared.
    pub base_version: u64,
    /// Consolidated task operations, in timestamp order.
    pub ordered_ops: Vec<TrackedOp>,
}

/// A single client process's view of the task tree plus its accumulated,
/// not-yet-reconciled mutations.
#[derive(Debug, Clone)]
pub struct TrackingTree {
    tree_id: String,
    base_version: u64,
    tasks: HashMap<TaskId, Task>,
    children: HashMap<Option<TaskId>, Vec<TaskId>>,
    log: Vec<TrackedOp>,
}

impl TrackingTree {
    /// Builds a tracking tree from a persistent-tree snapshot and the
    /// version it was read at.
    pub fn from_snapshot(tasks: Vec<Task>, base_version: u64) -> Self {
        let mut children: HashMap<Option<TaskId>, Vec<TaskId>> = HashMap::new();
        let mut by_id = HashMap::new();
        for task in tasks {
            children.entry(task.parent_id.clone()).or_default().push(task.id.clone());
            by_id.insert(task.id.clone(), task);
        }
        Self {
            tree_id: Uuid::new_v4().to_string(),
            base_version,
            tasks: by_id,
            children,
            log: Vec::new(),
        }
    }

    /// `true` iff any operation has been recorded since the last clear.
    pub fn has_pending_changes(&self) -> bool {
        !self.log.is_empty()
    }

    /// The version this tree's reconciliation plan will be checked
    /// against.
    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    /// Reads a task from the in-process mutated view (includes
    /// not-yet-reconciled `child_add` subtrees).
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Applies a partial update in place and records the op. Mutating a
    /// task this tree does not know about is a caller error and is
    /// ignored rather than panicking -- the reconciler will reject the
    /// same update against the authoritative store.
    pub fn update_task(&mut self, task_id: TaskId, updates: TaskUpdate, ts: DateTime<Utc>) {
        if updates.is_empty() {
            return;
        }
        if let Some(task) = self.tasks.get_mut(&task_id) {
            apply_update_in_place(task, &updates);
        }
        self.log.push(TrackedOp::TaskUpdate {
            task_id,
            updates,
            ts,
        });
    }

    /// Attaches `subtree` beneath `parent_id`, materializing a local
    /// placeholder `Task` for every node so concurrent same-process reads
    /// see it immediately, and records the op.
    pub fn add_child(&mut self, parent_id: Option<TaskId>, subtree: SubtreeSpec, ts: DateTime<Utc>) {
        self.materialize(parent_id.clone(), &subtree);
        self.log.push(TrackedOp::ChildAdd {
            parent_id,
            subtree,
            ts,
        });
    }

    fn materialize(&mut self, parent_id: Option<TaskId>, spec: &SubtreeSpec) {
        let now = Utc::now();
        let task = Task {
            id: spec.id.clone(),
            parent_id: parent_id.clone(),
            title: spec.data.title.clone(),
            description: spec.data.description.clone(),
            status: spec.data.status.unwrap_or(crate::types::TaskStatus::Pending),
            priority_score: spec.data.priority_score.unwrap_or(crate::types::DEFAULT_PRIORITY_SCORE),
            prd: spec.data.prd.clone(),
            context_digest: spec.data.context_digest.clone(),
            created_at: now,
            updated_at: now,
        };
        self.children.entry(parent_id).or_default().push(spec.id.clone());
        self.children.entry(Some(spec.id.clone())).or_default();
        self.tasks.insert(spec.id.clone(), task);
        for child in &spec.children {
            self.materialize(Some(spec.id.clone()), child);
        }
    }

    /// Detaches `child_id` (and every descendant) from the local view and
    /// records the op.
    pub fn remove_child(&mut self, parent_id: Option<TaskId>, child_id: TaskId, ts: DateTime<Utc>) {
        self.detach(&child_id);
        self.log.push(TrackedOp::ChildRemove {
            parent_id,
            child_id,
            ts,
        });
    }

    fn detach(&mut self, id: &TaskId) {
        let descendants = self.children.remove(&Some(id.clone())).unwrap_or_default();
        self.tasks.remove(id);
        for descendant in descendants {
            self.detach(&descendant);
        }
    }

    /// Folds the recorded log into a deterministic [`ReconciliationPlan`]
    /// (§4.5 consolidation rules).
    pub fn consolidate(&self) -> ReconciliationPlan {
        let mut ops: Vec<TrackedOp> = self.log.clone();
        ops.sort_by_key(|op| op.timestamp());

        let mut ordered: Vec<TrackedOp> = Vec::new();
        let mut cancelled: Vec<bool> = Vec::new();
        let mut task_update_idx: HashMap<TaskId, usize> = HashMap::new();

        for op in ops {
            match op {
                TrackedOp::TaskUpdate { task_id, updates, ts } => {
                    if updates.is_empty() {
                        continue;
                    }
                    let folded_into_child_add = ordered.iter_mut().enumerate().rev().find_map(
                        |(idx, existing)| match existing {
                            TrackedOp::ChildAdd { subtree, .. } if !cancelled[idx] => {
                                if subtree.merge_update(&task_id, &updates) {
                                    Some(())
                                } else {
                                    None
                                }
                            }
                            _ => None,
                        },
                    );
                    if folded_into_child_add.is_some() {
                        continue;
                    }
                    if let Some(&idx) = task_update_idx.get(&task_id) {
                        if let TrackedOp::TaskUpdate {
                            updates: existing, ..
                        } = &mut ordered[idx]
                        {
                            *existing = existing.clone().merge_over(updates);
                        }
                    } else {
                        task_update_idx.insert(task_id.clone(), ordered.len());
                        ordered.push(TrackedOp::TaskUpdate {
                            task_id,
                            updates,
                            ts,
                        });
                        cancelled.push(false);
                    }
                }
                TrackedOp::ChildAdd {
                    parent_id,
                    subtree,
                    ts,
                } => {
                    ordered.push(TrackedOp::ChildAdd {
                        parent_id,
                        subtree,
                        ts,
                    });
                    cancelled.push(false);
                }
                TrackedOp::ChildRemove {
                    parent_id,
                    child_id,
                    ts,
                } => {
                    let matching_add = ordered.iter().enumerate().find(|(idx, existing)| {
                        !cancelled[*idx]
                            && matches!(existing, TrackedOp::ChildAdd { subtree, .. } if subtree.id == child_id)
                    });
                    match matching_add {
                        Some((idx, _)) => {
                            cancelled[idx] = true;
                        }
                        None => {
                            ordered.push(TrackedOp::ChildRemove {
                                parent_id,
                                child_id,
                                ts,
                            });
                            cancelled.push(false);
                        }
                    }
                }
            }
        }

        let ordered_ops = ordered
            .into_iter()
            .zip(cancelled)
            .filter_map(|(op, is_cancelled)| if is_cancelled { None } else { Some(op) })
            .collect();

        ReconciliationPlan {
            tree_id: self.tree_id.clone(),
            base_version: self.base_version,
            ordered_ops,
        }
    }

    /// Clears the log and advances `base_version` after a successful
    /// reconciliation (§4.6 step 6).
    pub fn mark_reconciled(&mut self, new_version: u64) {
        self.log.clear();
        self.base_version = new_version;
    }
}

fn apply_update_in_place(task: &mut Task, updates: &TaskUpdate) {
    if let Some(ref parent_id) = updates.parent_id {
        task.parent_id = parent_id.clone();
    }
    if let Some(ref title) = updates.title {
        task.title = title.clone();
    }
    if let Some(ref description) = updates.description {
        task.description = description.clone();
    }
    if let Some(status) = updates.status {
        task.status = status;
    }
    if let Some(score) = updates.priority_score {
        task.priority_score = score;
    }
    if let Some(ref prd) = updates.prd {
        task.prd = prd.clone();
    }
    if let Some(ref context_digest) = updates.context_digest {
        task.context_digest = context_digest.clone();
    }
    task.updated_at = Utc::now();
}
