//! Reconciler (C6): applies a consolidated reconciliation plan inside one
//! store transaction, resolving temporary ids, enforcing invariants, and
//! returning the post-state tree plus the id map.
//!
//! Runs entirely inside
//! [`crate::store::generic::GenericStore::transaction_with_expected_version`],
//! which re-checks the plan's base version atomically with the commit,
//! with the cooperative file lock held for the whole duration (the caller,
//! [`crate::service::TaskService`], is responsible for holding the lock
//! across this call -- §5's "acquire lock -> begin transaction -> validate
//! -> mutate -> commit -> release lock" ordering).

use std::collections::HashMap;

use crate::error::EngineError;
use crate::graph::DependencyGraph;
use crate::store::generic::{GenericStore, Tx};
use crate::store::StorageBackend;
use crate::tracking::{DependencyOp, IdMap, ReconciliationPlan, SubtreeSpec, TrackedOp};
use crate::tree::TaskTree;
use crate::types::TaskId;

/// What a successful reconciliation hands back to the caller (§4.6).
#[derive(Debug)]
pub struct ReconcileOutcome {
    /// The freshly rebuilt task tree, post-commit.
    pub tree: TaskTree,
    /// Temp id -> persistent id, for every `child_add` that minted a
    /// fresh id during this plan.
    pub id_map: IdMap,
    /// The tree-wide version counter after this plan's commit.
    pub new_version: u64,
}

fn resolve_id(id_map: &IdMap, id: &TaskId) -> Result<TaskId, EngineError> {
    if id.is_temporary() {
        id_map
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::GraphInvariant {
                reason: format!("temporary id {id} has no entry in the id map"),
            })
    } else {
        Ok(id.clone())
    }
}

fn apply_child_add(
    tx: &mut Tx,
    parent_id: Option<TaskId>,
    subtree: &SubtreeSpec,
    id_map: &mut IdMap,
) -> Result<TaskId, EngineError> {
    let mut data = subtree.data.clone();
    data.parent_id = parent_id;
    let created = if subtree.id.is_temporary() {
        let task = tx.add_task(data)?;
        id_map.insert(subtree.id.clone(), task.id.clone());
        task
    } else {
        tx.add_task_with_id(subtree.id.clone(), data)?
    };
    for child in &subtree.children {
        apply_child_add(tx, Some(created.id.clone()), child, id_map)?;
    }
    Ok(created.id)
}

/// Deletes `id` and every descendant, leaves first (§4.6 step 2
/// `child_remove`). Incident dependency edges are removed by
/// [`Tx::delete_task`] as each node is dropped.
pub(crate) fn delete_subtree_recursive(tx: &mut Tx, id: &TaskId) -> Result<(), EngineError> {
    let children: Vec<TaskId> = tx
        .tasks()
        .filter(|t| t.parent_id.as_ref() == Some(id))
        .map(|t| t.id.clone())
        .collect();
    for child in children {
        delete_subtree_recursive(tx, &child)?;
    }
    if !tx.delete_task(id) {
        return Err(EngineError::NotFound { id: id.clone() });
    }
    Ok(())
}

fn apply_task_ops(
    tx: &mut Tx,
    ordered_ops: &[TrackedOp],
) -> Result<IdMap, EngineError> {
    let mut id_map = IdMap::new();
    for op in ordered_ops {
        match op {
            TrackedOp::ChildAdd {
                parent_id, subtree, ..
            } => {
                let resolved_parent = match parent_id {
                    Some(id) => Some(resolve_id(&id_map, id)?),
                    None => None,
                };
                apply_child_add(tx, resolved_parent, subtree, &mut id_map)?;
            }
            TrackedOp::TaskUpdate {
                task_id, updates, ..
            } => {
                let resolved = resolve_id(&id_map, task_id)?;
                if let Some(new_status) = updates.status {
                    let current_status = tx
                        .get_task(&resolved)
                        .ok_or_else(|| EngineError::NotFound {
                            id: resolved.clone(),
                        })?
                        .status;
                    current_status.validate_transition(&new_status)?;
                }
                tx.update_task(&resolved, updates.clone())?;
            }
            TrackedOp::ChildRemove { child_id, .. } => {
                let resolved = resolve_id(&id_map, child_id)?;
                delete_subtree_recursive(tx, &resolved)?;
            }
        }
    }
    Ok(id_map)
}

fn apply_dependency_ops(tx: &mut Tx, ops: Vec<DependencyOp>) -> Result<(), EngineError> {
    for op in ops {
        match op {
            DependencyOp::Add {
                dependent_id,
                dependency_id,
            } => {
                let snapshot = tx.dependency_snapshot();
                let node_ids: Vec<TaskId> = tx.tasks().map(|t| t.id.clone()).collect();
                let graph = DependencyGraph::from_edges(node_ids, &snapshot);
                if graph.would_create_cycle(&dependent_id, &dependency_id) {
                    return Err(EngineError::GraphInvariant {
                        reason: format!(
                            "adding {dependent_id} -> {dependency_id} would create a cycle"
                        ),
                    });
                }
                tx.add_dependency(dependent_id, dependency_id)?;
            }
            DependencyOp::Remove {
                dependent_id,
                dependency_id,
            } => {
                tx.remove_dependency(&dependent_id, &dependency_id);
            }
        }
    }
    Ok(())
}

/// Applies a consolidated [`ReconciliationPlan`] and its parallel
/// dependency-op batch against `store`, inside one transaction.
///
/// # Errors
///
/// [`EngineError::Conflict`] if the tree-wide version has moved since
/// `plan.base_version` (best-effort, per-tree optimistic concurrency --
/// the distilled algorithm allows this as the default policy when no
/// finer per-task tracking is specified). The check is re-evaluated
/// atomically with the commit, inside the same lock hold as the
/// transaction itself, so two callers racing against the same stale
/// `base_version` cannot both pass the check and have the second
/// silently commit on top of the first (see
/// [`GenericStore::transaction_with_expected_version`]). Any invariant
/// violation (unknown id, cycle, illegal transition) aborts the whole
/// batch atomically and leaves the store untouched.
pub async fn apply<B: StorageBackend>(
    store: &GenericStore<B>,
    plan: ReconciliationPlan,
    dependency_ops: Vec<DependencyOp>,
) -> Result<ReconcileOutcome, EngineError> {
    let id_map: IdMap = store
        .transaction_with_expected_version(plan.base_version, |tx| {
            let id_map = apply_task_ops(tx, &plan.ordered_ops)?;
            let rewritten = DependencyOp::rewrite_through_map(&dependency_ops, &id_map)?;
            apply_dependency_ops(tx, rewritten)?;
            Ok(id_map)
        })
        .await?;

    let new_version = store.tree_version().await?;
    let tasks = store
        .list_tasks(crate::store::TaskFilter::default())
        .await?;
    let tree = TaskTree::build(tasks).map_err(|e| EngineError::Corrupt {
        what: e.to_string(),
    })?;

    Ok(ReconcileOutcome {
        tree,
        id_map,
        new_version,
    })
}
