//! End-to-end reconciliation scenarios: a client-side tracking tree
//! accumulates mutations and flushes them through the reconciler in one
//! transaction against a shared store.

use std::sync::Arc;

use chrono::Utc;
use pretty_assertions::assert_eq;

use taskgraph_engine::service::TaskService;
use taskgraph_engine::store::generic::GenericStore;
use taskgraph_engine::store::memory::InMemoryBackend;
use taskgraph_engine::store::{Store, TaskFilter};
use taskgraph_engine::tracking::{SubtreeSpec, TrackingTree};
use taskgraph_engine::types::{NewTask, TaskId, TaskUpdate};
use taskgraph_engine::{EngineConfig, EngineError};

#[tokio::test]
async fn temp_id_parent_child_flush_resolves_through_one_reconciliation() {
    let store = Arc::new(GenericStore::new(InMemoryBackend::new()));
    let svc = TaskService::new(store.clone(), EngineConfig::default());

    let base_version = Store::tree_version(store.as_ref()).await.unwrap();
    let mut tracking = TrackingTree::from_snapshot(Vec::new(), base_version);

    let parent_temp = TaskId::new_temporary("p");
    let child_temp = TaskId::new_temporary("c");
    let t0 = Utc::now();

    tracking.add_child(
        None,
        SubtreeSpec {
            id: parent_temp.clone(),
            data: NewTask {
                title: "P".to_string(),
                priority_score: Some(50.0),
                ..Default::default()
            },
            children: vec![SubtreeSpec::leaf(
                child_temp.clone(),
                NewTask {
                    title: "C".to_string(),
                    ..Default::default()
                },
            )],
        },
        t0,
    );

    let plan = tracking.consolidate();
    let outcome = svc
        .apply_reconciliation_plan(plan, Vec::new(), None)
        .await
        .unwrap();

    let persistent_parent = outcome.id_map.get(&parent_temp).unwrap();
    let persistent_child = outcome.id_map.get(&child_temp).unwrap();
    assert!(persistent_parent.is_persistent());
    assert!(persistent_child.is_persistent());
    assert_eq!(
        outcome.tree.get(persistent_child).unwrap().parent_id.as_ref(),
        Some(persistent_parent)
    );
    assert_eq!(outcome.new_version, base_version + 1);

    tracking.mark_reconciled(outcome.new_version);
    assert!(!tracking.has_pending_changes());

    let all = Store::list_tasks(store.as_ref(), TaskFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn two_trees_from_the_same_base_version_one_conflicts() {
    let store = Arc::new(GenericStore::new(InMemoryBackend::new()));
    let svc = TaskService::new(store.clone(), EngineConfig::default());

    let task = Store::add_task(
        store.as_ref(),
        NewTask {
            title: "shared".to_string(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let base_version = Store::tree_version(store.as_ref()).await.unwrap();

    let mut tree_one = TrackingTree::from_snapshot(vec![task.clone()], base_version);
    let mut tree_two = TrackingTree::from_snapshot(vec![task.clone()], base_version);

    tree_one.update_task(
        task.id.clone(),
        TaskUpdate {
            title: Some("renamed by one".to_string()),
            ..Default::default()
        },
        Utc::now(),
    );
    tree_two.update_task(
        task.id.clone(),
        TaskUpdate {
            description: Some(Some("set by two".to_string())),
            ..Default::default()
        },
        Utc::now(),
    );

    let outcome_one = svc
        .apply_reconciliation_plan(tree_one.consolidate(), Vec::new(), None)
        .await
        .unwrap();
    tree_one.mark_reconciled(outcome_one.new_version);

    let err = svc
        .apply_reconciliation_plan(tree_two.consolidate(), Vec::new(), None)
        .await
        .unwrap_err();
    match err {
        EngineError::Conflict { expected, actual } => {
            assert_eq!(expected, base_version);
            assert_eq!(actual, base_version + 1);
        }
        other => panic!("expected Conflict, got {other:?}"),
    }
    assert!(tree_two.has_pending_changes());

    let committed = Store::get_task(store.as_ref(), &task.id).await.unwrap();
    assert_eq!(committed.title, "renamed by one");
    assert!(committed.description.is_none());
}
