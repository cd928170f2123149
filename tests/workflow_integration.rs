//! End-to-end scenarios spanning the dependency graph, the task tree, and
//! the service's cascade-delete and availability queries together.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use taskgraph_engine::service::{AvailableFilter, TaskService};
use taskgraph_engine::store::generic::GenericStore;
use taskgraph_engine::store::memory::InMemoryBackend;
use taskgraph_engine::store::Store;
use taskgraph_engine::types::{NewTask, TaskId, TaskStatus};
use taskgraph_engine::{EngineConfig, EngineError};

fn harness() -> (Arc<GenericStore<InMemoryBackend>>, TaskService<InMemoryBackend>) {
    let store = Arc::new(GenericStore::new(InMemoryBackend::new()));
    let svc = TaskService::new(store.clone(), EngineConfig::default());
    (store, svc)
}

async fn task(store: &GenericStore<InMemoryBackend>, title: &str, priority: f64) -> TaskId {
    Store::add_task(
        store,
        NewTask {
            title: title.to_string(),
            priority_score: Some(priority),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .id
}

#[tokio::test]
async fn adding_an_edge_that_would_close_a_cycle_is_rejected_with_a_witness() {
    let (store, svc) = harness();
    let a = task(&store, "A", 50.0).await;
    let b = task(&store, "B", 50.0).await;
    let c = task(&store, "C", 50.0).await;

    svc.add_dependency(b.clone(), a.clone()).await.unwrap();
    svc.add_dependency(c.clone(), b.clone()).await.unwrap();

    let validation = svc.validate_dependency(&a, &c).await.unwrap();
    assert!(!validation.valid);
    assert!(!validation.cycles.is_empty());

    let err = svc.add_dependency(a.clone(), c.clone()).await.unwrap_err();
    assert!(matches!(err, EngineError::GraphInvariant { .. }));

    // Unchanged: A still has no outgoing dependency.
    assert!(Store::list_dependencies(store.as_ref(), &a).await.unwrap().is_empty());
}

#[tokio::test]
async fn available_and_next_task_reflect_priority_and_blocking() {
    let (store, svc) = harness();
    let a = task(&store, "A", 80.0).await;
    let b = task(&store, "B", 50.0).await;
    let c = task(&store, "C", 90.0).await;
    let d = task(&store, "D", 70.0).await;

    svc.update_task_status(&c, TaskStatus::InProgress, false).await.unwrap();
    svc.update_task_status(&c, TaskStatus::Done, false).await.unwrap();
    svc.add_dependency(d.clone(), b.clone()).await.unwrap();

    let available: Vec<TaskId> = svc
        .get_available_tasks(AvailableFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(available.len(), 2);
    assert!(available.contains(&a));
    assert!(available.contains(&b));
    assert!(!available.contains(&c));
    assert!(!available.contains(&d));

    let next = svc.get_next_task().await.unwrap().unwrap();
    assert_eq!(next.id, a);
}

#[tokio::test]
async fn cascade_delete_removes_incident_edges_but_spares_the_external_task() {
    let (store, svc) = harness();
    let root = task(&store, "P", 50.0).await;
    let child1 = Store::add_task(
        store.as_ref(),
        NewTask {
            title: "child1".to_string(),
            parent_id: Some(root.clone()),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .id;
    let child2 = Store::add_task(
        store.as_ref(),
        NewTask {
            title: "child2".to_string(),
            parent_id: Some(root.clone()),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .id;
    let external = task(&store, "external", 50.0).await;

    svc.add_dependency(external.clone(), child1.clone()).await.unwrap();
    svc.add_dependency(child2.clone(), external.clone()).await.unwrap();

    let deleted = svc.delete_subtree(&root, true, None).await.unwrap();
    assert_eq!(deleted, 3);

    assert!(Store::get_task(store.as_ref(), &root).await.is_err());
    assert!(Store::get_task(store.as_ref(), &child1).await.is_err());
    assert!(Store::get_task(store.as_ref(), &child2).await.is_err());

    let survivor = Store::get_task(store.as_ref(), &external).await.unwrap();
    assert_eq!(survivor.id, external);
    assert!(Store::list_dependencies(store.as_ref(), &external).await.unwrap().is_empty());
    assert!(Store::list_dependents(store.as_ref(), &external).await.unwrap().is_empty());
}
