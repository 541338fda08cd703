//! Collaborator seams: persistence idempotence and broker ordering.

use std::collections::BTreeSet;
use std::time::Duration;

use fleet_orchestrator::router::{Task, TaskState};
use fleet_orchestrator::store::{InMemoryBroker, InMemoryTaskStore, TaskBroker, TaskStore};
use serde_json::json;

#[tokio::test]
async fn status_transitions_are_idempotent() {
    let store = InMemoryTaskStore::new();
    let task = task("t1", 5);
    store.save(&task).await.unwrap();

    store.mark_completed("t1", &json!({ "ok": true })).await.unwrap();
    store.mark_completed("t1", &json!({ "ok": true })).await.unwrap();

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.by_status.get("completed"), Some(&1));
}

#[tokio::test]
async fn stats_group_by_status_and_type() {
    let store = InMemoryTaskStore::new();
    for (id, kind) in [("a", "scan"), ("b", "scan"), ("c", "encrypt")] {
        let mut t = task(id, 5);
        t.task_type = kind.to_string();
        store.save(&t).await.unwrap();
    }
    store.mark_started("a").await.unwrap();
    store.mark_failed("b", "boom").await.unwrap();

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_type.get("scan"), Some(&2));
    assert_eq!(stats.by_type.get("encrypt"), Some(&1));
    assert_eq!(stats.by_status.get("active"), Some(&1));
    assert_eq!(stats.by_status.get("failed"), Some(&1));
    assert_eq!(stats.by_status.get("queued"), Some(&1));
}

#[tokio::test]
async fn updates_to_unknown_tasks_are_noops() {
    let store = InMemoryTaskStore::new();
    store.update_status("ghost", TaskState::Active).await.unwrap();
    store.mark_failed("ghost", "boom").await.unwrap();
    assert_eq!(store.get_stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn broker_dequeues_by_priority_then_submission_order() {
    let broker = InMemoryBroker::new();
    broker.enqueue(task("low-early", 2)).await.unwrap();
    broker.enqueue(task("high", 9)).await.unwrap();
    broker.enqueue(task("low-late", 2)).await.unwrap();

    assert_eq!(broker.dequeue().await.unwrap().unwrap().id, "high");
    assert_eq!(broker.dequeue().await.unwrap().unwrap().id, "low-early");
    assert_eq!(broker.dequeue().await.unwrap().unwrap().id, "low-late");
    assert!(broker.dequeue().await.unwrap().is_none());
}

#[tokio::test]
async fn acked_tasks_do_not_return() {
    let broker = InMemoryBroker::new();
    broker.enqueue(task("t1", 5)).await.unwrap();
    let popped = broker.dequeue().await.unwrap().unwrap();
    broker.ack(&popped.id).await.unwrap();
    assert!(broker.dequeue().await.unwrap().is_none());
    assert_eq!(broker.depth(), 0);
}

#[tokio::test]
async fn nacked_tasks_reenter_the_queue_after_a_delay() {
    let broker = InMemoryBroker::new();
    broker.enqueue(task("t1", 5)).await.unwrap();
    let popped = broker.dequeue().await.unwrap().unwrap();
    broker.nack(&popped.id).await.unwrap();

    // Immediately after the nack the task is still in its backoff window.
    assert!(broker.dequeue().await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(broker.dequeue().await.unwrap().unwrap().id, "t1");
}

// --- helpers ---

fn task(id: &str, priority: u8) -> Task {
    Task {
        id: id.to_string(),
        task_type: "scan".to_string(),
        name: id.to_string(),
        payload: json!({}),
        priority,
        required_tools: BTreeSet::new(),
        target_node: None,
        timeout_ms: 300_000,
        deterministic: false,
        submitted_at_ms: 0,
    }
}
