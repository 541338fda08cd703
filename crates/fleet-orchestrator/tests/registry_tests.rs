//! Node registry behavior: registration, heartbeats, the health state
//! machine, and selection strategies.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use fleet_orchestrator::events::EventBus;
use fleet_orchestrator::registry::{
    HeartbeatMetrics, NodeRegistry, NodeStatus, SelectionStrategy,
};
use fleet_orchestrator::OrchestratorEvent;

#[tokio::test]
async fn register_unregister_register_is_equivalent_to_single_register() {
    let registry = test_registry(SelectionStrategy::CapabilityMatch, 30_000);
    let caps = vec!["scan".to_string()];

    registry.register_node("w1", caps.clone(), 5, "1");
    registry.unregister_node("w1");
    registry.register_node("w1", caps, 5, "1");

    let node = registry.get_node("w1").unwrap();
    assert_eq!(node.status, NodeStatus::Online);
    assert_eq!(node.current_load, 0);
    assert_eq!(
        registry.find_best_node("scan", &tools(&["scan"])),
        Some("w1".to_string())
    );
}

#[tokio::test]
async fn reregistration_replaces_capabilities() {
    let registry = test_registry(SelectionStrategy::CapabilityMatch, 30_000);
    registry.register_node("w1", vec!["scan".to_string()], 5, "1");
    registry.register_node("w1", vec!["encrypt".to_string()], 5, "2");

    assert_eq!(registry.find_best_node("t", &tools(&["scan"])), None);
    assert_eq!(
        registry.find_best_node("t", &tools(&["encrypt"])),
        Some("w1".to_string())
    );
}

#[tokio::test]
async fn heartbeat_updates_load_and_latency_ema() {
    let registry = test_registry(SelectionStrategy::CapabilityMatch, 30_000);
    registry.register_node("w1", vec!["scan".to_string()], 5, "1");

    registry.handle_heartbeat("w1", &metrics(100.0, 2));
    let node = registry.get_node("w1").unwrap();
    assert_eq!(node.latency_ms, 100.0);
    assert_eq!(node.current_load, 2);

    registry.handle_heartbeat("w1", &metrics(200.0, 3));
    let node = registry.get_node("w1").unwrap();
    // EMA with alpha 0.3: 100 * 0.7 + 200 * 0.3
    assert!((node.latency_ms - 130.0).abs() < 1e-9);
    assert_eq!(node.current_load, 3);
}

#[tokio::test]
async fn silent_node_degrades_then_goes_offline() {
    let (registry, events) = test_registry_with_events(SelectionStrategy::CapabilityMatch, 40);
    let mut rx = events.subscribe();

    registry.register_node("w1", vec!["scan".to_string()], 5, "1");

    tokio::time::sleep(Duration::from_millis(50)).await;
    registry.run_maintenance();
    assert_eq!(registry.get_node("w1").unwrap().status, NodeStatus::Degraded);

    tokio::time::sleep(Duration::from_millis(50)).await;
    registry.run_maintenance();
    assert_eq!(registry.get_node("w1").unwrap().status, NodeStatus::Offline);

    let seen = drain(&mut rx);
    assert!(seen
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::NodeDegraded { .. })));
    assert!(seen
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::NodeOffline { .. })));
}

#[tokio::test]
async fn zero_heartbeat_timeout_degrades_immediately() {
    let registry = test_registry(SelectionStrategy::CapabilityMatch, 0);
    registry.register_node("w1", vec!["scan".to_string()], 5, "1");

    tokio::time::sleep(Duration::from_millis(5)).await;
    registry.run_maintenance();
    assert_eq!(registry.get_node("w1").unwrap().status, NodeStatus::Degraded);
}

#[tokio::test]
async fn heartbeat_restores_online_from_any_state() {
    let registry = test_registry(SelectionStrategy::CapabilityMatch, 10);
    registry.register_node("w1", vec!["scan".to_string()], 5, "1");

    tokio::time::sleep(Duration::from_millis(30)).await;
    registry.run_maintenance();
    registry.run_maintenance();
    assert_eq!(registry.get_node("w1").unwrap().status, NodeStatus::Offline);

    registry.handle_heartbeat("w1", &metrics(10.0, 0));
    assert_eq!(registry.get_node("w1").unwrap().status, NodeStatus::Online);
}

#[tokio::test]
async fn recovery_requires_capability_compatible_peer() {
    let registry = test_registry(SelectionStrategy::CapabilityMatch, 10);
    registry.register_node("w1", vec!["scan".to_string(), "encrypt".to_string()], 5, "1");
    registry.register_node("w2", vec!["scan".to_string()], 5, "1");
    registry.register_node(
        "w3",
        vec!["scan".to_string(), "encrypt".to_string(), "extra".to_string()],
        5,
        "1",
    );

    // Only w1 goes silent.
    tokio::time::sleep(Duration::from_millis(30)).await;
    registry.handle_heartbeat("w2", &metrics(10.0, 0));
    registry.handle_heartbeat("w3", &metrics(10.0, 0));
    registry.run_maintenance();
    registry.run_maintenance();
    assert_eq!(registry.get_node("w1").unwrap().status, NodeStatus::Offline);

    // w2 lacks encrypt; w3 covers everything w1 declared.
    let peers = registry.trigger_recovery("w1").unwrap();
    assert_eq!(peers, vec!["w3".to_string()]);
    assert_eq!(
        registry.get_node("w1").unwrap().status,
        NodeStatus::Recovering
    );

    registry.handle_heartbeat("w1", &metrics(10.0, 0));
    assert_eq!(registry.get_node("w1").unwrap().status, NodeStatus::Online);
}

#[tokio::test]
async fn least_loaded_strategy_prefers_low_load_then_low_latency() {
    let registry = test_registry(SelectionStrategy::LeastLoaded, 30_000);
    registry.register_node("a", vec!["scan".to_string()], 5, "1");
    registry.register_node("b", vec!["scan".to_string()], 5, "1");
    registry.register_node("c", vec!["scan".to_string()], 5, "1");

    registry.handle_heartbeat("a", &metrics(10.0, 2));
    registry.handle_heartbeat("b", &metrics(50.0, 0));
    registry.handle_heartbeat("c", &metrics(10.0, 0));

    // c and b tie on load; c wins on latency.
    assert_eq!(
        registry.find_best_node("scan", &tools(&["scan"])),
        Some("c".to_string())
    );
}

#[tokio::test]
async fn deterministic_strategy_is_stable_for_same_inputs() {
    let registry = test_registry(SelectionStrategy::Deterministic, 30_000);
    for id in ["a", "b", "c"] {
        registry.register_node(id, vec!["scan".to_string()], 5, "1");
    }

    let first = registry.find_best_node("scan", &tools(&["scan"]));
    for _ in 0..10 {
        assert_eq!(registry.find_best_node("scan", &tools(&["scan"])), first);
    }
}

#[tokio::test]
async fn capability_match_prefers_headroom_over_latency() {
    let registry = test_registry(SelectionStrategy::CapabilityMatch, 30_000);
    registry.register_node("a", vec!["scan".to_string()], 10, "1");
    registry.register_node("b", vec!["scan".to_string()], 5, "1");

    registry.handle_heartbeat("a", &metrics(400.0, 0)); // headroom 10, slow
    registry.handle_heartbeat("b", &metrics(5.0, 0)); // headroom 5, fast

    // (10 * 100) - 400 = 600 beats (5 * 100) - 5 = 495.
    assert_eq!(
        registry.find_best_node("scan", &tools(&["scan"])),
        Some("a".to_string())
    );
}

#[tokio::test]
async fn full_node_is_not_a_candidate() {
    let registry = test_registry(SelectionStrategy::CapabilityMatch, 30_000);
    registry.register_node("a", vec!["scan".to_string()], 2, "1");
    registry.handle_heartbeat("a", &metrics(10.0, 2));

    assert_eq!(registry.find_best_node("scan", &tools(&["scan"])), None);
}

#[tokio::test]
async fn load_delta_clamps_to_bounds() {
    let registry = test_registry(SelectionStrategy::CapabilityMatch, 30_000);
    registry.register_node("a", vec!["scan".to_string()], 3, "1");

    registry.apply_load_delta("a", -5);
    assert_eq!(registry.get_node("a").unwrap().current_load, 0);
    registry.apply_load_delta("a", 10);
    assert_eq!(registry.get_node("a").unwrap().current_load, 3);
}

// --- helpers ---

fn test_registry(strategy: SelectionStrategy, heartbeat_timeout_ms: u64) -> Arc<NodeRegistry> {
    test_registry_with_events(strategy, heartbeat_timeout_ms).0
}

fn test_registry_with_events(
    strategy: SelectionStrategy,
    heartbeat_timeout_ms: u64,
) -> (Arc<NodeRegistry>, EventBus) {
    let events = EventBus::new();
    let registry = Arc::new(NodeRegistry::new(
        heartbeat_timeout_ms,
        strategy,
        "a".repeat(64),
        events.clone(),
    ));
    (registry, events)
}

fn tools(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn metrics(latency_ms: f64, load: u32) -> HeartbeatMetrics {
    HeartbeatMetrics {
        latency_ms,
        load,
        ..Default::default()
    }
}

fn drain(
    rx: &mut tokio::sync::broadcast::Receiver<OrchestratorEvent>,
) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
