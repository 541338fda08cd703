//! End-to-end orchestrator behavior: catalog loading, heartbeat ingestion,
//! the submit/assign/complete cycle over the wire, offline failover through
//! the event pump, seed persistence, and health checks.

use std::io::Write;
use std::time::Duration;

use fleet_orchestrator::orchestrator::CheckStatus;
use fleet_orchestrator::protocol::{Message, MessageType};
use fleet_orchestrator::registry::NodeStatus;
use fleet_orchestrator::router::{TaskSpec, TaskState};
use fleet_orchestrator::{NodeCatalog, Orchestrator, OrchestratorConfig, WorkflowCatalog};
use serde_json::{json, Value};

#[tokio::test]
async fn catalogs_register_workers_with_merged_tools_and_overrides() {
    let nodes = write_temp(
        "nodes.yaml",
        r#"
nodes:
  - name: w1
    role: scanner
    capabilities: [scan]
    max_concurrent: 3
    priority: 5
  - name: w2
    capabilities: [encrypt]
"#,
    );
    let workflows = write_temp(
        "workflows.yaml",
        r#"
node_tools:
  w1: [deep-scan]
node_prompts:
  w1:
    constraints:
      max_connections_per_cycle: 2
"#,
    );

    let orchestrator = Orchestrator::initialize(test_config()).unwrap();
    let node_catalog = NodeCatalog::load(nodes.path()).unwrap();
    let workflow_catalog = WorkflowCatalog::load(workflows.path()).unwrap();
    orchestrator.load_catalogs(&node_catalog, &workflow_catalog);

    let w1 = orchestrator.registry().get_node("w1").unwrap();
    assert!(w1.capabilities.contains("scan"));
    assert!(w1.capabilities.contains("deep-scan"));
    assert_eq!(w1.max_concurrent_tasks, 2); // constraint override
    let w2 = orchestrator.registry().get_node("w2").unwrap();
    assert_eq!(w2.max_concurrent_tasks, 5); // declared default
}

#[tokio::test]
async fn heartbeat_message_feeds_registry_and_monitor() {
    let orchestrator = Orchestrator::initialize(test_config()).unwrap();
    orchestrator
        .registry()
        .register_node("w1", vec!["scan".to_string()], 5, "1");

    assert!(orchestrator.ingest(heartbeat_message("w1", 12.0, 1)).await);

    let node = orchestrator.registry().get_node("w1").unwrap();
    assert_eq!(node.status, NodeStatus::Online);
    assert_eq!(node.current_load, 1);
    assert_eq!(node.latency_ms, 12.0);
    assert_eq!(orchestrator.monitor().metrics("w1").len(), 1);
}

#[tokio::test]
async fn submit_assign_complete_over_the_wire() {
    let orchestrator = Orchestrator::initialize(test_config()).unwrap();
    let mut outbound = orchestrator.take_outbound().unwrap();
    orchestrator
        .registry()
        .register_node("w1", vec!["scan".to_string()], 5, "1");
    orchestrator.ingest(heartbeat_message("w1", 10.0, 0)).await;

    let task_id = orchestrator
        .submit_task(TaskSpec {
            task_type: "scan".to_string(),
            name: "nightly".to_string(),
            payload: json!({ "target": "10.0.0.0/24" }),
            priority: 5,
            required_tools: ["scan".to_string()].into_iter().collect(),
            target_node: None,
            timeout_ms: None,
            deterministic: false,
        })
        .await
        .unwrap();
    orchestrator.router().process_pending().await;

    let assign = next_of_type(&mut outbound, MessageType::TaskAssign).await;
    assert_eq!(assign.target, "w1");
    assert_eq!(assign.payload["task"]["id"], json!(task_id));

    // The worker reports completion as its own message.
    let complete = Message::new(
        "w1",
        "orchestrator",
        MessageType::TaskComplete,
        json!({ "taskId": task_id, "result": { "hosts": 7 } }),
        5,
        2,
        now() + 30_000,
    );
    assert!(orchestrator.ingest(complete).await);

    let status = orchestrator.task_status(&task_id).unwrap();
    assert_eq!(status.state, TaskState::Completed);
    assert_eq!(status.result.unwrap()["hosts"], json!(7));
    assert_eq!(
        orchestrator.registry().get_node("w1").unwrap().current_load,
        0
    );
}

#[tokio::test]
async fn offline_worker_triggers_requeue_through_the_event_pump() {
    let mut config = test_config();
    config.heartbeat_timeout_ms = 40;
    let orchestrator = Orchestrator::initialize(config).unwrap();
    orchestrator.start();

    orchestrator
        .registry()
        .register_node("w1", vec!["scan".to_string()], 5, "1");
    orchestrator.ingest(heartbeat_message("w1", 10.0, 0)).await;

    let task_id = orchestrator
        .submit_task(TaskSpec {
            task_type: "scan".to_string(),
            name: "t".to_string(),
            payload: Value::Null,
            priority: 5,
            required_tools: ["scan".to_string()].into_iter().collect(),
            target_node: None,
            timeout_ms: None,
            deterministic: false,
        })
        .await
        .unwrap();
    orchestrator.router().process_pending().await;
    assert_eq!(
        orchestrator.task_status(&task_id).unwrap().state,
        TaskState::Active
    );

    // w1 goes silent past two timeouts; the maintenance transitions fire
    // and the event pump requeues its assignment.
    tokio::time::sleep(Duration::from_millis(100)).await;
    orchestrator.registry().run_maintenance();
    orchestrator.registry().run_maintenance();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        orchestrator.task_status(&task_id).unwrap().state,
        TaskState::Queued
    );
    orchestrator.stop().await;
}

#[tokio::test]
async fn health_fails_with_an_empty_fleet_and_passes_with_workers() {
    let orchestrator = Orchestrator::initialize(test_config()).unwrap();

    let report = orchestrator.health_check().await;
    assert!(!report.healthy);
    let registry_check = report
        .checks
        .iter()
        .find(|c| c.name == "registry")
        .unwrap();
    assert_eq!(registry_check.status, CheckStatus::Fail);

    orchestrator
        .registry()
        .register_node("w1", vec!["scan".to_string()], 5, "1");
    let report = orchestrator.health_check().await;
    assert!(report.healthy);
}

#[tokio::test]
async fn status_reflects_fleet_and_predefined_workflows() {
    let orchestrator = Orchestrator::initialize(test_config()).unwrap();
    orchestrator
        .registry()
        .register_node("w1", vec!["scan".to_string()], 5, "1");
    orchestrator.ingest(heartbeat_message("w1", 10.0, 0)).await;

    let status = orchestrator.status().await;
    assert_eq!(status.online_nodes, 1);
    assert_eq!(
        status.workflows,
        vec!["node-initialization".to_string(), "task-execution".to_string()]
    );
}

#[tokio::test]
async fn predefined_workflows_execute_with_the_orchestrator_seed() {
    let orchestrator = Orchestrator::initialize(test_config()).unwrap();
    let execution = orchestrator
        .engine()
        .execute("node-initialization", json!({ "node": "w1" }))
        .await
        .unwrap();
    assert_eq!(
        execution.completed_steps,
        vec!["handshake", "announce-capabilities", "first-heartbeat"]
    );
    assert_eq!(execution.seed, orchestrator.seed());
}

#[tokio::test]
async fn derived_seed_is_persisted_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let seed_path = dir.path().join("seed");

    let mut config = test_config();
    config.seed_path = Some(seed_path.clone());
    let first = config.resolve_seed().unwrap();
    assert_eq!(first.len(), 64);

    let mut config = test_config();
    config.seed_path = Some(seed_path);
    let second = config.resolve_seed().unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn explicit_seed_wins_over_persisted_seed() {
    let dir = tempfile::tempdir().unwrap();
    let seed_path = dir.path().join("seed");
    std::fs::write(&seed_path, "b".repeat(64)).unwrap();

    let mut config = test_config();
    config.deterministic_seed = Some("c".repeat(64));
    config.seed_path = Some(seed_path);
    assert_eq!(config.resolve_seed().unwrap(), "c".repeat(64));
}

// --- helpers ---

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        deterministic_seed: Some("a".repeat(64)),
        ..Default::default()
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn heartbeat_message(source: &str, latency: f64, load: u32) -> Message {
    Message::new(
        source,
        "orchestrator",
        MessageType::Heartbeat,
        json!({
            "status": "healthy",
            "load": load,
            "metrics": {
                "latency": latency,
                "throughput": 5.0,
                "errorRate": 0.0,
                "cpu": 20.0,
                "memory": 30.0,
            },
        }),
        5,
        1,
        now() + 30_000,
    )
}

async fn next_of_type(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<Message>,
    msg_type: MessageType,
) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("outbound channel closed");
        if message.msg_type == msg_type {
            return message;
        }
    }
}

fn write_temp(name: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(name)
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}
