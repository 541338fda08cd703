//! Composition root.
//!
//! Owns the lifecycles of every subsystem, wires message handlers and
//! event listeners, loads the startup catalogs, and exposes the operator
//! surface: submit, status, and health.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{NodeCatalog, OrchestratorConfig, WorkflowCatalog};
use crate::events::{EventBus, OrchestratorEvent};
use crate::monitor::{AlertThresholds, FleetSummary, PerformanceMonitor, PerformanceSample};
use crate::protocol::{
    Message, MessageHandler, MessageProtocol, MessageType, ProtocolConfig, BROADCAST,
};
use crate::registry::{HeartbeatMetrics, NodeRegistry, NodeStatus};
use crate::router::{RouterConfig, RouterStats, TaskRouter, TaskSpec, TaskStatus};
use crate::store::{InMemoryTaskStore, StoreStats, TaskStore};
use crate::workflow::{
    node_initialization_workflow, task_execution_workflow, StepHandler, WorkflowEngine,
};
use crate::{now_ms, OrchestratorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub checks: Vec<ComponentCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub router: RouterStats,
    pub fleet: FleetSummary,
    pub store: StoreStats,
    pub online_nodes: usize,
    pub workflows: Vec<String>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    seed: String,
    events: EventBus,
    registry: Arc<NodeRegistry>,
    monitor: Arc<PerformanceMonitor>,
    protocol: Arc<MessageProtocol>,
    engine: Arc<WorkflowEngine>,
    router: Arc<TaskRouter>,
    store: Arc<dyn TaskStore>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build and wire every subsystem with the in-memory store.
    pub fn initialize(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        Self::initialize_with_store(config, Arc::new(InMemoryTaskStore::new()))
    }

    /// Build and wire every subsystem against an explicit persistence
    /// implementation.
    pub fn initialize_with_store(
        config: OrchestratorConfig,
        store: Arc<dyn TaskStore>,
    ) -> Result<Self, OrchestratorError> {
        let seed = config.resolve_seed()?;
        let events = EventBus::new();

        let monitor = Arc::new(PerformanceMonitor::new(
            AlertThresholds {
                cpu_warning: config.alert_cpu_warning,
                cpu_critical: config.alert_cpu_critical,
                memory_warning: config.alert_memory_warning,
                memory_critical: config.alert_memory_critical,
                ..Default::default()
            },
            events.clone(),
        ));
        let registry = Arc::new(NodeRegistry::new(
            config.heartbeat_timeout_ms,
            config.selection_strategy,
            seed.clone(),
            events.clone(),
        ));
        let (protocol, outbound_rx) = MessageProtocol::new(
            &config.node_id,
            ProtocolConfig {
                message_timeout_ms: config.message_timeout_ms,
                max_retries: config.max_retries,
                compression_threshold: config.compression_threshold,
                enable_compression: config.enable_compression,
                batch_size: config.batch_size,
            },
            events.clone(),
        );
        let router = TaskRouter::new(
            Arc::clone(&registry),
            Arc::clone(&monitor),
            Arc::clone(&protocol),
            Arc::clone(&store),
            events.clone(),
            RouterConfig {
                max_concurrent_per_node: config.max_concurrent_per_node,
                default_timeout_ms: config.task_timeout_ms,
                tick_interval_ms: 1000,
                seed: seed.clone(),
            },
        );

        let engine = Arc::new(WorkflowEngine::new());
        let control = Arc::new(ControlStepHandler);
        for action in [
            "handshake",
            "announce-capabilities",
            "first-heartbeat",
            "validate-task",
            "route-task",
            "dispatch-task",
            "collect-result",
        ] {
            engine.register_handler(action, control.clone());
        }
        engine.register_workflow(node_initialization_workflow(&seed))?;
        engine.register_workflow(task_execution_workflow(&seed))?;

        let (shutdown, _) = watch::channel(false);
        let orchestrator = Self {
            config,
            seed,
            events,
            registry,
            monitor,
            protocol,
            engine,
            router,
            store,
            outbound: Mutex::new(Some(outbound_rx)),
            shutdown,
            handles: Mutex::new(Vec::new()),
        };
        orchestrator.wire_handlers();
        Ok(orchestrator)
    }

    /// Register every worker declared in the catalogs, applying constraint
    /// overrides from the workflow catalog.
    pub fn load_catalogs(&self, nodes: &NodeCatalog, workflows: &WorkflowCatalog) {
        for entry in &nodes.nodes {
            let mut capabilities = entry.capabilities.clone();
            if let Some(tools) = workflows.node_tools.get(&entry.name) {
                for tool in tools {
                    if !capabilities.contains(tool) {
                        capabilities.push(tool.clone());
                    }
                }
            }
            let max_concurrent = workflows.max_concurrent_for(&entry.name, entry.max_concurrent);
            self.registry
                .register_node(&entry.name, capabilities, max_concurrent, "1");
        }
        tracing::info!(nodes = %nodes.nodes.len(), "Node catalog loaded");
    }

    fn wire_handlers(&self) {
        self.protocol.register_handler(
            MessageType::Heartbeat,
            Arc::new(HeartbeatHandler {
                registry: Arc::clone(&self.registry),
                monitor: Arc::clone(&self.monitor),
            }),
        );
        self.protocol.register_handler(
            MessageType::TaskComplete,
            Arc::new(TaskOutcomeHandler {
                router: Arc::clone(&self.router),
                failure: false,
            }),
        );
        self.protocol.register_handler(
            MessageType::TaskFail,
            Arc::new(TaskOutcomeHandler {
                router: Arc::clone(&self.router),
                failure: true,
            }),
        );
        self.protocol.register_handler(
            MessageType::TaskProgress,
            Arc::new(TaskProgressHandler {
                router: Arc::clone(&self.router),
            }),
        );
        self.protocol.register_handler(
            MessageType::RecoveryRequest,
            Arc::new(RecoveryRequestHandler {
                registry: Arc::clone(&self.registry),
            }),
        );
        self.protocol.register_handler(
            MessageType::Disconnect,
            Arc::new(DisconnectHandler {
                registry: Arc::clone(&self.registry),
                router: Arc::clone(&self.router),
            }),
        );
        self.protocol
            .register_handler(MessageType::LatencyProbe, Arc::new(LatencyProbeHandler));
    }

    /// Spawn the background loops: registry maintenance, router ticks, the
    /// event pump, and the periodic status beacon.
    pub fn start(&self) {
        let shutdown_rx = self.shutdown.subscribe();
        let mut handles = self.handles.lock();
        handles.push(Arc::clone(&self.registry).start_maintenance(shutdown_rx.clone()));
        handles.push(Arc::clone(&self.router).start(shutdown_rx.clone()));
        handles.push(self.spawn_event_pump(shutdown_rx.clone()));
        handles.push(self.spawn_status_beacon(shutdown_rx));
        tracing::info!(seed = %self.seed, "Orchestrator started");
    }

    /// Stop the background loops and wait for them to exit.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("Orchestrator stopped");
    }

    /// Reacts to registry and monitor events: offline workers trigger
    /// requeue and recovery, fresh joins are broadcast to the fleet.
    fn spawn_event_pump(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut rx = self.events.subscribe();
        let router = Arc::clone(&self.router);
        let registry = Arc::clone(&self.registry);
        let protocol = Arc::clone(&self.protocol);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(OrchestratorEvent::NodeOffline { node_id }) => {
                            router.handle_node_offline(&node_id).await;
                            if let Some(peers) = registry.trigger_recovery(&node_id) {
                                let notice = protocol.create_message(
                                    &node_id,
                                    MessageType::RecoveryResponse,
                                    json!({ "availableNodes": peers }),
                                    5,
                                );
                                let _ = protocol.notify(notice);
                            }
                        }
                        Ok(OrchestratorEvent::NodeJoined { node_id, capabilities }) => {
                            let update = protocol.create_message(
                                BROADCAST,
                                MessageType::CapabilityUpdate,
                                json!({ "nodeId": node_id, "capabilities": capabilities }),
                                5,
                            );
                            let _ = protocol.notify(update);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed = %missed, "Event pump lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_status_beacon(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let events = self.events.clone();
        let registry = Arc::clone(&self.registry);
        let interval_ms = self.config.monitoring_interval_ms;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1000)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let online = registry.online_count();
                        events.publish(OrchestratorEvent::SystemStatus {
                            healthy: online > 0,
                            detail: format!("{online} workers online"),
                        });
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub async fn submit_task(&self, spec: TaskSpec) -> Result<String, OrchestratorError> {
        self.router.submit(spec).await
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.router.task_status(task_id)
    }

    pub async fn status(&self) -> SystemStatus {
        SystemStatus {
            router: self.router.stats(),
            fleet: self.monitor.summary(),
            store: self.store.get_stats().await.unwrap_or_default(),
            online_nodes: self.registry.online_count(),
            workflows: self.engine.workflow_ids(),
        }
    }

    /// Component-level health. Unreachable persistence degrades to a warn;
    /// only hard component failures make the report unhealthy.
    pub async fn health_check(&self) -> HealthReport {
        let mut checks = Vec::new();

        let online = self.registry.online_count();
        let total = self.registry.all_nodes().len();
        checks.push(ComponentCheck {
            name: "registry".to_string(),
            status: if online > 0 {
                CheckStatus::Pass
            } else if total > 0 {
                CheckStatus::Warn
            } else {
                CheckStatus::Fail
            },
            detail: format!("{online}/{total} nodes online"),
        });

        let stats = self.router.stats();
        checks.push(ComponentCheck {
            name: "router".to_string(),
            status: if stats.queued > 100 {
                CheckStatus::Warn
            } else {
                CheckStatus::Pass
            },
            detail: format!("{} queued, {} active", stats.queued, stats.active),
        });

        let pending = self.protocol.pending_count();
        checks.push(ComponentCheck {
            name: "protocol".to_string(),
            status: if pending > 1000 {
                CheckStatus::Warn
            } else {
                CheckStatus::Pass
            },
            detail: format!("{pending} pending sends"),
        });

        checks.push(match self.store.get_stats().await {
            Ok(stats) => ComponentCheck {
                name: "persistence".to_string(),
                status: CheckStatus::Pass,
                detail: format!("{} tasks persisted", stats.total),
            },
            Err(e) => ComponentCheck {
                name: "persistence".to_string(),
                status: CheckStatus::Warn,
                detail: format!("unreachable: {e}"),
            },
        });

        let healthy = checks.iter().all(|c| c.status != CheckStatus::Fail);
        HealthReport { healthy, checks }
    }

    /// Take the outbound wire; whatever owns the transport drains this
    /// receiver and delivers each message to its target worker.
    pub fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.outbound.lock().take()
    }

    /// Deliver an inbound message from the transport.
    pub async fn ingest(&self, message: Message) -> bool {
        self.protocol.receive(message).await
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn router(&self) -> &Arc<TaskRouter> {
        &self.router
    }

    pub fn protocol(&self) -> &Arc<MessageProtocol> {
        &self.protocol
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }
}

/// Heartbeats refresh the registry and feed the performance monitor.
struct HeartbeatHandler {
    registry: Arc<NodeRegistry>,
    monitor: Arc<PerformanceMonitor>,
}

#[async_trait]
impl MessageHandler for HeartbeatHandler {
    async fn handle(&self, message: &Message) -> Result<Option<Value>, OrchestratorError> {
        let mut metrics: HeartbeatMetrics = message
            .payload
            .get("metrics")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| OrchestratorError::InvalidMessage(e.to_string()))?
            .unwrap_or_default();
        // Load rides beside the metrics block on the wire.
        if let Some(load) = message.payload.get("load").and_then(Value::as_u64) {
            metrics.load = load as u32;
        }

        if !self.registry.handle_heartbeat(&message.source, &metrics) {
            return Ok(None);
        }
        self.monitor.record(
            &message.source,
            PerformanceSample {
                timestamp_ms: message.timestamp_ms,
                cpu: metrics.cpu,
                memory: metrics.memory,
                latency_ms: metrics.latency_ms,
                error_rate: metrics.error_rate,
                throughput: metrics.throughput,
            },
        );
        Ok(None)
    }
}

/// TASK_COMPLETE and TASK_FAIL both finalize through the router.
struct TaskOutcomeHandler {
    router: Arc<TaskRouter>,
    failure: bool,
}

#[async_trait]
impl MessageHandler for TaskOutcomeHandler {
    async fn handle(&self, message: &Message) -> Result<Option<Value>, OrchestratorError> {
        let task_id = message
            .payload
            .get("taskId")
            .and_then(Value::as_str)
            .ok_or_else(|| OrchestratorError::InvalidMessage("missing taskId".to_string()))?;

        if self.failure {
            let error = message
                .payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("worker reported failure");
            self.router.handle_failure(task_id, error).await;
        } else {
            let result = message.payload.get("result").cloned().unwrap_or(Value::Null);
            self.router
                .handle_completion(task_id, &message.source, result)
                .await;
        }
        Ok(None)
    }
}

struct TaskProgressHandler {
    router: Arc<TaskRouter>,
}

#[async_trait]
impl MessageHandler for TaskProgressHandler {
    async fn handle(&self, message: &Message) -> Result<Option<Value>, OrchestratorError> {
        let task_id = message
            .payload
            .get("taskId")
            .and_then(Value::as_str)
            .ok_or_else(|| OrchestratorError::InvalidMessage("missing taskId".to_string()))?;
        let progress = message
            .payload
            .get("progress")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        self.router.handle_progress(task_id, progress).await;
        Ok(None)
    }
}

/// A struggling worker asks where its load could go; the reply lists the
/// live peers.
struct RecoveryRequestHandler {
    registry: Arc<NodeRegistry>,
}

#[async_trait]
impl MessageHandler for RecoveryRequestHandler {
    async fn handle(&self, message: &Message) -> Result<Option<Value>, OrchestratorError> {
        let peers: Vec<String> = self
            .registry
            .all_nodes()
            .into_iter()
            .filter(|n| n.status == NodeStatus::Online && n.node_id != message.source)
            .map(|n| n.node_id)
            .collect();
        Ok(Some(json!({ "availableNodes": peers })))
    }
}

/// A graceful goodbye removes the worker immediately instead of waiting
/// for the health machine to notice the silence. Anything it was running
/// goes back to the queue first.
struct DisconnectHandler {
    registry: Arc<NodeRegistry>,
    router: Arc<TaskRouter>,
}

#[async_trait]
impl MessageHandler for DisconnectHandler {
    async fn handle(&self, message: &Message) -> Result<Option<Value>, OrchestratorError> {
        self.router.handle_node_offline(&message.source).await;
        self.registry.unregister_node(&message.source);
        Ok(None)
    }
}

struct LatencyProbeHandler;

#[async_trait]
impl MessageHandler for LatencyProbeHandler {
    async fn handle(&self, message: &Message) -> Result<Option<Value>, OrchestratorError> {
        Ok(Some(json!({
            "probeId": message.payload.get("probeId").cloned().unwrap_or(Value::Null),
            "echoTimestamp": message.timestamp_ms,
            "respondedAt": now_ms(),
        })))
    }
}

/// Built-in handler backing the predefined control workflows.
struct ControlStepHandler;

#[async_trait]
impl StepHandler for ControlStepHandler {
    async fn execute(
        &self,
        action: &str,
        params: &Map<String, Value>,
        _context: &Value,
    ) -> Result<Value, OrchestratorError> {
        Ok(json!({ "action": action, "params": params, "status": "ok" }))
    }
}
