//! Authoritative view of the worker fleet.
//!
//! Tracks which workers exist, what they can do, and whether they are
//! alive. Health transitions are driven by heartbeat age from a periodic
//! maintenance scan; selection strategies pick a worker for a task with
//! deterministic tie-breaks.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::events::{EventBus, OrchestratorEvent};
use crate::{hash, now_ms};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);
const LATENCY_EMA_ALPHA: f64 = 0.3;
// Offline nodes are swept from the registry after this many heartbeat
// timeouts of continued silence.
const SWEEP_MULTIPLIER: i64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Online,
    Degraded,
    Offline,
    Recovering,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerNode {
    pub node_id: String,
    pub capabilities: BTreeSet<String>,
    pub max_concurrent_tasks: u32,
    pub current_load: u32,
    pub latency_ms: f64,
    pub last_heartbeat_ms: i64,
    pub status: NodeStatus,
    pub version: String,
}

impl WorkerNode {
    pub fn has_tools(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_concurrent_tasks
    }
}

/// Metrics carried by a worker heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMetrics {
    #[serde(default, rename = "latency")]
    pub latency_ms: f64,
    #[serde(default)]
    pub throughput: f64,
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: f64,
    #[serde(default)]
    pub load: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    LeastLoaded,
    RoundRobin,
    Deterministic,
    CapabilityMatch,
}

pub struct NodeRegistry {
    nodes: DashMap<String, WorkerNode>,
    heartbeat_timeout_ms: i64,
    strategy: SelectionStrategy,
    seed: String,
    events: EventBus,
}

impl NodeRegistry {
    pub fn new(
        heartbeat_timeout_ms: u64,
        strategy: SelectionStrategy,
        seed: String,
        events: EventBus,
    ) -> Self {
        Self {
            nodes: DashMap::new(),
            heartbeat_timeout_ms: heartbeat_timeout_ms as i64,
            strategy,
            seed,
            events,
        }
    }

    /// Register a worker, replacing any existing record for the same id.
    ///
    /// Capability sets are immutable after registration; a capability
    /// change is a re-registration.
    pub fn register_node(
        &self,
        node_id: &str,
        capabilities: impl IntoIterator<Item = String>,
        max_concurrent_tasks: u32,
        version: &str,
    ) {
        let capabilities: BTreeSet<String> = capabilities.into_iter().collect();
        let node = WorkerNode {
            node_id: node_id.to_string(),
            capabilities: capabilities.clone(),
            max_concurrent_tasks,
            current_load: 0,
            latency_ms: 0.0,
            last_heartbeat_ms: now_ms(),
            status: NodeStatus::Online,
            version: version.to_string(),
        };
        let replaced = self.nodes.insert(node_id.to_string(), node).is_some();

        tracing::info!(
            node_id = %node_id,
            capabilities = ?capabilities,
            max_concurrent = %max_concurrent_tasks,
            replaced = %replaced,
            "Node registered"
        );
        self.events.publish(OrchestratorEvent::NodeJoined {
            node_id: node_id.to_string(),
            capabilities: capabilities.into_iter().collect(),
        });
    }

    pub fn unregister_node(&self, node_id: &str) {
        if self.nodes.remove(node_id).is_some() {
            tracing::info!(node_id = %node_id, "Node unregistered");
            self.events.publish(OrchestratorEvent::NodeLeft {
                node_id: node_id.to_string(),
            });
        }
    }

    /// Ingest a heartbeat: refresh liveness, update load and the latency
    /// EMA, and force the node back to ONLINE from any state.
    pub fn handle_heartbeat(&self, node_id: &str, metrics: &HeartbeatMetrics) -> bool {
        let mut node = match self.nodes.get_mut(node_id) {
            Some(n) => n,
            None => {
                tracing::debug!(node_id = %node_id, "Heartbeat from unknown node ignored");
                return false;
            }
        };

        let previous = node.status;
        node.last_heartbeat_ms = now_ms();
        node.current_load = metrics.load.min(node.max_concurrent_tasks);
        node.latency_ms = if node.latency_ms == 0.0 {
            metrics.latency_ms
        } else {
            node.latency_ms * (1.0 - LATENCY_EMA_ALPHA) + metrics.latency_ms * LATENCY_EMA_ALPHA
        };
        node.status = NodeStatus::Online;
        drop(node);

        if matches!(previous, NodeStatus::Offline | NodeStatus::Recovering) {
            tracing::info!(node_id = %node_id, ?previous, "Node recovered");
            self.events.publish(OrchestratorEvent::NodeRecovered {
                node_id: node_id.to_string(),
            });
        }
        true
    }

    pub fn get_node(&self, node_id: &str) -> Option<WorkerNode> {
        self.nodes.get(node_id).map(|n| n.clone())
    }

    pub fn all_nodes(&self) -> Vec<WorkerNode> {
        let mut nodes: Vec<WorkerNode> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn online_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|e| e.value().status == NodeStatus::Online)
            .count()
    }

    /// Single mutation point for router-driven load accounting.
    pub fn apply_load_delta(&self, node_id: &str, delta: i32) {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            let load = node.current_load as i64 + delta as i64;
            node.current_load = load.clamp(0, node.max_concurrent_tasks as i64) as u32;
        }
    }

    /// Pick the best ONLINE worker for a task according to the configured
    /// strategy. Candidates are filtered by tool containment and spare
    /// capacity; all tie-breaks fall through to lexicographic node id.
    pub fn find_best_node(
        &self,
        task_type: &str,
        required_tools: &BTreeSet<String>,
    ) -> Option<String> {
        let candidates = self.candidates(required_tools);
        if candidates.is_empty() {
            return None;
        }

        let selected = match self.strategy {
            SelectionStrategy::LeastLoaded => candidates
                .iter()
                .min_by(|a, b| {
                    a.current_load
                        .cmp(&b.current_load)
                        .then(a.latency_ms.total_cmp(&b.latency_ms))
                        .then(a.node_id.cmp(&b.node_id))
                })
                .map(|n| n.node_id.clone()),
            SelectionStrategy::RoundRobin => {
                let slot = (now_ms() / 1000) as usize % candidates.len();
                Some(candidates[slot].node_id.clone())
            }
            SelectionStrategy::Deterministic => {
                let key = format!("{task_type}{}", self.seed);
                let index = hash::pick_index(&key, candidates.len());
                Some(candidates[index].node_id.clone())
            }
            SelectionStrategy::CapabilityMatch => candidates
                .iter()
                .max_by(|a, b| {
                    headroom_score(a)
                        .total_cmp(&headroom_score(b))
                        // Reversed id ordering so that max_by prefers the
                        // lexicographically smaller id on equal scores.
                        .then(b.node_id.cmp(&a.node_id))
                })
                .map(|n| n.node_id.clone()),
        };

        tracing::debug!(
            task_type = %task_type,
            strategy = ?self.strategy,
            selected = ?selected,
            candidates = %candidates.len(),
            "Node selection"
        );
        selected
    }

    /// ONLINE workers with every required tool and spare capacity, in
    /// lexicographic id order.
    pub fn candidates(&self, required_tools: &BTreeSet<String>) -> Vec<WorkerNode> {
        let mut out: Vec<WorkerNode> = self
            .nodes
            .iter()
            .filter(|e| {
                let n = e.value();
                n.status == NodeStatus::Online && n.has_tools(required_tools) && n.has_capacity()
            })
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }

    /// Move an OFFLINE node into RECOVERING when a capability-compatible
    /// live peer exists; returns the compatible peers.
    pub fn trigger_recovery(&self, node_id: &str) -> Option<Vec<String>> {
        let capabilities = {
            let node = self.nodes.get(node_id)?;
            if node.status != NodeStatus::Offline {
                return None;
            }
            node.capabilities.clone()
        };

        let peers: Vec<String> = self
            .nodes
            .iter()
            .filter(|e| {
                let n = e.value();
                n.node_id != node_id
                    && n.status == NodeStatus::Online
                    && capabilities.is_subset(&n.capabilities)
            })
            .map(|e| e.key().clone())
            .collect();

        if peers.is_empty() {
            return None;
        }

        if let Some(mut node) = self.nodes.get_mut(node_id) {
            node.status = NodeStatus::Recovering;
        }
        tracing::info!(node_id = %node_id, peers = ?peers, "Recovery triggered");
        Some(peers)
    }

    /// Spawn the periodic maintenance scan that drives health transitions.
    pub fn start_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => registry.run_maintenance(),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::debug!("Registry maintenance loop stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One maintenance pass over the fleet. Exposed for tests; the spawned
    /// loop calls this every five seconds.
    pub fn run_maintenance(&self) {
        let now = now_ms();
        let timeout = self.heartbeat_timeout_ms;
        let mut went_offline = Vec::new();
        let mut went_degraded = Vec::new();
        let mut swept = Vec::new();

        for mut entry in self.nodes.iter_mut() {
            let silent_for = now - entry.last_heartbeat_ms;
            match entry.status {
                NodeStatus::Online if silent_for > timeout => {
                    entry.status = NodeStatus::Degraded;
                    went_degraded.push((entry.node_id.clone(), silent_for));
                }
                NodeStatus::Degraded if silent_for > 2 * timeout => {
                    entry.status = NodeStatus::Offline;
                    went_offline.push(entry.node_id.clone());
                }
                NodeStatus::Recovering if silent_for > timeout => {
                    // No heartbeat arrived since recovery was triggered.
                    entry.status = NodeStatus::Offline;
                    tracing::debug!(node_id = %entry.node_id, "Recovery lapsed, node back offline");
                }
                NodeStatus::Offline if silent_for > SWEEP_MULTIPLIER * timeout => {
                    swept.push(entry.node_id.clone());
                }
                _ => {}
            }
        }

        for (node_id, silent_for) in went_degraded {
            tracing::warn!(node_id = %node_id, silent_for_ms = %silent_for, "Node degraded");
            self.events.publish(OrchestratorEvent::NodeDegraded {
                node_id,
                silent_for_ms: silent_for,
            });
        }
        for node_id in went_offline {
            tracing::warn!(node_id = %node_id, "Node offline");
            self.events.publish(OrchestratorEvent::NodeOffline { node_id });
        }
        for node_id in swept {
            self.nodes.remove(&node_id);
            tracing::info!(node_id = %node_id, "Prolonged offline node swept from registry");
            self.events.publish(OrchestratorEvent::NodeLeft { node_id });
        }
    }
}

/// Spare capacity weighted against observed latency; higher is better.
fn headroom_score(node: &WorkerNode) -> f64 {
    (node.max_concurrent_tasks - node.current_load) as f64 * 100.0 - node.latency_ms
}
