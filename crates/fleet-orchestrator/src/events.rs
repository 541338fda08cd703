//! Typed event fan-out between subsystems and external observers.
//!
//! The event surface is a closed tagged union: one variant per observable
//! fact, fanned out over a broadcast channel. Listeners get their own
//! receiver and can never mutate the emitting component.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::monitor::AlertSeverity;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Every event the orchestrator can emit, as a closed set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum OrchestratorEvent {
    TaskCreated { task_id: String, task_type: String },
    TaskQueued { task_id: String, priority: u8 },
    TaskStarted { task_id: String, node_id: String, reason: String },
    TaskProgress { task_id: String, progress: f64 },
    TaskCompleted { task_id: String, node_id: String, duration_ms: u64 },
    TaskFailed { task_id: String, error: String, final_failure: bool },
    TaskRetrying { task_id: String, excluded_node: String, target_node: String },
    TaskCancelled { task_id: String },
    NodeJoined { node_id: String, capabilities: Vec<String> },
    NodeLeft { node_id: String },
    NodeDegraded { node_id: String, silent_for_ms: i64 },
    NodeOffline { node_id: String },
    NodeRecovered { node_id: String },
    PerformanceAlert { node_id: String, severity: AlertSeverity, metric: String, value: f64 },
    RoutingBackpressure { task_id: String, required_tools: Vec<String> },
    RouterNodeOffline { node_id: String, requeued_tasks: usize },
    MessageRejected { message_id: String, reason: String },
    MessageExpired { message_id: String, source: String },
    SystemFailover { node_id: String, metric: String },
    SystemStatus { healthy: bool, detail: String },
}

/// Broadcast bus carrying [`OrchestratorEvent`]s to any number of listeners.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Publishing with no subscribers is not an error; the event is simply
    /// dropped.
    pub fn publish(&self, event: OrchestratorEvent) {
        if self.tx.send(event.clone()).is_err() {
            tracing::trace!(?event, "Event published with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
