//! Priority task routing.
//!
//! Tasks enter an in-memory submission map and are routed each tick (or
//! immediately for high-priority arrivals) to the best-scoring live worker.
//! Scores blend load, observed latency, performance trend, and error rate;
//! deterministic tasks bypass the ranking and hash onto the sorted
//! candidate list so identical inputs land on the same worker. Failed
//! deterministic tasks are re-routed to a hashed alternative; workers going
//! offline get their assignments requeued.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::events::{EventBus, OrchestratorEvent};
use crate::monitor::{MetricField, PerformanceMonitor, Trend};
use crate::protocol::{MessageProtocol, MessageType};
use crate::registry::NodeRegistry;
use crate::store::TaskStore;
use crate::{hash, now_ms, OrchestratorError};

const COMPLETION_HISTORY: usize = 1000;
const MAX_PRIORITY: u8 = 10;
const IMMEDIATE_PRIORITY: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Active => "active",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Submission-side task description; the router derives the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub task_type: String,
    pub name: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub required_tools: BTreeSet<String>,
    #[serde(default)]
    pub target_node: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub deterministic: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub name: String,
    pub payload: Value,
    pub priority: u8,
    pub required_tools: BTreeSet<String>,
    pub target_node: Option<String>,
    pub timeout_ms: u64,
    pub deterministic: bool,
    pub submitted_at_ms: i64,
}

/// The router's record that a worker currently executes a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub task_id: String,
    pub node_id: String,
    pub started_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub node_id: String,
    pub reason: String,
    pub score: f64,
    pub alternatives: Vec<String>,
}

#[derive(Debug, Clone)]
struct TaskRecord {
    task: Task,
    state: TaskState,
    sequence: u64,
    result: Option<Value>,
    error: Option<String>,
    // Worker excluded after a deterministic failure. The replacement is
    // re-derived over the admissible candidates at assignment time rather
    // than cached, so a per-node cap reached in the meantime is honored.
    excluded_node: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompletionRecord {
    task_id: String,
    node_id: String,
    success: bool,
    duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterStats {
    pub submitted: usize,
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub active_per_node: HashMap<String, usize>,
    pub average_duration_ms: f64,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_concurrent_per_node: u32,
    pub default_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub seed: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_node: 5,
            default_timeout_ms: 300_000,
            tick_interval_ms: 1000,
            seed: String::new(),
        }
    }
}

pub struct TaskRouter {
    registry: Arc<NodeRegistry>,
    monitor: Arc<PerformanceMonitor>,
    protocol: Arc<MessageProtocol>,
    store: Arc<dyn TaskStore>,
    events: EventBus,
    config: RouterConfig,
    tasks: DashMap<String, TaskRecord>,
    assignments: DashMap<String, Assignment>,
    completions: RwLock<VecDeque<CompletionRecord>>,
    sequence: AtomicU64,
    kick: Notify,
    // Lets detached timeout timers reach back into the router without
    // keeping it alive.
    weak_self: Weak<TaskRouter>,
}

impl TaskRouter {
    pub fn new(
        registry: Arc<NodeRegistry>,
        monitor: Arc<PerformanceMonitor>,
        protocol: Arc<MessageProtocol>,
        store: Arc<dyn TaskStore>,
        events: EventBus,
        config: RouterConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            registry,
            monitor,
            protocol,
            store,
            events,
            config,
            tasks: DashMap::new(),
            assignments: DashMap::new(),
            completions: RwLock::new(VecDeque::new()),
            sequence: AtomicU64::new(0),
            kick: Notify::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// Submit a task, deriving its id from the identifying tuple and the
    /// current epoch. Persistence failure on the initial save surfaces to
    /// the caller.
    pub async fn submit(&self, spec: TaskSpec) -> Result<String, OrchestratorError> {
        self.submit_at(spec, now_ms()).await
    }

    /// Submit with an explicit submission epoch; identical inputs yield the
    /// same task id.
    pub async fn submit_at(
        &self,
        spec: TaskSpec,
        epoch_ms: i64,
    ) -> Result<String, OrchestratorError> {
        let task = Task {
            id: hash::task_id(&spec.task_type, &spec.name, epoch_ms),
            task_type: spec.task_type,
            name: spec.name,
            payload: spec.payload,
            priority: spec.priority.min(MAX_PRIORITY),
            required_tools: spec.required_tools,
            target_node: spec.target_node,
            timeout_ms: spec.timeout_ms.unwrap_or(self.config.default_timeout_ms),
            deterministic: spec.deterministic,
            submitted_at_ms: epoch_ms,
        };
        let task_id = task.id.clone();

        self.store.save(&task).await?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let priority = task.priority;
        let task_type = task.task_type.clone();
        self.tasks.insert(
            task_id.clone(),
            TaskRecord {
                task,
                state: TaskState::Queued,
                sequence,
                result: None,
                error: None,
                excluded_node: None,
            },
        );

        tracing::info!(
            task_id = %task_id,
            task_type = %task_type,
            priority = %priority,
            "Task submitted"
        );
        self.events.publish(OrchestratorEvent::TaskCreated {
            task_id: task_id.clone(),
            task_type,
        });
        self.events.publish(OrchestratorEvent::TaskQueued {
            task_id: task_id.clone(),
            priority,
        });

        if priority >= IMMEDIATE_PRIORITY {
            self.kick.notify_one();
        }
        Ok(task_id)
    }

    /// Spawn the processing loop: a periodic tick plus an immediate kick
    /// for high-priority submissions.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let router = self;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(router.config.tick_interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => router.process_pending().await,
                    _ = router.kick.notified() => router.process_pending().await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::debug!("Router processing loop stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One routing pass: pending tasks in descending priority (FIFO within
    /// a priority), stopping the tick on the first backpressure so
    /// lower-priority tasks cannot starve a blocked higher one of its slot.
    pub async fn process_pending(&self) {
        let mut pending: Vec<(String, u8, u64)> = self
            .tasks
            .iter()
            .filter(|e| e.value().state == TaskState::Queued)
            .map(|e| (e.key().clone(), e.value().task.priority, e.value().sequence))
            .collect();
        pending.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        for (task_id, _, _) in pending {
            let (task, excluded) = match self.tasks.get(&task_id) {
                Some(record) if record.state == TaskState::Queued => {
                    (record.task.clone(), record.excluded_node.clone())
                }
                _ => continue,
            };
            match self.route(&task, excluded.as_deref()) {
                Some(decision) => self.assign(task, decision).await,
                None => {
                    tracing::debug!(
                        task_id = %task_id,
                        required_tools = ?task.required_tools,
                        "No admissible worker, backpressure"
                    );
                    self.events.publish(OrchestratorEvent::RoutingBackpressure {
                        task_id,
                        required_tools: task.required_tools.iter().cloned().collect(),
                    });
                    break;
                }
            }
        }
    }

    /// Pick a worker for a task, or `None` when no admissible worker
    /// exists.
    fn route(&self, task: &Task, exclude: Option<&str>) -> Option<RoutingDecision> {
        // Operator-targeted tasks go to their target whenever it is alive.
        // Only the submitter sets `target_node`; retry replacements are
        // re-derived below so they never bypass the per-node cap.
        if let Some(target) = &task.target_node {
            if exclude != Some(target.as_str()) {
                if let Some(node) = self.registry.get_node(target) {
                    if node.status == crate::registry::NodeStatus::Online {
                        return Some(RoutingDecision {
                            node_id: target.clone(),
                            reason: "targeted".to_string(),
                            score: 0.0,
                            alternatives: Vec::new(),
                        });
                    }
                }
            }
        }

        let candidates = self.admissible_candidates(&task.required_tools, exclude);
        if candidates.is_empty() {
            return None;
        }

        let mut scored: Vec<(String, f64)> = candidates
            .iter()
            .map(|c| (c.clone(), self.score(c)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        if task.deterministic {
            let index = hash::pick_index(&format!("{}{}", task.id, task.task_type), candidates.len());
            let node_id = candidates[index].clone();
            let score = scored
                .iter()
                .find(|(id, _)| *id == node_id)
                .map(|(_, s)| *s)
                .unwrap_or(0.0);
            let alternatives = scored
                .iter()
                .filter(|(id, _)| *id != node_id)
                .take(3)
                .map(|(id, _)| id.clone())
                .collect();
            return Some(RoutingDecision {
                node_id,
                reason: "deterministic".to_string(),
                score,
                alternatives,
            });
        }

        let (node_id, score) = scored[0].clone();
        let alternatives = scored
            .iter()
            .skip(1)
            .take(3)
            .map(|(id, _)| id.clone())
            .collect();
        Some(RoutingDecision {
            node_id,
            reason: "best-score".to_string(),
            score,
            alternatives,
        })
    }

    /// ONLINE workers with the required tools, spare registry capacity, and
    /// fewer router-held assignments than the per-node cap, sorted by id.
    fn admissible_candidates(
        &self,
        required_tools: &BTreeSet<String>,
        exclude: Option<&str>,
    ) -> Vec<String> {
        self.registry
            .candidates(required_tools)
            .into_iter()
            .filter(|n| Some(n.node_id.as_str()) != exclude)
            .filter(|n| self.active_on(&n.node_id) < self.config.max_concurrent_per_node as usize)
            .map(|n| n.node_id)
            .collect()
    }

    /// Lower is better: load against the per-node cap, observed latency,
    /// latency trend, and recent error rate.
    fn score(&self, node_id: &str) -> f64 {
        let node = match self.registry.get_node(node_id) {
            Some(n) => n,
            None => return f64::MAX,
        };
        let load_factor =
            node.current_load as f64 / self.config.max_concurrent_per_node.max(1) as f64;
        let mut score = load_factor * 50.0 + node.latency_ms * 0.1;

        match self.monitor.trend(node_id, MetricField::Latency) {
            Trend::Degrading => score += 20.0,
            Trend::Improving => score -= 10.0,
            Trend::Stable => {}
        }
        if let Some(sample) = self.monitor.latest(node_id) {
            if sample.error_rate > 1.0 {
                score += sample.error_rate * 5.0;
            }
        }
        score
    }

    fn active_on(&self, node_id: &str) -> usize {
        self.assignments
            .iter()
            .filter(|e| e.value().node_id == node_id)
            .count()
    }

    async fn assign(&self, task: Task, decision: RoutingDecision) {
        let task_id = task.id.clone();
        let node_id = decision.node_id.clone();
        let started_at_ms = now_ms();

        if let Some(mut record) = self.tasks.get_mut(&task_id) {
            record.state = TaskState::Active;
        }
        self.assignments.insert(
            task_id.clone(),
            Assignment {
                task_id: task_id.clone(),
                node_id: node_id.clone(),
                started_at_ms,
            },
        );
        self.registry.apply_load_delta(&node_id, 1);

        persist_best_effort(&task_id, "start", || self.store.mark_started(&task_id)).await;

        tracing::info!(
            task_id = %task_id,
            node_id = %node_id,
            reason = %decision.reason,
            score = %decision.score,
            "Task assigned"
        );
        self.events.publish(OrchestratorEvent::TaskStarted {
            task_id: task_id.clone(),
            node_id: node_id.clone(),
            reason: decision.reason.clone(),
        });

        let mut message = self.protocol.create_message(
            &node_id,
            MessageType::TaskAssign,
            json!({ "task": &task, "routing_decision": decision }),
            task.priority,
        );
        // ttl is not part of the checksum basis, so adjusting it after
        // creation keeps the message valid.
        message.ttl_ms = started_at_ms + task.timeout_ms as i64;
        if let Err(e) = self.protocol.notify(message) {
            tracing::warn!(task_id = %task_id, error = %e, "Assignment dispatch failed");
        }

        self.spawn_timeout(task_id, started_at_ms, task.timeout_ms);
    }

    fn spawn_timeout(&self, task_id: String, started_at_ms: i64, timeout_ms: u64) {
        let router = match self.weak_self.upgrade() {
            Some(router) => router,
            None => return,
        };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            let still_active = router
                .assignments
                .get(&task_id)
                .map(|a| a.started_at_ms == started_at_ms)
                .unwrap_or(false);
            if still_active {
                router.handle_failure(&task_id, "Task timeout").await;
            }
        });
    }

    /// Completion from a worker. Replies from a worker that no longer holds
    /// the assignment (or for a cancelled task) are discarded.
    pub async fn handle_completion(&self, task_id: &str, node_id: &str, result: Value) {
        let assignment = match self.assignments.get(task_id) {
            Some(a) if a.node_id == node_id => a.clone(),
            Some(_) | None => {
                tracing::debug!(
                    task_id = %task_id,
                    node_id = %node_id,
                    "Discarding completion without matching assignment"
                );
                return;
            }
        };
        self.assignments.remove(task_id);

        let duration_ms = (now_ms() - assignment.started_at_ms).max(0) as u64;
        if let Some(mut record) = self.tasks.get_mut(task_id) {
            if record.state == TaskState::Cancelled {
                tracing::debug!(task_id = %task_id, "Result for cancelled task discarded");
                self.registry.apply_load_delta(node_id, -1);
                return;
            }
            record.state = TaskState::Completed;
            record.result = Some(result.clone());
        }
        self.registry.apply_load_delta(node_id, -1);
        self.record_completion(task_id, node_id, true, duration_ms);

        tracing::info!(
            task_id = %task_id,
            node_id = %node_id,
            duration_ms = %duration_ms,
            "Task completed"
        );
        self.events.publish(OrchestratorEvent::TaskCompleted {
            task_id: task_id.to_string(),
            node_id: node_id.to_string(),
            duration_ms,
        });
        persist_best_effort(task_id, "completion", || {
            self.store.mark_completed(task_id, &result)
        })
        .await;
    }

    /// Failure from a worker or a timeout. Deterministic tasks requeue
    /// with the failing worker excluded, and the hashed alternative is
    /// re-derived over the admissible candidates when the assignment is
    /// actually made; everything else fails final at this layer.
    pub async fn handle_failure(&self, task_id: &str, error: &str) {
        let assignment = match self.assignments.remove(task_id) {
            Some((_, a)) => a,
            None => return,
        };
        self.registry.apply_load_delta(&assignment.node_id, -1);

        let task = match self.tasks.get(task_id) {
            Some(record) => record.task.clone(),
            None => return,
        };
        let duration_ms = (now_ms() - assignment.started_at_ms).max(0) as u64;
        self.record_completion(task_id, &assignment.node_id, false, duration_ms);

        tracing::warn!(
            task_id = %task_id,
            node_id = %assignment.node_id,
            error = %error,
            deterministic = %task.deterministic,
            "Task failed on worker"
        );

        if task.deterministic {
            // The decision made here only establishes that an admissible
            // alternative exists; the pick is repeated at assignment time
            // so a cap filled in the meantime is still honored.
            if let Some(decision) = self.route(&task, Some(&assignment.node_id)) {
                if let Some(mut record) = self.tasks.get_mut(task_id) {
                    record.excluded_node = Some(assignment.node_id.clone());
                    record.state = TaskState::Queued;
                }
                self.events.publish(OrchestratorEvent::TaskRetrying {
                    task_id: task_id.to_string(),
                    excluded_node: assignment.node_id.clone(),
                    target_node: decision.node_id,
                });
                self.kick.notify_one();
                return;
            }
        }

        if let Some(mut record) = self.tasks.get_mut(task_id) {
            record.state = TaskState::Failed;
            record.error = Some(error.to_string());
        }
        self.events.publish(OrchestratorEvent::TaskFailed {
            task_id: task_id.to_string(),
            error: error.to_string(),
            final_failure: true,
        });
        persist_best_effort(task_id, "failure", || self.store.mark_failed(task_id, error)).await;
    }

    pub async fn handle_progress(&self, task_id: &str, progress: f64) {
        self.events.publish(OrchestratorEvent::TaskProgress {
            task_id: task_id.to_string(),
            progress,
        });
        persist_best_effort(task_id, "progress", || {
            self.store.update_progress(task_id, progress)
        })
        .await;
    }

    /// All assignments held by an offline worker return to the queue at
    /// their original priority.
    pub async fn handle_node_offline(&self, node_id: &str) {
        let affected: Vec<String> = self
            .assignments
            .iter()
            .filter(|e| e.value().node_id == node_id)
            .map(|e| e.key().clone())
            .collect();

        for task_id in &affected {
            self.assignments.remove(task_id);
            self.registry.apply_load_delta(node_id, -1);
            if let Some(mut record) = self.tasks.get_mut(task_id) {
                record.state = TaskState::Queued;
            }
        }

        tracing::warn!(
            node_id = %node_id,
            requeued = %affected.len(),
            "Worker offline, assignments requeued"
        );
        self.events.publish(OrchestratorEvent::RouterNodeOffline {
            node_id: node_id.to_string(),
            requeued_tasks: affected.len(),
        });
        if !affected.is_empty() {
            self.kick.notify_one();
        }
    }

    /// Cancel a task. Cancellation is terminal; an active worker gets a
    /// best-effort rejection notice and any late result is discarded.
    pub async fn cancel(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let record_state = self
            .tasks
            .get(task_id)
            .map(|r| r.state)
            .ok_or_else(|| OrchestratorError::UnknownTask(task_id.to_string()))?;
        if record_state.is_terminal() {
            return Ok(());
        }

        if let Some((_, assignment)) = self.assignments.remove(task_id) {
            self.registry.apply_load_delta(&assignment.node_id, -1);
            let notice = self.protocol.create_message(
                &assignment.node_id,
                MessageType::TaskReject,
                json!({ "taskId": task_id, "reason": "cancelled" }),
                0,
            );
            if let Err(e) = self.protocol.notify(notice) {
                tracing::debug!(task_id = %task_id, error = %e, "Cancellation notice dropped");
            }
        }

        if let Some(mut record) = self.tasks.get_mut(task_id) {
            record.state = TaskState::Cancelled;
        }
        self.events.publish(OrchestratorEvent::TaskCancelled {
            task_id: task_id.to_string(),
        });
        persist_best_effort(task_id, "cancellation", || {
            self.store.update_status(task_id, TaskState::Cancelled)
        })
        .await;
        Ok(())
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks.get(task_id).map(|record| TaskStatus {
            task_id: task_id.to_string(),
            state: record.state,
            result: record.result.clone(),
            error: record.error.clone(),
        })
    }

    pub fn assignment_of(&self, task_id: &str) -> Option<Assignment> {
        self.assignments.get(task_id).map(|a| a.clone())
    }

    pub fn stats(&self) -> RouterStats {
        let mut stats = RouterStats {
            submitted: self.tasks.len(),
            ..Default::default()
        };
        for record in self.tasks.iter() {
            match record.state {
                TaskState::Queued => stats.queued += 1,
                TaskState::Active => stats.active += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::Failed => stats.failed += 1,
                TaskState::Cancelled => stats.cancelled += 1,
            }
        }
        for assignment in self.assignments.iter() {
            *stats
                .active_per_node
                .entry(assignment.node_id.clone())
                .or_insert(0) += 1;
        }
        let completions = self.completions.read();
        if !completions.is_empty() {
            stats.average_duration_ms = completions
                .iter()
                .map(|c| c.duration_ms as f64)
                .sum::<f64>()
                / completions.len() as f64;
        }
        stats
    }

    fn record_completion(&self, task_id: &str, node_id: &str, success: bool, duration_ms: u64) {
        let mut completions = self.completions.write();
        completions.push_back(CompletionRecord {
            task_id: task_id.to_string(),
            node_id: node_id.to_string(),
            success,
            duration_ms,
        });
        if completions.len() > COMPLETION_HISTORY {
            completions.pop_front();
        }
    }
}

/// State-update persistence is retried once in-process and then logged;
/// only the initial save surfaces to the submit caller.
async fn persist_best_effort<F, Fut>(task_id: &str, what: &str, attempt: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), OrchestratorError>>,
{
    if let Err(first) = attempt().await {
        tracing::warn!(task_id = %task_id, error = %first, what = %what, "Persistence failed, retrying");
        if let Err(second) = attempt().await {
            tracing::warn!(task_id = %task_id, error = %second, what = %what, "Persistence failed after retry");
        }
    }
}
