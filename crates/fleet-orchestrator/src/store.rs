//! Collaborator seams: durable task persistence and the submitted-task
//! broker.
//!
//! The orchestrator core treats both as external services behind traits.
//! The in-memory implementations back tests and single-process deployments;
//! a relational store or external broker plugs in behind the same traits.
//! All persistence operations are idempotent on (id, status) transitions.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

use crate::router::{Task, TaskState};
use crate::OrchestratorError;

/// Persistence stats aggregated by the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub by_type: HashMap<String, usize>,
}

/// Durable task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save(&self, task: &Task) -> Result<(), OrchestratorError>;
    async fn find_by_id(&self, id: &str) -> Result<Option<Task>, OrchestratorError>;
    async fn update_status(&self, id: &str, status: TaskState) -> Result<(), OrchestratorError>;
    async fn update_progress(&self, id: &str, progress: f64) -> Result<(), OrchestratorError>;
    async fn mark_started(&self, id: &str) -> Result<(), OrchestratorError>;
    async fn mark_completed(&self, id: &str, result: &Value) -> Result<(), OrchestratorError>;
    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), OrchestratorError>;
    async fn get_stats(&self) -> Result<StoreStats, OrchestratorError>;
}

#[derive(Debug, Clone)]
struct StoredTask {
    task: Task,
    status: TaskState,
    progress: f64,
    result: Option<Value>,
    error: Option<String>,
}

/// DashMap-backed store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryTaskStore {
    records: DashMap<String, StoredTask>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn result_of(&self, id: &str) -> Option<Value> {
        self.records.get(id).and_then(|r| r.result.clone())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, task: &Task) -> Result<(), OrchestratorError> {
        self.records.insert(
            task.id.clone(),
            StoredTask {
                task: task.clone(),
                status: TaskState::Queued,
                progress: 0.0,
                result: None,
                error: None,
            },
        );
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Task>, OrchestratorError> {
        Ok(self.records.get(id).map(|r| r.task.clone()))
    }

    async fn update_status(&self, id: &str, status: TaskState) -> Result<(), OrchestratorError> {
        if let Some(mut record) = self.records.get_mut(id) {
            record.status = status;
        }
        Ok(())
    }

    async fn update_progress(&self, id: &str, progress: f64) -> Result<(), OrchestratorError> {
        if let Some(mut record) = self.records.get_mut(id) {
            record.progress = progress.clamp(0.0, 1.0);
        }
        Ok(())
    }

    async fn mark_started(&self, id: &str) -> Result<(), OrchestratorError> {
        self.update_status(id, TaskState::Active).await
    }

    async fn mark_completed(&self, id: &str, result: &Value) -> Result<(), OrchestratorError> {
        if let Some(mut record) = self.records.get_mut(id) {
            record.status = TaskState::Completed;
            record.result = Some(result.clone());
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), OrchestratorError> {
        if let Some(mut record) = self.records.get_mut(id) {
            record.status = TaskState::Failed;
            record.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn get_stats(&self) -> Result<StoreStats, OrchestratorError> {
        let mut stats = StoreStats {
            total: self.records.len(),
            ..Default::default()
        };
        for record in self.records.iter() {
            *stats
                .by_status
                .entry(record.status.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_type
                .entry(record.task.task_type.clone())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }
}

/// Priority-ordered broker surface for user-submitted tasks.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<(), OrchestratorError>;
    /// Pop the highest-priority task, or `None` when the queue is empty.
    async fn dequeue(&self) -> Result<Option<Task>, OrchestratorError>;
    async fn ack(&self, task_id: &str) -> Result<(), OrchestratorError>;
    /// Negative acknowledgement: the task re-enters the queue after an
    /// exponential delay.
    async fn nack(&self, task_id: &str) -> Result<(), OrchestratorError>;
}

struct QueuedEntry {
    task: Task,
    sequence: u64,
    attempts: u32,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier submission.
        self.task
            .priority
            .cmp(&other.task.priority)
            .then(other.sequence.cmp(&self.sequence))
    }
}

const NACK_BASE_DELAY_MS: u64 = 500;
const NACK_MAX_ATTEMPTS: u32 = 5;

/// In-process broker with ack/nack semantics and exponential nack retry.
pub struct InMemoryBroker {
    queue: Arc<Mutex<BinaryHeap<QueuedEntry>>>,
    in_flight: Arc<DashMap<String, (Task, u32)>>,
    sequence: AtomicU64,
    available: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(BinaryHeap::new())),
            in_flight: Arc::new(DashMap::new()),
            sequence: AtomicU64::new(0),
            available: Arc::new(Notify::new()),
        }
    }

    pub fn depth(&self) -> usize {
        self.queue.lock().len()
    }

    fn push(&self, task: Task, attempts: u32) {
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::SeqCst);
        self.queue.lock().push(QueuedEntry {
            task,
            sequence,
            attempts,
        });
        self.available.notify_one();
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskBroker for InMemoryBroker {
    async fn enqueue(&self, task: Task) -> Result<(), OrchestratorError> {
        tracing::debug!(task_id = %task.id, priority = %task.priority, "Task enqueued");
        self.push(task, 0);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Task>, OrchestratorError> {
        let entry = self.queue.lock().pop();
        Ok(entry.map(|e| {
            self.in_flight
                .insert(e.task.id.clone(), (e.task.clone(), e.attempts));
            e.task
        }))
    }

    async fn ack(&self, task_id: &str) -> Result<(), OrchestratorError> {
        self.in_flight.remove(task_id);
        Ok(())
    }

    async fn nack(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let (task, attempts) = match self.in_flight.remove(task_id) {
            Some((_, entry)) => entry,
            None => return Ok(()),
        };
        if attempts >= NACK_MAX_ATTEMPTS {
            tracing::warn!(task_id = %task_id, attempts = %attempts, "Task dropped after repeated nacks");
            return Ok(());
        }

        let delay = Duration::from_millis(NACK_BASE_DELAY_MS * 2u64.saturating_pow(attempts));
        let queue = Arc::clone(&self.queue);
        let available = Arc::clone(&self.available);
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.lock().push(QueuedEntry {
                task,
                sequence,
                attempts: attempts + 1,
            });
            available.notify_one();
        });
        Ok(())
    }
}
