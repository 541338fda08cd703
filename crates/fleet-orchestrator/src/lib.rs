//! Distributed task orchestration for heterogeneous worker fleets.
//!
//! This crate provides the orchestration core:
//! - Node registry with capability tracking and health state transitions
//! - Priority task routing with multi-factor scoring and failover
//! - Deterministic workflow execution with seeded parameter derivation
//! - Reliable at-least-once messaging with deduplication and retries
//! - Per-node performance monitoring feeding routing and alerts

pub mod config;
pub mod events;
pub mod hash;
pub mod monitor;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod store;
pub mod workflow;

pub use config::{NodeCatalog, NodeEntry, OrchestratorConfig, WorkflowCatalog};
pub use events::{EventBus, OrchestratorEvent};
pub use monitor::{
    AlertSeverity, AlertThresholds, FleetSummary, MetricField, PerformanceMonitor,
    PerformanceSample, Trend,
};
pub use orchestrator::{CheckStatus, ComponentCheck, HealthReport, Orchestrator, SystemStatus};
pub use protocol::{
    Message, MessageHandler, MessageProtocol, MessageType, ProtocolConfig, BROADCAST,
    MAX_MESSAGE_SIZE,
};
pub use registry::{
    HeartbeatMetrics, NodeRegistry, NodeStatus, SelectionStrategy, WorkerNode,
};
pub use router::{
    Assignment, RouterConfig, RouterStats, RoutingDecision, Task, TaskRouter, TaskSpec, TaskState,
    TaskStatus,
};
pub use store::{InMemoryBroker, InMemoryTaskStore, StoreStats, TaskBroker, TaskStore};
pub use workflow::{
    node_initialization_workflow, task_execution_workflow, ExecutionStatus, RetryPolicy,
    StepHandler, StepType, ValidationReport, Workflow, WorkflowEngine, WorkflowExecution,
    WorkflowStep,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error("Message expired before receipt")]
    ExpiredMessage,

    #[error("Checksum verification failed")]
    ChecksumFailed,

    #[error("Message exceeds maximum size: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Send timed out after {0} attempts")]
    Timeout(u32),

    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("Workflow has a dependency cycle: {0}")]
    CyclicWorkflow(String),

    #[error("Step {step} has unmet dependency {missing}")]
    UnmetDependency { step: String, missing: String },

    #[error("Step {step} timed out after {timeout_ms}ms")]
    StepTimeout { step: String, timeout_ms: u64 },

    #[error("Step {step} exhausted {attempts} retry attempts: {cause}")]
    RetryExhausted {
        step: String,
        attempts: u32,
        cause: String,
    },

    #[error("No handler registered for action: {0}")]
    UnknownAction(String),

    #[error("Step failed: {0}")]
    StepFailed(String),

    #[error("No candidate worker for task {0}")]
    NoCandidateWorker(String),

    #[error("Task timed out: {0}")]
    TaskTimeout(String),

    #[error("Worker offline: {0}")]
    WorkerOffline(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Wall-clock epoch milliseconds, the timestamp unit carried on the wire.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
