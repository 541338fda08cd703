//! Deterministic workflow execution.
//!
//! Workflows are named steps over a dependency DAG. Registration
//! topologically sorts the steps with a lexicographic tie-break so sibling
//! order never depends on declaration order. Execution derives missing
//! parameters from the workflow seed, applies per-step retry policies with
//! exponential backoff, and produces execution ids that are stable across
//! replays of the same inputs.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{hash, now_ms, OrchestratorError};

const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Task,
    Decision,
    Parallel,
    Sequence,
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
    pub initial_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub action: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_step_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub deterministic: bool,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

fn default_step_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub version: String,
    /// 64 hex chars driving every hash-based decision in this workflow.
    pub seed: String,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub workflow_id: String,
    pub seed: String,
    pub status: ExecutionStatus,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub results: HashMap<String, Value>,
    pub started_at_ms: i64,
    pub finished_at_ms: Option<i64>,
}

/// Validation outcome for a registered workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<String>,
}

/// Executes one named action for a workflow step.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(
        &self,
        action: &str,
        params: &Map<String, Value>,
        context: &Value,
    ) -> Result<Value, OrchestratorError>;
}

struct RegisteredWorkflow {
    workflow: Workflow,
    /// Step ids in execution order.
    order: Vec<String>,
}

pub struct WorkflowEngine {
    workflows: DashMap<String, RegisteredWorkflow>,
    handlers: RwLock<HashMap<String, Arc<dyn StepHandler>>>,
    executions: DashMap<String, WorkflowExecution>,
}

impl WorkflowEngine {
    pub fn new() -> Self {
        Self {
            workflows: DashMap::new(),
            handlers: RwLock::new(HashMap::new()),
            executions: DashMap::new(),
        }
    }

    pub fn register_handler(&self, action: &str, handler: Arc<dyn StepHandler>) {
        self.handlers.write().insert(action.to_string(), handler);
    }

    /// Register a workflow, computing its execution order.
    ///
    /// Fails on dependency cycles or references to unknown steps.
    pub fn register_workflow(&self, workflow: Workflow) -> Result<(), OrchestratorError> {
        let order = execution_order(&workflow)?;
        tracing::info!(
            workflow_id = %workflow.id,
            steps = %workflow.steps.len(),
            order = ?order,
            "Workflow registered"
        );
        self.workflows
            .insert(workflow.id.clone(), RegisteredWorkflow { workflow, order });
        Ok(())
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Check a registered workflow for structural problems without
    /// executing it.
    pub fn validate(&self, workflow_id: &str) -> Result<ValidationReport, OrchestratorError> {
        let entry = self
            .workflows
            .get(workflow_id)
            .ok_or_else(|| OrchestratorError::UnknownWorkflow(workflow_id.to_string()))?;
        let workflow = &entry.workflow;
        let mut issues = Vec::new();

        let mut seen = HashSet::new();
        for step in &workflow.steps {
            if !seen.insert(step.id.as_str()) {
                issues.push(format!("duplicate step id: {}", step.id));
            }
        }
        for step in &workflow.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    issues.push(format!("step {} depends on unknown step {}", step.id, dep));
                }
            }
            if let Some(policy) = &step.retry_policy {
                if policy.max_attempts == 0 {
                    issues.push(format!("step {} retry policy allows zero attempts", step.id));
                }
            }
        }
        if workflow.seed.len() != 64 || !workflow.seed.chars().all(|c| c.is_ascii_hexdigit()) {
            issues.push("seed is not 64 hex characters".to_string());
        }

        Ok(ValidationReport {
            valid: issues.is_empty(),
            issues,
        })
    }

    pub fn execution(&self, execution_id: &str) -> Option<WorkflowExecution> {
        self.executions.get(execution_id).map(|e| e.clone())
    }

    /// Execute a workflow to completion.
    ///
    /// Fatal step errors abort the run; the stored execution is marked
    /// failed and the error is returned.
    pub async fn execute(
        &self,
        workflow_id: &str,
        initial_context: Value,
    ) -> Result<WorkflowExecution, OrchestratorError> {
        let (workflow, order) = {
            let entry = self
                .workflows
                .get(workflow_id)
                .ok_or_else(|| OrchestratorError::UnknownWorkflow(workflow_id.to_string()))?;
            (entry.workflow.clone(), entry.order.clone())
        };

        let context_json = initial_context.to_string();
        let execution_id = hash::execution_id(workflow_id, &context_json, now_ms());
        let mut execution = WorkflowExecution {
            execution_id: execution_id.clone(),
            workflow_id: workflow_id.to_string(),
            seed: workflow.seed.clone(),
            status: ExecutionStatus::Running,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            results: HashMap::new(),
            started_at_ms: now_ms(),
            finished_at_ms: None,
        };
        self.executions.insert(execution_id.clone(), execution.clone());

        tracing::info!(
            workflow_id = %workflow_id,
            execution_id = %execution_id,
            "Workflow execution started"
        );

        let steps: HashMap<&str, &WorkflowStep> =
            workflow.steps.iter().map(|s| (s.id.as_str(), s)).collect();

        for step_id in &order {
            let step = match steps.get(step_id.as_str()) {
                Some(s) => *s,
                None => continue,
            };
            if let Some(missing) = step
                .depends_on
                .iter()
                .find(|d| !execution.completed_steps.contains(d))
            {
                let err = OrchestratorError::UnmetDependency {
                    step: step.id.clone(),
                    missing: missing.clone(),
                };
                return Err(self.fail_execution(execution, step, err));
            }

            match self
                .run_step_with_retries(&workflow, step, &initial_context, &mut execution.results)
                .await
            {
                Ok(result) => {
                    execution.results.insert(step.id.clone(), result);
                    execution.completed_steps.push(step.id.clone());
                    self.executions
                        .insert(execution_id.clone(), execution.clone());
                }
                Err(err) => {
                    return Err(self.fail_execution(execution, step, err));
                }
            }
        }

        execution.status = ExecutionStatus::Completed;
        execution.finished_at_ms = Some(now_ms());
        self.executions.insert(execution_id.clone(), execution.clone());
        tracing::info!(
            execution_id = %execution_id,
            steps = %execution.completed_steps.len(),
            "Workflow execution completed"
        );
        Ok(execution)
    }

    fn fail_execution(
        &self,
        mut execution: WorkflowExecution,
        step: &WorkflowStep,
        err: OrchestratorError,
    ) -> OrchestratorError {
        tracing::warn!(
            execution_id = %execution.execution_id,
            step = %step.id,
            error = %err,
            "Workflow execution failed"
        );
        execution.failed_steps.push(step.id.clone());
        execution.status = ExecutionStatus::Failed;
        execution.finished_at_ms = Some(now_ms());
        self.executions
            .insert(execution.execution_id.clone(), execution);
        err
    }

    async fn run_step_with_retries(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        context: &Value,
        results: &mut HashMap<String, Value>,
    ) -> Result<Value, OrchestratorError> {
        let policy = step.retry_policy.clone().or_else(|| {
            (step.step_type == StepType::Retry).then(RetryPolicy::default)
        });

        let mut attempt: u32 = 0;
        loop {
            match self.run_step(workflow, step, context).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let policy = match &policy {
                        Some(p) => p,
                        None => return Err(err),
                    };
                    attempt += 1;
                    results.insert(format!("{}_attempts", step.id), json!(attempt));
                    if attempt >= policy.max_attempts {
                        return Err(OrchestratorError::RetryExhausted {
                            step: step.id.clone(),
                            attempts: attempt,
                            cause: err.to_string(),
                        });
                    }
                    let delay = policy.initial_delay_ms as f64
                        * policy.backoff_multiplier.powi(attempt as i32 - 1);
                    tracing::debug!(
                        step = %step.id,
                        attempt = %attempt,
                        delay_ms = %delay,
                        "Step failed, retrying after backoff"
                    );
                    tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                }
            }
        }
    }

    async fn run_step(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        context: &Value,
    ) -> Result<Value, OrchestratorError> {
        let params = if step.deterministic {
            fill_deterministic_params(&workflow.seed, &step.id, &step.params)
        } else {
            step.params.clone()
        };

        match step.step_type {
            StepType::Task | StepType::Retry => {
                self.run_action(step, &params, context).await
            }
            StepType::Decision => {
                let digest = hash::hex16(&format!("{}{}", step.id, context));
                let head = u64::from_str_radix(&digest[..8], 16)
                    .map_err(|e| OrchestratorError::StepFailed(e.to_string()))?;
                let decision = head % 2 == 0;
                Ok(json!({
                    "decision": decision,
                    "path": if decision { "primary" } else { "fallback" },
                }))
            }
            StepType::Parallel => {
                let children = embedded_steps(step)?;
                let futures: Vec<_> = children
                    .iter()
                    .map(|child| self.run_step_boxed(workflow, child.clone(), context.clone()))
                    .collect();
                let outcomes = futures::future::join_all(futures).await;
                let mut aggregated = Vec::with_capacity(outcomes.len());
                for outcome in outcomes {
                    aggregated.push(outcome?);
                }
                Ok(Value::Array(aggregated))
            }
            StepType::Sequence => {
                let children = embedded_steps(step)?;
                let mut aggregated = Vec::with_capacity(children.len());
                for child in children {
                    aggregated
                        .push(self.run_step_boxed(workflow, child, context.clone()).await?);
                }
                Ok(Value::Array(aggregated))
            }
        }
    }

    fn run_step_boxed<'a>(
        &'a self,
        workflow: &'a Workflow,
        step: WorkflowStep,
        context: Value,
    ) -> BoxFuture<'a, Result<Value, OrchestratorError>> {
        Box::pin(async move { self.run_step(workflow, &step, &context).await })
    }

    async fn run_action(
        &self,
        step: &WorkflowStep,
        params: &Map<String, Value>,
        context: &Value,
    ) -> Result<Value, OrchestratorError> {
        let handler = self
            .handlers
            .read()
            .get(&step.action)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownAction(step.action.clone()))?;

        let timeout = Duration::from_millis(step.timeout_ms.max(1));
        match tokio::time::timeout(timeout, handler.execute(&step.action, params, context)).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::StepTimeout {
                step: step.id.clone(),
                timeout_ms: step.timeout_ms,
            }),
        }
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Topological order honoring `depends_on`, lexicographic among ready
/// siblings.
fn execution_order(workflow: &Workflow) -> Result<Vec<String>, OrchestratorError> {
    let ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &workflow.steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(OrchestratorError::UnmetDependency {
                    step: step.id.clone(),
                    missing: dep.clone(),
                });
            }
        }
    }

    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for step in &workflow.steps {
        graph.add_node(step.id.as_str());
        for dep in &step.depends_on {
            graph.add_edge(dep.as_str(), step.id.as_str(), ());
        }
    }
    if is_cyclic_directed(&graph) {
        return Err(OrchestratorError::CyclicWorkflow(workflow.id.clone()));
    }

    let mut indegree: HashMap<&str, usize> = workflow
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &workflow.steps {
        for dep in &step.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    let mut ready: BinaryHeap<Reverse<&str>> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();
    let mut order = Vec::with_capacity(workflow.steps.len());

    while let Some(Reverse(id)) = ready.pop() {
        order.push(id.to_string());
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = indegree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(*dependent));
                }
            }
        }
    }
    Ok(order)
}

/// Fill null parameters deterministically from the seed, keyed by the
/// parameter's name.
fn fill_deterministic_params(
    seed: &str,
    step_id: &str,
    params: &Map<String, Value>,
) -> Map<String, Value> {
    let mut filled = params.clone();
    for (key, value) in filled.iter_mut() {
        if !value.is_null() {
            continue;
        }
        let h = hash::seeded(seed, step_id, key);
        let name = key.to_ascii_lowercase();
        *value = if name.contains("port") {
            json!(8000 + h % 1000)
        } else if name.contains("uuid") || name.contains("id") {
            json!(format!("det-{:08x}", h as u32))
        } else if name.contains("count") || name.contains("limit") {
            json!(10 + h % 90)
        } else if name.contains("timeout") || name.contains("delay") {
            json!(1000 + h % 4000)
        } else {
            json!(format!("auto-{:x}", h))
        };
    }
    filled
}

/// Inline child steps carried by parallel and sequence steps under
/// `params.steps`.
fn embedded_steps(step: &WorkflowStep) -> Result<Vec<WorkflowStep>, OrchestratorError> {
    let raw = step
        .params
        .get("steps")
        .cloned()
        .ok_or_else(|| OrchestratorError::StepFailed(format!("step {} has no substeps", step.id)))?;
    serde_json::from_value(raw)
        .map_err(|e| OrchestratorError::StepFailed(format!("step {}: {e}", step.id)))
}

/// Predefined workflow run when a node joins the fleet.
pub fn node_initialization_workflow(seed: &str) -> Workflow {
    Workflow {
        id: "node-initialization".to_string(),
        version: "1".to_string(),
        seed: seed.to_string(),
        steps: vec![
            WorkflowStep {
                id: "handshake".to_string(),
                step_type: StepType::Task,
                action: "handshake".to_string(),
                params: Map::new(),
                depends_on: vec![],
                timeout_ms: 10_000,
                deterministic: true,
                retry_policy: None,
            },
            WorkflowStep {
                id: "announce-capabilities".to_string(),
                step_type: StepType::Task,
                action: "announce-capabilities".to_string(),
                params: Map::new(),
                depends_on: vec!["handshake".to_string()],
                timeout_ms: 10_000,
                deterministic: true,
                retry_policy: None,
            },
            WorkflowStep {
                id: "first-heartbeat".to_string(),
                step_type: StepType::Task,
                action: "first-heartbeat".to_string(),
                params: Map::new(),
                depends_on: vec!["announce-capabilities".to_string()],
                timeout_ms: 10_000,
                deterministic: true,
                retry_policy: Some(RetryPolicy::default()),
            },
        ],
    }
}

/// Predefined workflow modeling the lifecycle of one routed task.
pub fn task_execution_workflow(seed: &str) -> Workflow {
    Workflow {
        id: "task-execution".to_string(),
        version: "1".to_string(),
        seed: seed.to_string(),
        steps: vec![
            WorkflowStep {
                id: "validate".to_string(),
                step_type: StepType::Task,
                action: "validate-task".to_string(),
                params: Map::new(),
                depends_on: vec![],
                timeout_ms: 5_000,
                deterministic: true,
                retry_policy: None,
            },
            WorkflowStep {
                id: "route".to_string(),
                step_type: StepType::Task,
                action: "route-task".to_string(),
                params: Map::new(),
                depends_on: vec!["validate".to_string()],
                timeout_ms: 5_000,
                deterministic: true,
                retry_policy: None,
            },
            WorkflowStep {
                id: "dispatch".to_string(),
                step_type: StepType::Task,
                action: "dispatch-task".to_string(),
                params: Map::new(),
                depends_on: vec!["route".to_string()],
                timeout_ms: 30_000,
                deterministic: true,
                retry_policy: Some(RetryPolicy::default()),
            },
            WorkflowStep {
                id: "collect".to_string(),
                step_type: StepType::Task,
                action: "collect-result".to_string(),
                params: Map::new(),
                depends_on: vec!["dispatch".to_string()],
                timeout_ms: 30_000,
                deterministic: true,
                retry_policy: None,
            },
        ],
    }
}
