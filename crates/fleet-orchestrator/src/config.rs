//! Startup configuration: environment options, the node catalog, and the
//! workflow catalog.
//!
//! Two YAML documents are loaded at initialization. The node catalog
//! declares the fleet; the workflow catalog declares per-node tool sets and
//! constraint overrides. Every tunable also has an environment override
//! under the `FLEET_` prefix.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::registry::SelectionStrategy;
use crate::{hash, OrchestratorError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub node_id: String,
    pub message_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub max_retries: u32,
    pub compression_threshold: usize,
    pub enable_compression: bool,
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub max_concurrent_per_node: u32,
    pub task_timeout_ms: u64,
    pub deterministic_seed: Option<String>,
    pub seed_path: Option<PathBuf>,
    pub monitoring_interval_ms: u64,
    pub alert_cpu_warning: f64,
    pub alert_cpu_critical: f64,
    pub alert_memory_warning: f64,
    pub alert_memory_critical: f64,
    pub selection_strategy: SelectionStrategy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            node_id: "orchestrator".to_string(),
            message_timeout_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 30_000,
            max_retries: 3,
            compression_threshold: 1024,
            enable_compression: true,
            batch_size: 10,
            batch_interval_ms: 100,
            max_concurrent_per_node: 5,
            task_timeout_ms: 300_000,
            deterministic_seed: None,
            seed_path: None,
            monitoring_interval_ms: 30_000,
            alert_cpu_warning: 75.0,
            alert_cpu_critical: 90.0,
            alert_memory_warning: 75.0,
            alert_memory_critical: 90.0,
            selection_strategy: SelectionStrategy::CapabilityMatch,
        }
    }
}

impl OrchestratorConfig {
    /// Build a config from defaults overlaid with `FLEET_*` environment
    /// variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        overlay_u64(&mut config.message_timeout_ms, "FLEET_MESSAGE_TIMEOUT_MS");
        overlay_u64(&mut config.heartbeat_interval_ms, "FLEET_HEARTBEAT_INTERVAL_MS");
        overlay_u64(&mut config.heartbeat_timeout_ms, "FLEET_HEARTBEAT_TIMEOUT_MS");
        overlay_u32(&mut config.max_retries, "FLEET_MAX_RETRIES");
        overlay_usize(&mut config.compression_threshold, "FLEET_COMPRESSION_THRESHOLD");
        overlay_bool(&mut config.enable_compression, "FLEET_ENABLE_COMPRESSION");
        overlay_usize(&mut config.batch_size, "FLEET_BATCH_SIZE");
        overlay_u64(&mut config.batch_interval_ms, "FLEET_BATCH_INTERVAL_MS");
        overlay_u32(&mut config.max_concurrent_per_node, "FLEET_MAX_CONCURRENT_PER_NODE");
        overlay_u64(&mut config.task_timeout_ms, "FLEET_TASK_TIMEOUT_MS");
        overlay_u64(&mut config.monitoring_interval_ms, "FLEET_MONITORING_INTERVAL_MS");
        overlay_f64(&mut config.alert_cpu_warning, "FLEET_ALERT_CPU_WARNING");
        overlay_f64(&mut config.alert_cpu_critical, "FLEET_ALERT_CPU_CRITICAL");
        overlay_f64(&mut config.alert_memory_warning, "FLEET_ALERT_MEMORY_WARNING");
        overlay_f64(&mut config.alert_memory_critical, "FLEET_ALERT_MEMORY_CRITICAL");
        if let Ok(seed) = std::env::var("FLEET_DETERMINISTIC_SEED") {
            if !seed.is_empty() {
                config.deterministic_seed = Some(seed);
            }
        }
        if let Ok(path) = std::env::var("FLEET_SEED_PATH") {
            if !path.is_empty() {
                config.seed_path = Some(PathBuf::from(path));
            }
        }
        config
    }

    /// Resolve the deterministic seed, in priority order: explicit config,
    /// previously persisted seed, freshly derived.
    ///
    /// A derived seed is written back to `seed_path` when one is set, so a
    /// restarted orchestrator replays the same hash-driven decisions.
    pub fn resolve_seed(&self) -> Result<String, OrchestratorError> {
        if let Some(seed) = &self.deterministic_seed {
            return Ok(seed.clone());
        }
        if let Some(path) = &self.seed_path {
            if path.exists() {
                let seed = std::fs::read_to_string(path)
                    .map_err(|e| OrchestratorError::ConfigError(format!("seed file: {e}")))?;
                let seed = seed.trim().to_string();
                if !seed.is_empty() {
                    return Ok(seed);
                }
            }
            let seed = hash::derive_seed();
            std::fs::write(path, &seed)
                .map_err(|e| OrchestratorError::ConfigError(format!("seed file: {e}")))?;
            tracing::info!(path = %path.display(), "Derived and persisted deterministic seed");
            return Ok(seed);
        }
        tracing::warn!("No seed configured or persisted; deterministic routing will not survive restart");
        Ok(hash::derive_seed())
    }
}

/// One declared worker in the node catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default)]
    pub priority: u8,
}

fn default_max_concurrent() -> u32 {
    5
}

/// The static fleet declaration loaded at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeCatalog {
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
}

impl NodeCatalog {
    pub fn load(path: &Path) -> Result<Self, OrchestratorError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::ConfigError(format!("{}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| OrchestratorError::ConfigError(format!("{}: {e}", path.display())))
    }
}

/// Per-node constraint overrides from the workflow catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConstraints {
    #[serde(default)]
    pub max_connections_per_cycle: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePrompt {
    #[serde(default)]
    pub constraints: NodeConstraints,
}

/// Tool sets and constraint overrides keyed by node name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowCatalog {
    #[serde(default)]
    pub node_tools: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub node_prompts: HashMap<String, NodePrompt>,
}

impl WorkflowCatalog {
    pub fn load(path: &Path) -> Result<Self, OrchestratorError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::ConfigError(format!("{}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| OrchestratorError::ConfigError(format!("{}: {e}", path.display())))
    }

    /// Effective concurrency cap for a node: catalog constraint wins over
    /// the declared default.
    pub fn max_concurrent_for(&self, node: &str, declared: u32) -> u32 {
        self.node_prompts
            .get(node)
            .and_then(|p| p.constraints.max_connections_per_cycle)
            .unwrap_or(declared)
    }
}

fn overlay_u64(slot: &mut u64, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(value) = raw.parse() {
            *slot = value;
        }
    }
}

fn overlay_u32(slot: &mut u32, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(value) = raw.parse() {
            *slot = value;
        }
    }
}

fn overlay_usize(slot: &mut usize, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(value) = raw.parse() {
            *slot = value;
        }
    }
}

fn overlay_f64(slot: &mut f64, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(value) = raw.parse() {
            *slot = value;
        }
    }
}

fn overlay_bool(slot: &mut bool, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        match raw.as_str() {
            "1" | "true" | "yes" => *slot = true,
            "0" | "false" | "no" => *slot = false,
            _ => {}
        }
    }
}
