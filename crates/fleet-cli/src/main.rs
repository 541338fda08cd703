//! Operator CLI for the fleet orchestrator.
//!
//! Exit codes: 0 on success, 1 on health failure or runtime error; clap
//! reports usage errors with its own non-zero code.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet_orchestrator::{
    NodeCatalog, Orchestrator, OrchestratorConfig, TaskSpec, WorkflowCatalog,
};

#[derive(Parser)]
#[command(name = "fleet", about = "Distributed task orchestrator", version)]
struct Cli {
    /// Node catalog YAML path.
    #[arg(long, global = true)]
    nodes: Option<PathBuf>,

    /// Workflow catalog YAML path.
    #[arg(long, global = true)]
    workflows: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the orchestrator and report what was loaded.
    Init,
    /// Print a one-shot system status snapshot.
    Status,
    /// Run component health checks; exits non-zero when unhealthy.
    Health,
    /// Stream status snapshots periodically.
    Monitor {
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
    },
    /// Submit a task.
    SubmitTask {
        #[arg(long = "type")]
        task_type: String,
        #[arg(long)]
        name: String,
        /// JSON payload.
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long, default_value_t = 0)]
        priority: u8,
        /// Comma-separated capability tags the worker must have.
        #[arg(long, default_value = "")]
        required_tools: String,
        #[arg(long, default_value_t = false)]
        deterministic: bool,
        #[arg(long)]
        target_node: Option<String>,
        /// Seconds to poll for a terminal state before returning.
        #[arg(long, default_value_t = 0)]
        wait_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_orchestrator=info,fleet=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let orchestrator = build(&cli)?;
    orchestrator.start();

    let outcome = run(&cli, &orchestrator).await;
    orchestrator.stop().await;
    outcome
}

fn build(cli: &Cli) -> Result<Orchestrator> {
    let config = OrchestratorConfig::from_env();
    let orchestrator = Orchestrator::initialize(config).context("initializing orchestrator")?;

    let nodes = match &cli.nodes {
        Some(path) => NodeCatalog::load(path).context("loading node catalog")?,
        None => NodeCatalog::default(),
    };
    let workflows = match &cli.workflows {
        Some(path) => WorkflowCatalog::load(path).context("loading workflow catalog")?,
        None => WorkflowCatalog::default(),
    };
    orchestrator.load_catalogs(&nodes, &workflows);
    Ok(orchestrator)
}

async fn run(cli: &Cli, orchestrator: &Orchestrator) -> Result<()> {
    match &cli.command {
        Command::Init => {
            let status = orchestrator.status().await;
            println!(
                "initialized: {} nodes, {} workflows",
                status.online_nodes,
                status.workflows.len()
            );
            Ok(())
        }
        Command::Status => {
            let status = orchestrator.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Health => {
            let report = orchestrator.health_check().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.healthy {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Monitor { interval_secs } => {
            let mut interval = tokio::time::interval(Duration::from_secs((*interval_secs).max(1)));
            loop {
                interval.tick().await;
                let status = orchestrator.status().await;
                println!("{}", serde_json::to_string(&status)?);
            }
        }
        Command::SubmitTask {
            task_type,
            name,
            payload,
            priority,
            required_tools,
            deterministic,
            target_node,
            wait_secs,
        } => {
            let payload = serde_json::from_str(payload).context("parsing task payload")?;
            let spec = TaskSpec {
                task_type: task_type.clone(),
                name: name.clone(),
                payload,
                priority: *priority,
                required_tools: required_tools
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect(),
                target_node: target_node.clone(),
                timeout_ms: None,
                deterministic: *deterministic,
            };
            let task_id = orchestrator
                .submit_task(spec)
                .await
                .context("submitting task")?;
            println!("submitted {task_id}");

            if *wait_secs > 0 {
                let deadline = tokio::time::Instant::now() + Duration::from_secs(*wait_secs);
                while tokio::time::Instant::now() < deadline {
                    if let Some(status) = orchestrator.task_status(&task_id) {
                        if status.state.is_terminal() {
                            println!("{}", serde_json::to_string_pretty(&status)?);
                            return Ok(());
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
                println!("still pending after {wait_secs}s");
            }
            Ok(())
        }
    }
}
