mod config;
mod offline;

use clap::{Parser, Subcommand};
use config::ForemanConfig;
use foreman_orchestrator::{Services, WorkflowCoordinator, WorkflowPlan, WorkflowState};
use foreman_store::{tables, FileStore, PersistentStore, RecordFilter};
use offline::{EchoReasoning, EchoSearch};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "foreman", about = "Foreman — multi-agent construction workflow coordinator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "foreman.toml")]
    config: PathBuf,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow plan with the offline services
    Run {
        /// Plan file (JSON)
        plan: PathBuf,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// Check a plan and print its execution order
    Validate {
        /// Plan file (JSON)
        plan: PathBuf,
    },
    /// List recorded resource conflicts
    Conflicts {
        /// Only conflicts still awaiting resolution
        #[arg(long)]
        pending: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let logs = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        logs.json().init();
    } else {
        logs.init();
    }

    let mut config = ForemanConfig::load(&cli.config).await?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Commands::Run { plan, timeout_secs } => run(config, &plan, timeout_secs).await,
        Commands::Validate { plan } => validate(&plan).await,
        Commands::Conflicts { pending } => conflicts(&config, pending).await,
    }
}

async fn load_plan(path: &Path) -> anyhow::Result<WorkflowPlan> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        anyhow::anyhow!("Failed to read plan file '{}': {}", path.display(), e)
    })?;
    Ok(serde_json::from_str(&raw)?)
}

async fn run(config: ForemanConfig, plan_path: &Path, timeout_secs: u64) -> anyhow::Result<()> {
    let plan = load_plan(plan_path).await?;
    let store = Arc::new(FileStore::new(config.data_dir.clone()).await?);
    info!(data_dir = %config.data_dir.display(), "File store ready");

    let services = Services::new(Arc::new(EchoReasoning)).with_search(Arc::new(EchoSearch));
    let coordinator = Arc::new(
        WorkflowCoordinator::new(config.coordinator, services)?.with_store(store),
    );

    let workflow_id = coordinator.submit_workflow(plan).await?;
    let timeout = Some(Duration::from_secs(timeout_secs));
    let status = tokio::select! {
        status = coordinator.wait(workflow_id, timeout) => status?,
        _ = tokio::signal::ctrl_c() => {
            warn!(workflow_id = %workflow_id, "Interrupted, cancelling workflow");
            coordinator.cancel_workflow(workflow_id).await?
        }
    };

    let report = serde_json::json!({
        "workflow": status,
        "agents": coordinator.monitor().to_json().await,
        "conflicts": coordinator.conflicts().for_workflow(workflow_id),
        "resources": coordinator.ledger().snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    match status.overall {
        WorkflowState::Completed => Ok(()),
        other => anyhow::bail!("workflow {workflow_id} ended {other}"),
    }
}

async fn validate(plan_path: &Path) -> anyhow::Result<()> {
    let plan = load_plan(plan_path).await?;
    let order = plan.execution_order()?;
    println!("Plan '{}' is valid ({} tasks):", plan.name, order.len());
    for (i, task) in order.iter().enumerate() {
        let after = if task.depends_on.is_empty() {
            String::new()
        } else {
            format!(" after {}", task.depends_on.join(", "))
        };
        println!(
            "  {:>2}. {} [{}] priority {}{}",
            i + 1,
            task.key,
            task.agent,
            task.priority,
            after
        );
    }
    Ok(())
}

async fn conflicts(config: &ForemanConfig, pending_only: bool) -> anyhow::Result<()> {
    let store = FileStore::new(config.data_dir.clone()).await?;
    let filter = if pending_only {
        RecordFilter::all().eq("status", "pending")
    } else {
        RecordFilter::all()
    };
    let records = store.query(tables::CONFLICTS, &filter).await?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}
