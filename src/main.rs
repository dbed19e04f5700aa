//! Stagewright - drive projects through an agent-assisted delivery lifecycle.
//!
//! Thin command-line shell: loads configuration, opens the state directory
//! and calls into the orchestrator.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stagewright::core::EngineConfig;
use stagewright::workflow::{
    FileStateStore, Orchestrator, StageExecutionRecord, StageRegistry, WorkflowSnapshot,
};

/// Agent-assisted workflow orchestration
#[derive(Parser)]
#[command(name = "stagewright")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to $STAGEWRIGHT_CONFIG, ./.stagewright.toml, then the user config)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding workflow logs
    #[arg(long, global = true, value_name = "DIR")]
    state_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum Format {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List the lifecycle stages
    Stages {
        #[arg(short, long, value_enum, default_value_t)]
        format: Format,
    },

    /// Start a workflow for a project
    Start {
        /// Project reference
        project: String,

        /// Keep advancing until the workflow finishes
        #[arg(long)]
        run: bool,
    },

    /// Run the next stage of a workflow
    Advance {
        /// Workflow id
        id: String,
    },

    /// Recover interrupted workflows and run them to completion
    Resume {
        /// Workflow id (all active workflows when omitted)
        id: Option<String>,
    },

    /// Show a workflow and its history
    Status {
        /// Workflow id
        id: String,

        #[arg(short, long, value_enum, default_value_t)]
        format: Format,
    },

    /// List known workflows
    List,

    /// Cancel a workflow
    Cancel {
        /// Workflow id
        id: String,
    },

    /// Put a failed workflow back to running at its failed stage
    Restart {
        /// Workflow id
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| if cli.verbose { EnvFilter::new("debug") } else { EnvFilter::new("warn") });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Stages { format } => cmd_stages(&config, format),
        Commands::Start { project, run } => {
            let orchestrator = open_orchestrator(&config)?;
            cmd_start(&orchestrator, &project, run).await
        }
        Commands::Advance { id } => {
            let orchestrator = open_orchestrator(&config)?;
            interruptible(&id, cmd_advance(&orchestrator, &id)).await
        }
        Commands::Resume { id } => {
            let orchestrator = open_orchestrator(&config)?;
            cmd_resume(&orchestrator, id.as_deref()).await
        }
        Commands::Status { id, format } => {
            let orchestrator = open_orchestrator(&config)?;
            cmd_status(&orchestrator, &config, &id, format).await
        }
        Commands::List => {
            let orchestrator = open_orchestrator(&config)?;
            cmd_list(&orchestrator).await
        }
        Commands::Cancel { id } => {
            let orchestrator = open_orchestrator(&config)?;
            let instance = orchestrator.cancel(&id).await?;
            println!("Cancelled {} (status: {})", instance.id, instance.status);
            Ok(())
        }
        Commands::Restart { id } => {
            let orchestrator = open_orchestrator(&config)?;
            let instance = orchestrator.restart(&id).await?;
            println!("Restarted {} at stage {}", instance.id, instance.current_stage_index + 1);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::load()?,
    };
    if let Some(dir) = &cli.state_dir {
        config.general.state_dir = Some(dir.clone());
    }
    Ok(config)
}

fn open_orchestrator(config: &EngineConfig) -> Result<Orchestrator> {
    let state_dir = config.state_dir();
    let store = FileStateStore::open(&state_dir)
        .with_context(|| format!("Failed to open state directory {}", state_dir.display()))?;
    Ok(Orchestrator::from_config(config, Arc::new(store))?)
}

/// Stop at Ctrl-C. The attempt in flight stays open for `resume`.
async fn interruptible<F>(id: &str, work: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted; run `stagewright resume {id}` to continue");
            std::process::exit(130);
        }
    }
}

/// List the lifecycle stages.
fn cmd_stages(config: &EngineConfig, format: Format) -> Result<()> {
    let stages = StageRegistry::lifecycle().with_overrides(&config.stages)?;

    match format {
        Format::Json => {
            let rows: Vec<_> = stages
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "order": s.order,
                        "id": s.id,
                        "name": s.name,
                        "required_capabilities": s.required_capabilities,
                        "timeout_ms": s.timeout.as_millis() as u64,
                        "max_attempts": s.retry.attempts(),
                        "context_budget": s.context_budget,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Format::Text => {
            for stage in stages.iter() {
                let caps: Vec<&str> = stage.required_capabilities.iter().map(String::as_str).collect();
                println!("{:>2}. {:<16} {} [{}]", stage.order, stage.id, stage.name, caps.join(", "));
            }
            println!("\nTotal: {} stages", stages.len());
        }
    }
    Ok(())
}

async fn cmd_start(orchestrator: &Orchestrator, project: &str, run: bool) -> Result<()> {
    let instance = orchestrator.start(project).await?;
    println!("{}", instance.id);

    if run {
        let id = instance.id.clone();
        interruptible(&id, async {
            let snapshot = orchestrator.run_to_completion(&id).await?;
            print_summary(&snapshot);
            Ok(())
        })
        .await?;
    }
    Ok(())
}

async fn cmd_advance(orchestrator: &Orchestrator, id: &str) -> Result<()> {
    let outcome = orchestrator.advance_stage(id).await?;
    print_record(&outcome.record);
    println!("Status: {} ({} stages committed)", outcome.instance.status, outcome.instance.current_stage_index);
    Ok(())
}

async fn cmd_resume(orchestrator: &Orchestrator, id: Option<&str>) -> Result<()> {
    let ids = match id {
        Some(id) => vec![id.to_string()],
        None => {
            let reports = orchestrator.recover_all().await?;
            for report in reports.iter().filter(|r| r.repaired()) {
                eprintln!("Recovered {} at stage {}", report.instance_id, report.stage_index + 1);
            }
            reports.into_iter().map(|r| r.instance_id).collect()
        }
    };

    if ids.is_empty() {
        println!("No active workflows");
        return Ok(());
    }

    for id in ids {
        let snapshot = interruptible_snapshot(orchestrator, &id).await?;
        print_summary(&snapshot);
    }
    Ok(())
}

async fn interruptible_snapshot(orchestrator: &Orchestrator, id: &str) -> Result<WorkflowSnapshot> {
    tokio::select! {
        result = orchestrator.resume(id) => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted; run `stagewright resume {id}` to continue");
            std::process::exit(130);
        }
    }
}

async fn cmd_status(orchestrator: &Orchestrator, config: &EngineConfig, id: &str, format: Format) -> Result<()> {
    let snapshot = orchestrator.snapshot(id).await?;

    if let Format::Json = format {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let stages = StageRegistry::lifecycle().with_overrides(&config.stages)?;
    let instance = &snapshot.instance;
    println!("Workflow {} (project {})", instance.id, instance.project_ref);
    println!("Status: {}", instance.status);
    match stages.next_after(instance.current_stage_index) {
        Some(next) if !instance.status.is_terminal() => {
            println!("Progress: {}/{} (next: {})", instance.current_stage_index, stages.len(), next.id);
        }
        _ => println!("Progress: {}/{}", instance.current_stage_index, stages.len()),
    }
    if let Some(in_flight) = &snapshot.in_flight {
        println!("In flight: {} attempt {}", in_flight.stage_id, in_flight.attempt);
    }

    if !snapshot.history.is_empty() {
        println!("\nHistory:");
        for record in &snapshot.history {
            print_record(record);
        }
    }
    if !snapshot.vetoes.is_empty() {
        println!("\nVetoed:");
        for record in &snapshot.vetoes {
            print_record(record);
        }
    }
    println!("\nTotal cost: {:.4}", snapshot.total_cost());
    Ok(())
}

async fn cmd_list(orchestrator: &Orchestrator) -> Result<()> {
    let instances = orchestrator.store().list().await?;
    for instance in &instances {
        println!(
            "{}  {:<16} {:>2} stages  {}",
            instance.id, instance.status, instance.current_stage_index, instance.project_ref
        );
    }
    println!("\nTotal: {} workflows", instances.len());
    Ok(())
}

fn print_record(record: &StageExecutionRecord) {
    let error = record.error.as_ref().map(|e| format!(" - {}", e.message)).unwrap_or_default();
    println!(
        "  {:<16} #{:<2} {:<8} cost={:.4} calls={} cache_hits={}{}",
        record.stage_id,
        record.attempt,
        format!("{:?}", record.outcome).to_lowercase(),
        record.cost,
        record.provider_calls,
        record.cache_hits,
        error
    );
}

fn print_summary(snapshot: &WorkflowSnapshot) {
    println!(
        "{}: {} ({} stages, {} attempts, cost {:.4})",
        snapshot.instance.id,
        snapshot.instance.status,
        snapshot.instance.current_stage_index,
        snapshot.history.len() + snapshot.vetoes.len(),
        snapshot.total_cost()
    );
}
