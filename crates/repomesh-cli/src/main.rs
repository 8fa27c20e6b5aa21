//! repomesh - multi-repository dependency graph orchestrator CLI
//!
//! ## Commands
//!
//! - `validate`: parse a descriptor file and report build problems
//! - `plan`: build, resolve and repair the graph, then print the wave plan
//! - `run`: execute the full pipeline with dry-run node tasks
//! - `visualize`: print the layered layout and statistics report

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use repomesh_core::{
    DescriptorSource, EventBus, FileSource, Graph, GraphBuilder, GraphConfig, Node, NodeTask,
    Orchestrator, OrchestratorResult, RunReport, TaskRegistry, Visualizer,
};

#[derive(Parser)]
#[command(name = "repomesh")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-repository dependency graph orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a descriptor file and report entities the builder would skip
    Validate {
        #[command(flatten)]
        input: InputArgs,
    },

    /// Build, resolve and repair the graph, then print the execution waves
    Plan {
        #[command(flatten)]
        input: InputArgs,
    },

    /// Run every phase with dry-run node tasks
    Run {
        #[command(flatten)]
        input: InputArgs,

        /// Override `execution.max_concurrency`
        #[arg(long, env = "REPOMESH_MAX_CONCURRENCY")]
        max_concurrency: Option<usize>,

        /// Override `execution.retry_limit`
        #[arg(long, env = "REPOMESH_RETRY_LIMIT")]
        retry_limit: Option<u32>,

        /// Override `execution.task_timeout_secs`
        #[arg(long, env = "REPOMESH_TASK_TIMEOUT_SECS")]
        timeout_secs: Option<u64>,
    },

    /// Print the layered layout and the statistics report
    Visualize {
        #[command(flatten)]
        input: InputArgs,
    },
}

#[derive(Args, Clone)]
struct InputArgs {
    /// Descriptor file (TOML, or JSON with a .json extension)
    #[arg(short, long, env = "REPOMESH_CONFIG", default_value = "repomesh.toml")]
    config: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Stand-in task: records what would run without touching anything.
struct DryRunTask;

#[async_trait]
impl NodeTask for DryRunTask {
    async fn run(&self, node: &Node) -> OrchestratorResult<serde_json::Value> {
        info!(node_id = %node.id, kind = %node.kind, "dry run");
        Ok(json!({
            "node": node.id,
            "kind": node.kind,
            "repository": node.repository,
            "dry_run": true,
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    repomesh_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Validate { input } => cmd_validate(&input).await,
        Commands::Plan { input } => cmd_plan(&input).await,
        Commands::Run {
            input,
            max_concurrency,
            retry_limit,
            timeout_secs,
        } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, finishing the current wave");
                    on_signal.cancel();
                }
            });
            let report = cmd_run(&input, max_concurrency, retry_limit, timeout_secs, cancel).await?;
            let failed = report.execution.failed_count();
            if !report.success {
                bail!("run {} finished with {failed} failed node(s)", report.run_id);
            }
            Ok(())
        }
        Commands::Visualize { input } => cmd_visualize(&input).await,
    }
}

async fn load_config(path: &Path) -> Result<GraphConfig> {
    FileSource::new(path)
        .load()
        .await
        .with_context(|| format!("failed to load descriptors from {}", path.display()))
}

fn orchestrator(cancel: CancellationToken) -> Orchestrator {
    Orchestrator::new(
        TaskRegistry::new().with_fallback(DryRunTask),
        EventBus::default(),
        cancel,
    )
}

fn apply_overrides(
    config: &mut GraphConfig,
    max_concurrency: Option<usize>,
    retry_limit: Option<u32>,
    timeout_secs: Option<u64>,
) {
    if let Some(n) = max_concurrency {
        config.execution.max_concurrency = n;
    }
    if let Some(n) = retry_limit {
        config.execution.retry_limit = n;
    }
    if timeout_secs.is_some() {
        config.execution.task_timeout_secs = timeout_secs;
    }
}

async fn cmd_validate(input: &InputArgs) -> Result<()> {
    let config = load_config(&input.config).await?;
    config.validate().context("invalid execution settings")?;

    let mut graph = Graph::new();
    let report = GraphBuilder::build(&mut graph, &config);

    match input.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!(
                "{} nodes, {} edges from {}",
                graph.node_count(),
                graph.edge_count(),
                input.config.display()
            );
            for (dependent, missing) in &report.deferred {
                println!("  unresolved: {dependent} -> {missing}");
            }
            for error in &report.errors {
                println!("  skipped {}: {}", error.entity, error.reason);
            }
        }
    }

    if !report.errors.is_empty() {
        bail!("{} descriptor(s) skipped", report.errors.len());
    }
    Ok(())
}

async fn cmd_plan(input: &InputArgs) -> Result<()> {
    let config = load_config(&input.config).await?;
    let mut graph = Graph::new();
    let prepared = orchestrator(CancellationToken::new())
        .prepare(&mut graph, &config)
        .await?;

    match input.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&prepared.plan)?),
        OutputFormat::Text => {
            for wave in &prepared.plan.waves {
                println!("wave {}: {}", wave.index, wave.nodes.join(", "));
            }
            for repair in prepared.cycle_repairs.iter().filter(|r| r.is_repaired()) {
                if let Some((dependent, dependency)) = &repair.removed {
                    println!("  cycle broken: {dependent} no longer depends on {dependency}");
                }
            }
        }
    }
    Ok(())
}

async fn cmd_run(
    input: &InputArgs,
    max_concurrency: Option<usize>,
    retry_limit: Option<u32>,
    timeout_secs: Option<u64>,
    cancel: CancellationToken,
) -> Result<RunReport> {
    let mut config = load_config(&input.config).await?;
    apply_overrides(&mut config, max_concurrency, retry_limit, timeout_secs);

    let mut graph = Graph::new();
    let report = orchestrator(cancel).run_with(&mut graph, &config).await?;

    match input.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("Run {}", report.run_id);
            for result in &report.execution.results {
                match &result.error {
                    Some(error) => println!("  {} {}: {error}", result.status, result.node_id),
                    None => println!("  {} {}", result.status, result.node_id),
                }
            }
            print!("{}", report.report);
        }
    }
    Ok(report)
}

async fn cmd_visualize(input: &InputArgs) -> Result<()> {
    let config = load_config(&input.config).await?;
    let mut graph = Graph::new();
    orchestrator(CancellationToken::new())
        .prepare(&mut graph, &config)
        .await?;
    let layout = Visualizer::layout(&graph)?;

    match input.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&layout)?),
        OutputFormat::Text => {
            for node in &layout.nodes {
                println!("[{}] {} ({}, {})", node.layer, node.id, node.x, node.y);
            }
            print!("{}", Visualizer::render_report(&graph.statistics()));
        }
    }
    Ok(())
}
