use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use wavefront::core::{GraphId, TaskGraph, TaskSpec};
use wavefront::orchestration::{HandlerRegistry, Orchestrator, RunEvent, RunReport, Scheduler};
use wavefront::state::{CheckpointSlot, CheckpointStore, FileCheckpointStore};
use wavefront::{wlog, Config, Error, Result};

/// Wavefront - dependency-graph task orchestrator
#[derive(Parser, Debug)]
#[command(name = "wavefront")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    WAVEFRONT_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.wavefront/wavefront.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (defaults to ~/.wavefront/wavefront.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Check a task file for cycles, missing dependencies and infeasible tasks
    Validate {
        /// Task definitions (.json or .toml)
        file: PathBuf,
    },

    /// Print the wave plan for a task file
    Plan {
        /// Task definitions (.json or .toml)
        file: PathBuf,
    },

    /// Submit and run a task file, printing events as JSON lines
    Run {
        /// Task definitions (.json or .toml)
        file: PathBuf,

        /// Only print the final report
        #[arg(long, short = 'q')]
        quiet: bool,
    },

    /// Resume a graph from its latest checkpoint
    Resume {
        /// Graph id printed by `run`
        graph_id: String,

        /// Only print the final report
        #[arg(long, short = 'q')]
        quiet: bool,
    },

    /// Print the latest checkpoint of a graph
    Checkpoint {
        /// Graph id printed by `run`
        graph_id: String,

        /// Show the previous checkpoint instead
        #[arg(long)]
        previous: bool,
    },
}

/// Task files hold either a bare list of tasks or a `tasks` table.
#[derive(Deserialize)]
#[serde(untagged)]
enum TaskFile {
    List(Vec<TaskSpec>),
    Table { tasks: Vec<TaskSpec> },
}

impl TaskFile {
    fn into_specs(self) -> Vec<TaskSpec> {
        match self {
            TaskFile::List(tasks) | TaskFile::Table { tasks } => tasks,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    wavefront::log::init(cli.debug);

    match run_command(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            wlog!("Command failed: {}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_command(cli: Cli) -> Result<bool> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    wlog!("Command: {:?}", cli.command);

    match cli.command {
        Command::Validate { file } => run_validate(&file, &config),
        Command::Plan { file } => run_plan(&file, &config),
        Command::Run { file, quiet } => {
            let specs = load_specs(&file)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let orchestrator = Orchestrator::from_config(config, HandlerRegistry::with_builtins())?;
                let events = orchestrator.subscribe();
                let graph_id = orchestrator.submit_graph(specs).await?;
                println!("{}", serde_json::json!({ "graph_id": graph_id.to_string() }));
                orchestrator.start(graph_id).await?;
                follow(&orchestrator, graph_id, events, quiet).await
            })
        }
        Command::Resume { graph_id, quiet } => {
            let graph_id = parse_graph_id(&graph_id)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let orchestrator = Orchestrator::from_config(config, HandlerRegistry::with_builtins())?;
                let events = orchestrator.subscribe();
                orchestrator.resume(graph_id).await?;
                follow(&orchestrator, graph_id, events, quiet).await
            })
        }
        Command::Checkpoint { graph_id, previous } => {
            let graph_id = parse_graph_id(&graph_id)?;
            let store = FileCheckpointStore::new(config.checkpoints_dir()?);
            let slot = if previous {
                CheckpointSlot::Previous
            } else {
                CheckpointSlot::Current
            };
            match store.load(graph_id, slot)? {
                Some(checkpoint) => {
                    println!("{}", serde_json::to_string_pretty(&checkpoint)?);
                    Ok(true)
                }
                None => {
                    eprintln!("No checkpoint for graph {}", graph_id);
                    Ok(false)
                }
            }
        }
    }
}

fn run_validate(file: &Path, config: &Config) -> Result<bool> {
    let specs = load_specs(file)?;
    let outcome = TaskGraph::from_specs(specs)
        .and_then(|graph| Scheduler::new(config.capacity).schedule(&graph).map(|plan| (graph, plan)));
    match outcome {
        Ok((graph, plan)) => {
            let summary = serde_json::json!({
                "valid": true,
                "tasks": graph.len(),
                "dependencies": graph.edge_count(),
                "waves": plan.wave_count(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(true)
        }
        Err(e) => {
            let summary = serde_json::json!({ "valid": false, "error": e.to_string() });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(false)
        }
    }
}

fn run_plan(file: &Path, config: &Config) -> Result<bool> {
    let graph = TaskGraph::from_specs(load_specs(file)?)?;
    let plan = Scheduler::new(config.capacity).schedule(&graph)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(true)
}

/// Print events for one graph until its run finishes, then the report.
async fn follow(
    orchestrator: &Orchestrator,
    graph_id: GraphId,
    mut events: tokio::sync::broadcast::Receiver<RunEvent>,
    quiet: bool,
) -> Result<bool> {
    if !quiet {
        let printer = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.graph_id() == graph_id => {
                        if let Ok(line) = serde_json::to_string(&event) {
                            println!("{}", line);
                        }
                        if matches!(event, RunEvent::RunFinished { .. }) {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        eprintln!("warning: {} events dropped", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let report = orchestrator.wait(graph_id).await?;
        let _ = printer.await;
        print_report(&report)
    } else {
        let report = orchestrator.wait(graph_id).await?;
        print_report(&report)
    }
}

fn print_report(report: &RunReport) -> Result<bool> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(report.success)
}

fn load_specs(file: &Path) -> Result<Vec<TaskSpec>> {
    let contents = std::fs::read_to_string(file)?;
    let parsed: TaskFile = match file.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&contents)?,
        _ => serde_json::from_str(&contents)?,
    };
    Ok(parsed.into_specs())
}

fn parse_graph_id(raw: &str) -> Result<GraphId> {
    raw.parse().map_err(|e: uuid::Error| Error::InvalidGraphId {
        id: raw.to_string(),
        reason: e.to_string(),
    })
}
