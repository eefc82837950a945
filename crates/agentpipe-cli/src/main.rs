//! agentpipe CLI

use std::path::PathBuf;
use std::sync::Arc;

use agentpipe_agent::ClaudeAgentRuntime;
use agentpipe_core::condition::TemplateConditionEvaluator;
use agentpipe_core::context_reducer::ContextReducer;
use agentpipe_core::group_orchestrator::GroupOrchestrator;
use agentpipe_core::handover::FileHandoverStore;
use agentpipe_core::notifications::{FanOutDispatcher, LoggingNotificationSink};
use agentpipe_core::parallel_executor::ParallelExecutor;
use agentpipe_core::stage_executor::StageExecutor;
use agentpipe_core::state::FileStateStore;
use agentpipe_core::{AbortHandle, PipelineConfig, PipelineRunner, RunOptions};
use agentpipe_git::{CliGitOps, GhPrOps};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn init_logging(verbose: u8, quiet: bool, json: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter =
        EnvFilter::from_default_env().add_directive(format!("agentpipe={}", level).parse()?);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .with_file(verbose >= 3)
        .with_line_number(verbose >= 3);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "agentpipe")]
#[command(about = "Runs declarative multi-stage agent pipelines")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory pipeline run state and handover files are written under.
    #[arg(long, env = "AGENTPIPE_STATE_DIR", default_value = ".agentpipe/state")]
    state_dir: String,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(short, long, global = true)]
    quiet: bool,

    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs a pipeline defined in a YAML config file to completion.
    Run {
        /// Path to the pipeline YAML config.
        config: PathBuf,

        /// Repository directory the pipeline operates against.
        #[arg(long, default_value = ".")]
        repo_dir: PathBuf,

        /// Validate the plan and report what would run, without calling any agent.
        #[arg(long)]
        dry_run: bool,

        /// Upper bound on loop-mode iterations.
        #[arg(long, default_value_t = 1)]
        max_loop_iterations: u32,
    },
    /// Parses and validates a pipeline config without running it.
    Validate { config: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.log_json)?;

    match cli.command {
        Commands::Run {
            config,
            repo_dir,
            dry_run,
            max_loop_iterations,
        } => run(&cli.state_dir, &config, &repo_dir, dry_run, max_loop_iterations).await,
        Commands::Validate { config } => validate(&config).await,
    }
}

fn load_config(path: &PathBuf) -> Result<PipelineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading pipeline config at {}", path.display()))?;
    let config: PipelineConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing pipeline config at {}", path.display()))?;
    Ok(config)
}

async fn validate(config_path: &PathBuf) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate_name()?;
    let graph = agentpipe_core::graph::build_execution_plan(&config);
    if graph.validation.is_valid {
        info!(groups = graph.plan.groups.len(), "pipeline config is valid");
    } else {
        for err in &graph.validation.errors {
            warn!(error = %err, "validation error");
        }
        anyhow::bail!("pipeline config is invalid");
    }
    for warning in &graph.validation.warnings {
        warn!(warning, "validation warning");
    }
    Ok(())
}

async fn run(
    state_dir: &str,
    config_path: &PathBuf,
    repo_dir: &PathBuf,
    dry_run: bool,
    max_loop_iterations: u32,
) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate_name()?;

    let run_id = Uuid::new_v4();
    let state_dir = PathBuf::from(state_dir);

    let git = Arc::new(CliGitOps::new(repo_dir.clone()));
    let pr: Option<Arc<dyn agentpipe_core::git_ops::PrOps>> = if config.pull_request.is_some() {
        match GhPrOps::discover().await {
            Ok(ops) => Some(Arc::new(ops) as Arc<dyn agentpipe_core::git_ops::PrOps>),
            Err(e) => {
                warn!(error = %e, "could not discover gh repo, pull request creation disabled");
                None
            }
        }
    } else {
        None
    };

    let handover = Arc::new(FileHandoverStore::new(state_dir.join("handover"), run_id));
    let state_store = Arc::new(FileStateStore::new(state_dir.join("runs")));

    let api_key = std::env::var("ANTHROPIC_API_KEY")
        .context("ANTHROPIC_API_KEY must be set to run agent stages")?;
    let runtime = Arc::new(ClaudeAgentRuntime::new(api_key));

    let stage_executor = Arc::new(StageExecutor::new(handover.clone(), git.clone()));
    let parallel_executor = Arc::new(ParallelExecutor::new(stage_executor));
    let context_reducer = Arc::new(ContextReducer::new(handover.clone()));
    let condition_evaluator = Arc::new(TemplateConditionEvaluator);
    let dispatcher = Arc::new(FanOutDispatcher::new(vec![Arc::new(LoggingNotificationSink)]));

    let group_orchestrator = Arc::new(GroupOrchestrator::new(
        condition_evaluator,
        context_reducer,
        parallel_executor,
        state_store.clone(),
        dispatcher.clone(),
    ));

    let runner = PipelineRunner::new(
        git,
        pr,
        handover,
        state_store,
        group_orchestrator,
        dispatcher,
        runtime,
    );

    let options = RunOptions {
        dry_run,
        max_loop_iterations,
        on_state_change: None,
        on_output: Some(Arc::new(|chunk: &str| {
            print!("{chunk}");
        })),
    };

    let abort = AbortHandle::new();
    let abort_ctrl_c = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received interrupt, aborting pipeline run");
            abort_ctrl_c.abort();
        }
    });

    let final_state = runner.run_pipeline(config, options, abort).await;
    info!(status = ?final_state.status, run_id = %final_state.run_id, "pipeline run finished");

    if final_state.status == agentpipe_core::model::RunStatus::Failed {
        anyhow::bail!("pipeline run failed");
    }
    Ok(())
}
