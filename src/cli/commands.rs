//! CLI command definitions for taskflow.
//!
//! `worker` runs a scheduler against Redis; `push`, `cancel` and `result`
//! talk to the same Redis keys directly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{Backend, BackendError, RedisBackend};
use crate::config::{RedisConfig, SchedulerConfig};
use crate::error::{SchedulerError, TaskError};
use crate::metrics::SchedulerMetrics;
use crate::scheduler::Scheduler;

/// Task type served by the built-in pipeline.
pub const ECHO_TASK_TYPE: &str = "echo";

/// Redis-backed task scheduler.
#[derive(Parser, Debug)]
#[command(name = "taskflow")]
#[command(about = "Run and feed a Redis-backed task scheduler")]
#[command(version)]
#[command(
    long_about = "taskflow pops tasks from a Redis priority queue and runs them through per-type stage pipelines.\n\nExample usage:\n  taskflow worker --redis-url redis://localhost:6379\n  taskflow push --data '{\"hello\":\"world\"}'\n  taskflow result 1"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run a scheduler until Ctrl-C.
    Worker(WorkerArgs),

    /// Enqueue a task.
    Push(PushArgs),

    /// Remove a task that has not been popped yet.
    Cancel(TaskIdArgs),

    /// Print the recorded outcome of a task.
    Result(TaskIdArgs),
}

/// Connection options shared by every subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct RedisArgs {
    /// Redis connection URL.
    #[arg(long, env = "TASKFLOW_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Prefix for every Redis key.
    #[arg(long, env = "TASKFLOW_KEY_PREFIX")]
    pub key_prefix: Option<String>,
}

impl RedisArgs {
    fn to_config(&self) -> anyhow::Result<RedisConfig> {
        let mut config = RedisConfig::from_env()?;
        if let Some(url) = &self.redis_url {
            config.url = url.clone();
        }
        if let Some(prefix) = &self.key_prefix {
            config.key_prefix = prefix.clone();
        }
        config.validate()?;
        Ok(config)
    }

    async fn connect(&self) -> anyhow::Result<RedisBackend> {
        let config = self.to_config()?;
        let url = config.url.clone();
        RedisBackend::connect(config)
            .await
            .with_context(|| format!("failed to connect to {}", url))
    }
}

/// Arguments for `taskflow worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub redis: RedisArgs,

    /// Wait buffer capacity (overrides TASKFLOW_WAIT_BUFFER).
    #[arg(long)]
    pub wait_buffer: Option<usize>,

    /// Print Prometheus metrics on shutdown.
    #[arg(long)]
    pub print_metrics: bool,
}

/// Arguments for `taskflow push`.
#[derive(Parser, Debug)]
pub struct PushArgs {
    #[command(flatten)]
    pub redis: RedisArgs,

    /// Task type.
    #[arg(short = 't', long = "type", default_value = ECHO_TASK_TYPE)]
    pub task_type: String,

    /// JSON payload.
    #[arg(short, long, default_value = "null")]
    pub data: String,

    /// Timeout in milliseconds (0 means none).
    #[arg(long, default_value = "0")]
    pub timeout_ms: u64,

    /// Priority; lower pops first.
    #[arg(short, long, default_value = "0", allow_negative_numbers = true)]
    pub priority: i64,
}

/// Arguments for commands addressing one task.
#[derive(Parser, Debug)]
pub struct TaskIdArgs {
    #[command(flatten)]
    pub redis: RedisArgs,

    /// Task id as returned by `push`.
    pub id: String,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Push(args) => run_push_command(args).await,
        Commands::Cancel(args) => run_cancel_command(args).await,
        Commands::Result(args) => run_result_command(args).await,
    }
}

/// Registers the pipelines served by `taskflow worker`.
pub fn register_builtin_pipelines(scheduler: &Scheduler) {
    scheduler.register(ECHO_TASK_TYPE, "reply", |_ctx, task, _input| async move {
        Ok::<_, TaskError>(task.data().clone())
    });
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    let mut config = SchedulerConfig::from_env()?;
    if let Some(capacity) = args.wait_buffer {
        config = config.with_wait_buffer(capacity);
    }
    config.validate()?;

    let backend = args.redis.connect().await?;
    let metrics = SchedulerMetrics::new()?;
    let scheduler = Scheduler::new(config, Arc::new(backend)).with_metrics(metrics.clone());
    register_builtin_pipelines(&scheduler);
    let scheduler = Arc::new(scheduler);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        signal.cancel();
    });

    // BackendUnavailable ends the process with a non-zero status
    Arc::clone(&scheduler).run(shutdown).await?;

    let stats = scheduler.stats();
    info!(
        completed = stats.completed,
        failed = stats.failed,
        timed_out = stats.timed_out,
        canceled = stats.canceled,
        panicked = stats.panicked,
        success_rate = stats.success_rate(),
        "Worker finished"
    );

    if args.print_metrics {
        print!("{}", metrics.export());
    }
    Ok(())
}

async fn run_push_command(args: PushArgs) -> anyhow::Result<()> {
    let data: Value = serde_json::from_str(&args.data).context("--data is not valid JSON")?;

    let backend = args.redis.connect().await?;
    let id = push_builtin(Arc::new(backend), &args, data).await?;

    println!("{}", id);
    Ok(())
}

/// Enqueues through a scheduler carrying the built-in pipelines, so a task
/// type no worker serves never reaches the queue.
async fn push_builtin(
    backend: Arc<dyn Backend>,
    args: &PushArgs,
    data: Value,
) -> Result<String, SchedulerError> {
    let timeout = (args.timeout_ms > 0).then(|| Duration::from_millis(args.timeout_ms));
    let producer = Scheduler::new(SchedulerConfig::default(), backend);
    register_builtin_pipelines(&producer);

    producer
        .push_with_priority(&args.task_type, data, timeout, args.priority)
        .await
}

async fn run_cancel_command(args: TaskIdArgs) -> anyhow::Result<()> {
    let backend = args.redis.connect().await?;
    match backend.cancel_task(&args.id).await {
        Ok(()) => {
            println!("canceled {}", args.id);
            Ok(())
        }
        Err(BackendError::NotFound(_)) => {
            anyhow::bail!("task {} is not queued (unknown, running or finished)", args.id)
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_result_command(args: TaskIdArgs) -> anyhow::Result<()> {
    let backend = args.redis.connect().await?;
    let record = backend
        .get_result(&args.id)
        .await?
        .with_context(|| format!("no result recorded for task {}", args.id))?;

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
