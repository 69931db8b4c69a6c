//! CLI command definitions for taskpool.

use std::time::Duration;

use clap::{Args, Parser};
use futures::StreamExt;
use serde::Serialize;
use tracing::info;

use crate::config::QueueConfig;
use crate::metrics::{export_metrics, init_metrics};
use crate::pool::{ChannelEvent, QueuePool};
use crate::task::{JobRegistry, Task, TaskRecord};
use crate::worker::{WorkerPool, WorkerPoolConfig};

/// Distributed task queue over Redis.
#[derive(Parser)]
#[command(name = "taskpool")]
#[command(about = "Push, run and inspect tasks on a Redis-backed queue")]
#[command(version)]
#[command(
    long_about = "taskpool pushes tasks to named channels, runs workers that execute them, and waits for their results.\n\nTasks are written as `kind`, `kind:{json object}` or `kind:[json array]`.\n\nExample usage:\n  taskpool enqueue-wait 'sum:{\"values\":[1,2,3]}' --timeout 10\n  taskpool worker --workers 4 --channel default"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL.
    #[arg(long, env = "TASKPOOL_REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// Prefix of every key and topic.
    #[arg(long, env = "TASKPOOL_PREFIX", global = true)]
    pub prefix: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Push a task and print its id.
    Enqueue(EnqueueArgs),

    /// Push a task, wait for its result and print it.
    #[command(alias = "ew")]
    EnqueueWait(EnqueueWaitArgs),

    /// Run a task in this process without touching the store.
    RunInline(RunInlineArgs),

    /// Run a worker pool until Ctrl-C.
    Worker(WorkerArgs),

    /// Print the counters of a channel.
    Stats(ChannelArgs),

    /// List known channels.
    Channels,

    /// Print tasks in a channel's pending index.
    Pending(PendingArgs),

    /// Print push and completion events of a channel until Ctrl-C.
    Tap(ChannelArgs),

    /// Run one sweep over every channel.
    Sweep,
}

/// Scheduling options shared by the enqueue commands.
#[derive(Args, Debug, Clone, Default)]
pub struct ScheduleArgs {
    /// Target channel (defaults to the job's channel, then "default").
    #[arg(short, long)]
    pub channel: Option<String>,

    /// Caller-chosen task id; duplicates of a scheduled id are ignored.
    #[arg(long)]
    pub id: Option<String>,

    /// Seconds before the task becomes visible to workers.
    #[arg(long, default_value = "0")]
    pub delay: u64,

    /// Replace the deadline of an already delayed task with the same id.
    #[arg(long)]
    pub delay_overwrite: bool,

    /// Seconds a worker has to complete the task before it is requeued.
    #[arg(long = "task-timeout", default_value = "0")]
    pub task_timeout: u64,

    /// Drop the task instead of requeueing it when it times out.
    #[arg(long)]
    pub no_requeue: bool,
}

impl ScheduleArgs {
    fn apply(&self, mut task: Task) -> Task {
        if let Some(channel) = &self.channel {
            task = task.with_channel(channel.clone());
        }
        if let Some(id) = &self.id {
            task = task.with_id(id.clone());
        }
        task.with_delay(self.delay)
            .with_delay_overwrite(self.delay_overwrite)
            .with_timeout(self.task_timeout)
            .with_requeue_on_timeout(!self.no_requeue)
    }
}

/// Arguments for `taskpool enqueue`.
#[derive(Args, Debug)]
pub struct EnqueueArgs {
    /// Task to push.
    pub task: String,

    #[command(flatten)]
    pub schedule: ScheduleArgs,
}

/// Arguments for `taskpool enqueue-wait`.
#[derive(Args, Debug)]
pub struct EnqueueWaitArgs {
    /// Task to push.
    pub task: String,

    #[command(flatten)]
    pub schedule: ScheduleArgs,

    /// Seconds to wait for the result.
    #[arg(short, long, default_value = "10")]
    pub timeout: u64,

    /// Print the full error and the task log.
    #[arg(short, long)]
    pub debug: bool,
}

/// Arguments for `taskpool run-inline`.
#[derive(Args, Debug)]
pub struct RunInlineArgs {
    /// Task to run.
    pub task: String,

    /// Print the full error and the task log.
    #[arg(short, long)]
    pub debug: bool,
}

/// Arguments for `taskpool worker`.
#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Number of concurrent workers.
    #[arg(short, long, default_value = "4")]
    pub workers: usize,

    /// Channel to pop from; repeat for several. Defaults to every channel.
    #[arg(short, long = "channel")]
    pub channels: Vec<String>,

    /// Do not run the pending index sweeper in this process.
    #[arg(long)]
    pub no_sweep: bool,

    /// Print Prometheus metrics on shutdown.
    #[arg(long)]
    pub print_metrics: bool,
}

/// A single channel name.
#[derive(Args, Debug)]
pub struct ChannelArgs {
    pub channel: String,
}

/// Arguments for `taskpool pending`.
#[derive(Args, Debug)]
pub struct PendingArgs {
    pub channel: String,

    /// First rank to list.
    #[arg(long, default_value = "0", allow_negative_numbers = true)]
    pub start: isize,

    /// Last rank to list (inclusive, -1 for the end).
    #[arg(long, default_value = "-1", allow_negative_numbers = true)]
    pub stop: isize,
}

/// One line printed by `taskpool tap`.
#[derive(Debug, Serialize)]
struct TapLine<'a> {
    event: &'static str,
    channel: &'a str,
    record: &'a TaskRecord,
}

impl<'a> From<&'a ChannelEvent> for TapLine<'a> {
    fn from(event: &'a ChannelEvent) -> Self {
        let kind = match event {
            ChannelEvent::New { .. } => "new",
            ChannelEvent::Complete { .. } => "complete",
        };
        Self {
            event: kind,
            channel: event.channel(),
            record: event.record(),
        }
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = queue_config(&cli)?;
    let registry = JobRegistry::with_builtin_jobs();

    match cli.command {
        Commands::RunInline(args) => run_inline_command(args, &registry).await,
        Commands::Enqueue(args) => {
            let pool = QueuePool::connect(config, registry).await?;
            run_enqueue_command(args, &pool).await
        }
        Commands::EnqueueWait(args) => {
            let pool = QueuePool::connect(config, registry).await?;
            run_enqueue_wait_command(args, &pool).await
        }
        Commands::Worker(args) => {
            let pool = QueuePool::connect(config, registry).await?;
            run_worker_command(args, pool).await
        }
        Commands::Stats(args) => {
            let pool = QueuePool::connect(config, registry).await?;
            let stats = pool.channel_stats(&args.channel).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::Channels => {
            let pool = QueuePool::connect(config, registry).await?;
            for channel in pool.list_channels().await? {
                println!("{}", channel);
            }
            Ok(())
        }
        Commands::Pending(args) => {
            let pool = QueuePool::connect(config, registry).await?;
            for task in pool.pending_tasks(&args.channel, args.start, args.stop).await? {
                println!("{}", serde_json::to_string(&task.to_record()?)?);
            }
            Ok(())
        }
        Commands::Tap(args) => {
            let pool = QueuePool::connect(config, registry).await?;
            run_tap_command(args, &pool).await
        }
        Commands::Sweep => {
            let pool = QueuePool::connect(config, registry).await?;
            let report = pool.sweep_all().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

/// Environment configuration with command-line overrides applied.
fn queue_config(cli: &Cli) -> anyhow::Result<QueueConfig> {
    let mut config = QueueConfig::from_env()?;
    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url.clone());
    }
    if let Some(prefix) = &cli.prefix {
        config = config.with_prefix(prefix.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn run_enqueue_command(args: EnqueueArgs, pool: &QueuePool) -> anyhow::Result<()> {
    let mut task = args.schedule.apply(pool.registry().hydrate(&args.task)?);
    let outcome = pool.push(&mut task).await?;

    let id = task.id().map(ToString::to_string).unwrap_or_default();
    info!(task_id = %id, channel = task.channel(), outcome = outcome.as_str(), "Task pushed");
    println!("{}", id);
    if outcome.is_duplicate() {
        eprintln!("task {} is already scheduled; push ignored", id);
    }
    Ok(())
}

async fn run_enqueue_wait_command(args: EnqueueWaitArgs, pool: &QueuePool) -> anyhow::Result<()> {
    let mut task = args.schedule.apply(pool.registry().hydrate(&args.task)?);
    let resolved = pool
        .push_wait(&mut task, Duration::from_secs(args.timeout))
        .await?;
    print!("{}", render_task(&resolved, args.debug)?);
    Ok(())
}

async fn run_inline_command(args: RunInlineArgs, registry: &JobRegistry) -> anyhow::Result<()> {
    let mut task = registry.hydrate(&args.task)?;
    task.invoke().await?;
    print!("{}", render_task(&task, args.debug)?);
    Ok(())
}

async fn run_worker_command(args: WorkerArgs, pool: QueuePool) -> anyhow::Result<()> {
    if args.print_metrics {
        init_metrics()?;
    }

    let config = WorkerPoolConfig::new(args.workers)
        .with_channels(args.channels)
        .with_sweeper(!args.no_sweep);
    let mut workers = WorkerPool::new(config, pool);
    workers.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, stopping workers");
    workers.shutdown().await?;

    let stats = workers.stats();
    info!(
        completed = stats.tasks_completed,
        failed = stats.tasks_failed,
        average_ms = stats.average_task_duration.as_millis() as u64,
        "Workers stopped"
    );
    if args.print_metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

async fn run_tap_command(args: ChannelArgs, pool: &QueuePool) -> anyhow::Result<()> {
    let mut events = pool.subscribe(&args.channel).await?;
    info!(channel = %args.channel, "Listening for channel events");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.next() => match event {
                Some(event) => println!("{}", serde_json::to_string(&TapLine::from(&event))?),
                None => break,
            },
        }
    }
    Ok(())
}

/// Renders a finished task: error summary, record as JSON, and in debug
/// mode the full error and the log lines.
fn render_task(task: &Task, debug: bool) -> anyhow::Result<String> {
    let mut out = String::new();

    if let Some(exception) = task.exception() {
        let text = exception.to_string();
        let summary = if debug {
            text.as_str()
        } else {
            text.lines().next().unwrap_or_default()
        };
        out.push_str(&format!("error: {}\n", summary));
    }

    out.push_str(&serde_json::to_string_pretty(&task.to_record()?)?);
    out.push('\n');

    if debug && !task.log_lines().is_empty() {
        out.push_str("log:\n");
        for line in task.log_lines() {
            out.push_str(&format!("  {}\n", line));
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::jobs::{Echo, Fail};

    #[test]
    fn test_parse_enqueue_with_schedule() {
        let cli = Cli::try_parse_from([
            "taskpool",
            "enqueue",
            "sum:[[1,2]]",
            "--channel",
            "math",
            "--id",
            "job-1",
            "--delay",
            "5",
            "--task-timeout",
            "30",
            "--no-requeue",
        ])
        .unwrap();

        let Commands::Enqueue(args) = cli.command else {
            panic!("expected enqueue");
        };
        assert_eq!(args.task, "sum:[[1,2]]");
        assert_eq!(args.schedule.channel.as_deref(), Some("math"));

        let task = args.schedule.apply(Task::new(Echo::new("x")));
        assert_eq!(task.channel(), "math");
        assert_eq!(task.id().map(|id| id.as_str()), Some("job-1"));
        assert_eq!(task.schedule().delay_seconds, 5);
        assert_eq!(task.schedule().timeout_seconds, 30);
        assert!(!task.schedule().requeue_on_timeout);
    }

    #[test]
    fn test_parse_worker_channels() {
        let cli = Cli::try_parse_from([
            "taskpool", "worker", "-w", "2", "-c", "a", "-c", "b", "--no-sweep",
        ])
        .unwrap();
        let Commands::Worker(args) = cli.command else {
            panic!("expected worker");
        };
        assert_eq!(args.workers, 2);
        assert_eq!(args.channels, vec!["a", "b"]);
        assert!(args.no_sweep);
    }

    #[test]
    fn test_parse_global_log_level() {
        let cli = Cli::try_parse_from(["taskpool", "channels", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Channels));
    }

    #[tokio::test]
    async fn test_render_success_with_log() {
        let mut task = Task::new(Echo::new("hi")).with_id("7");
        task.invoke().await.unwrap();

        let quiet = render_task(&task, false).unwrap();
        assert!(!quiet.starts_with("error:"));
        assert!(quiet.contains("\"reply\": \"hi\""));
        assert!(!quiet.contains("log:"));

        let verbose = render_task(&task, true).unwrap();
        assert!(verbose.contains("log:\n  echo: hi\n"));
    }

    #[tokio::test]
    async fn test_render_error_summary() {
        let mut task = Task::new(Fail::new("first line\nsecond line"));
        task.invoke().await.unwrap();
        assert_eq!(
            task.exception(),
            Some(&TaskError::Failed("first line\nsecond line".to_string()))
        );

        let quiet = render_task(&task, false).unwrap();
        assert!(quiet.starts_with("error: Task failed: first line\n{"));

        let verbose = render_task(&task, true).unwrap();
        assert!(verbose.starts_with("error: Task failed: first line\nsecond line\n"));
    }
}
