//! Cherry CLI - composition root for the task orchestration engine.
//!
//! Loads a task manifest, registers executors explicitly, runs the
//! scheduler to completion, and reports outcomes. Checkpoints let an
//! interrupted run resume with `--resume`.

mod shell;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;

use cherry_core::{TaskFilter, TaskSpec, TaskStatus};
use cherry_engine::{Scheduler, SchedulerConfig};
use cherry_storage::{CheckpointStore, JsonCheckpointStore};

use shell::ShellExecutor;

#[derive(Parser)]
#[command(name = "cherry")]
#[command(about = "Multi-agent task orchestration engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task manifest to completion
    Run {
        /// Path to the JSON task manifest
        #[arg(long)]
        tasks: PathBuf,
        /// Checkpoint file for crash recovery
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Resume from the checkpoint instead of submitting the manifest
        #[arg(long)]
        resume: bool,
        /// Max concurrently running tasks
        #[arg(long, default_value = "4")]
        max_concurrent: usize,
        /// Per-task timeout in seconds
        #[arg(long, default_value = "300")]
        task_timeout: u64,
        /// Max attempts per task
        #[arg(long, default_value = "3")]
        max_attempts: u32,
    },
    /// Summarize a checkpoint file
    Status {
        /// Checkpoint file to inspect
        #[arg(long)]
        checkpoint: PathBuf,
    },
}

/// One entry of the task manifest. Dependencies refer to earlier entries
/// by zero-based index.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    description: String,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    depends_on: Vec<usize>,
    #[serde(default)]
    command: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            tasks,
            checkpoint,
            resume,
            max_concurrent,
            task_timeout,
            max_attempts,
        } => {
            run(
                tasks,
                checkpoint,
                resume,
                max_concurrent,
                task_timeout,
                max_attempts,
            )
            .await
        }
        Commands::Status { checkpoint } => status(checkpoint).await,
    }
}

async fn run(
    tasks: PathBuf,
    checkpoint: Option<PathBuf>,
    resume: bool,
    max_concurrent: usize,
    task_timeout: u64,
    max_attempts: u32,
) -> Result<()> {
    let config = SchedulerConfig::new()
        .with_max_concurrent(max_concurrent)
        .with_task_timeout(Duration::from_secs(task_timeout))
        .with_max_attempts(max_attempts)
        .with_checkpoint_interval(Duration::from_secs(30));

    let mut scheduler = Scheduler::new(config);
    if let Some(path) = &checkpoint {
        let store: Arc<dyn CheckpointStore> = Arc::new(JsonCheckpointStore::new(path));
        scheduler = scheduler.with_checkpoint_store(store);
    }

    // Executors are wired explicitly here, never discovered at runtime.
    scheduler.register_executor("shell", Arc::new(ShellExecutor::new()), false)?;

    if resume {
        if checkpoint.is_none() {
            bail!("--resume requires --checkpoint");
        }
        if !scheduler.restore().await? {
            bail!("no checkpoint to resume from");
        }
        info!("resuming from checkpoint");
    } else {
        submit_manifest(&scheduler, &tasks)?;
    }

    let summary = scheduler.run().await?;
    println!(
        "Run finished: {} completed, {} failed, {} cancelled",
        summary.completed, summary.failed, summary.cancelled
    );

    for task in scheduler.tasks(&TaskFilter::default()) {
        println!(
            "  {} | {} | attempts {} | {}",
            task.id,
            task.status,
            task.attempt,
            task.last_error
                .as_deref()
                .or(task.result.as_deref())
                .unwrap_or("-"),
        );
    }

    if summary.failed > 0 {
        bail!("{} task(s) failed", summary.failed);
    }
    Ok(())
}

fn submit_manifest(scheduler: &Scheduler, path: &PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest {}", path.display()))?;
    let entries: Vec<ManifestEntry> =
        serde_json::from_str(&raw).context("parsing task manifest")?;

    let mut submitted = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let mut spec = TaskSpec::new(entry.description).with_priority(entry.priority);
        let requires: BTreeSet<String> = if entry.requires.is_empty() {
            // Bare entries run on the shell executor.
            std::iter::once("shell".to_string()).collect()
        } else {
            entry.requires.into_iter().collect()
        };
        spec.required_capabilities = requires;
        if let Some(command) = entry.command {
            spec = spec.with_context("command", serde_json::Value::String(command));
        }
        for dep in entry.depends_on {
            let Some(&dep_id) = submitted.get(dep) else {
                bail!("entry {index} depends on {dep}, which is not an earlier entry");
            };
            spec = spec.with_prerequisite(dep_id);
        }

        let id = scheduler.submit(spec)?;
        submitted.push(id);
    }
    info!(count = submitted.len(), "manifest submitted");
    Ok(())
}

async fn status(checkpoint: PathBuf) -> Result<()> {
    let store = JsonCheckpointStore::new(&checkpoint);
    let Some(checkpoint) = store.load().await? else {
        bail!("no checkpoint at {}", store.path().display());
    };

    println!("Checkpoint from {}", checkpoint.created_at);
    for status in [
        TaskStatus::Pending,
        TaskStatus::Eligible,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ] {
        let count = checkpoint.tasks.iter().filter(|t| t.status == status).count();
        if count > 0 {
            println!("  {status}: {count}");
        }
    }

    if !checkpoint.metrics.is_empty() {
        println!("Executors:");
        for (name, stats) in &checkpoint.metrics {
            println!(
                "  {} | {}/{} ok | avg {}ms",
                name,
                stats.successes,
                stats.attempts,
                stats.avg_duration_ms(),
            );
        }
    }
    Ok(())
}
