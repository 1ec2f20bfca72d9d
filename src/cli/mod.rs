//! CLI surface for takt.
//!
//! Thin layer over the task store and worker pool: it resolves the piece,
//! seeds tasks, wires the terminal interrupt to the shared cancellation
//! token, and maps outcomes to exit codes (0 success, 1 operational
//! failure, 130 interruption).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentRunner, ClaudeCodeRunner};
use crate::config::{ProjectLayout, TaktConfig};
use crate::piece::Piece;
use crate::task::{
    run_with_worker_pool, TaskSeed, TaskStatus, TaskStore, UserOptions,
};

/// Exit code for a clean run
pub const EXIT_OK: i32 = 0;
/// Exit code for operational failures
pub const EXIT_FAILURE: i32 = 1;
/// Exit code when the run was interrupted
pub const EXIT_INTERRUPTED: i32 = 130;

/// takt - piece-driven agent workflow orchestrator
#[derive(Parser)]
#[command(name = "takt")]
#[command(about = "Piece-driven AI agent workflow orchestrator")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(short, long, default_value = ".")]
    pub project: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run pending tasks (or ad-hoc TASK texts) through a piece
    Run {
        /// Piece name or YAML path; defaults to the configured piece
        #[arg(long)]
        piece: Option<String>,

        /// Concurrent task executions
        #[arg(long)]
        concurrency: Option<usize>,

        /// Poll interval for newly added tasks, in milliseconds
        #[arg(long)]
        poll_interval_ms: Option<u64>,

        /// Extra user inputs injected into every instruction
        #[arg(long = "input", value_name = "TEXT")]
        user_inputs: Vec<String>,

        /// Ad-hoc task texts; added to the store before running
        tasks: Vec<String>,
    },

    /// Add a task to the store
    Add {
        /// Unique task name
        name: String,

        /// Task text
        content: Vec<String>,

        /// Piece override for this task
        #[arg(long)]
        piece: Option<String>,
    },

    /// List task records
    Tasks,

    /// Requeue a failed or completed task
    Retry {
        /// Task name
        name: String,

        /// Movement to restart from
        #[arg(long)]
        from: Option<String>,

        /// Note appended to the task text on retry
        #[arg(long)]
        note: Option<String>,
    },

    /// Remove a task record
    Remove {
        /// Task name
        name: String,
    },

    /// List pieces available in the catalog
    Pieces,
}

/// Entry point called by `main`; returns the process exit code.
pub async fn execute(cli: Cli) -> Result<i32> {
    let layout = ProjectLayout::new(&cli.project);
    let config = TaktConfig::load(&cli.project)?;
    let store = Arc::new(TaskStore::new(layout.tasks_file()));

    match cli.command {
        Commands::Run {
            piece,
            concurrency,
            poll_interval_ms,
            user_inputs,
            tasks,
        } => {
            run_command(
                &cli.project,
                &layout,
                &config,
                store,
                piece,
                concurrency,
                poll_interval_ms,
                user_inputs,
                tasks,
            )
            .await
        }
        Commands::Add {
            name,
            content,
            piece,
        } => {
            let content = content.join(" ");
            store
                .add_task(
                    &name,
                    &content,
                    TaskSeed {
                        piece,
                        ..Default::default()
                    },
                )
                .await?;
            println!("Added task '{}'", name);
            Ok(EXIT_OK)
        }
        Commands::Tasks => {
            let tasks = store.list().await?;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in tasks {
                let status = match task.status {
                    TaskStatus::Pending => "pending".yellow(),
                    TaskStatus::Running => "running".blue(),
                    TaskStatus::Completed => "completed".green(),
                    TaskStatus::Failed => "failed".red(),
                };
                println!("{:<12} {} - {}", status, task.name, task.content);
                if let Some(failure) = &task.failure {
                    if let Some(error) = &failure.error {
                        println!("             ^ {}", error.dimmed());
                    }
                }
            }
            Ok(EXIT_OK)
        }
        Commands::Retry { name, from, note } => {
            store
                .requeue_task(
                    &name,
                    &[TaskStatus::Failed, TaskStatus::Completed],
                    from,
                    note,
                )
                .await?;
            println!("Requeued task '{}'; run `takt run` to execute.", name);
            Ok(EXIT_OK)
        }
        Commands::Remove { name } => {
            store.remove_task(&name).await?;
            println!("Removed task '{}'", name);
            Ok(EXIT_OK)
        }
        Commands::Pieces => {
            let names = layout.list_piece_names();
            if names.is_empty() {
                println!("No pieces under {}", layout.pieces_dir().display());
            }
            for name in names {
                println!("{}", name);
            }
            Ok(EXIT_OK)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    project: &std::path::Path,
    layout: &ProjectLayout,
    config: &TaktConfig,
    store: Arc<TaskStore>,
    piece_ref: Option<String>,
    concurrency: Option<usize>,
    poll_interval_ms: Option<u64>,
    user_inputs: Vec<String>,
    ad_hoc_tasks: Vec<String>,
) -> Result<i32> {
    let recovered = store.recover_interrupted_running_tasks().await?;
    if recovered > 0 {
        warn!("Recovered {} interrupted task(s) back to pending", recovered);
    }

    for text in &ad_hoc_tasks {
        let name = ad_hoc_task_name(text);
        store
            .add_task(&name, text, TaskSeed::default())
            .await
            .with_context(|| format!("failed to add ad-hoc task '{}'", name))?;
    }

    let piece_name = piece_ref.unwrap_or_else(|| config.default_piece.clone());
    let piece_path = layout.resolve_piece_path(&piece_name)?;
    let piece = Arc::new(Piece::load_from_file(&piece_path).await?);

    let agent = build_agent(&config.provider)?;
    let concurrency = concurrency.unwrap_or(config.concurrency).max(1);
    let poll_interval_ms = poll_interval_ms.unwrap_or(config.poll_interval_ms);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling in-flight tasks");
            interrupt.cancel();
        }
    });

    let initial = store.claim_next_tasks(concurrency).await?;
    if initial.is_empty() {
        println!("No pending tasks.");
        return Ok(EXIT_OK);
    }

    info!(
        "Running piece '{}' with concurrency {} ({} initial task(s))",
        piece.name,
        concurrency,
        initial.len()
    );

    let options = UserOptions {
        provider: Some(config.provider.clone()),
        model: config.model.clone(),
        permission_mode: config.permission_mode.clone(),
        language: config.language.clone(),
        user_inputs,
        on_stream: None,
    };

    let outcome = run_with_worker_pool(
        store,
        initial,
        concurrency,
        project,
        piece,
        agent,
        options,
        poll_interval_ms,
        cancel.clone(),
    )
    .await?;

    println!(
        "{} succeeded, {} failed",
        outcome.success.to_string().green(),
        outcome.fail.to_string().red()
    );

    if cancel.is_cancelled() {
        return Ok(EXIT_INTERRUPTED);
    }
    // Individual task failures are reported through the store; the run
    // itself still exits cleanly.
    Ok(EXIT_OK)
}

/// Build the agent port for the configured provider
fn build_agent(provider: &str) -> Result<Arc<dyn AgentRunner>> {
    match provider {
        "claude-code" => Ok(Arc::new(ClaudeCodeRunner::new())),
        other => anyhow::bail!("unknown provider '{}'", other),
    }
}

/// Derive a store-safe unique name for an ad-hoc task text
fn ad_hoc_task_name(text: &str) -> String {
    let slug: String = text
        .chars()
        .take(24)
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    if slug.is_empty() {
        format!("task-{}", &suffix[..8])
    } else {
        format!("{}-{}", slug, &suffix[..8])
    }
}
