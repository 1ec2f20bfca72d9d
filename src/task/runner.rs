//! Worker pool: bounded-concurrency dispatch of task executions.
//!
//! The pool keeps up to `concurrency` piece executions in flight, claims
//! newly pending tasks whenever a slot frees, and polls the store on an
//! interval so tasks added mid-run are picked up too. One shared
//! cancellation token covers every in-flight execution; the CLI layer
//! connects the terminal interrupt to it.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use colored::{ColoredString, Colorize};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{AgentRunner, StreamSink};
use crate::error::Result;
use crate::piece::{EngineOptions, Piece, PieceEngine, RunStatus};
use crate::utils::text::tail_excerpt;

use super::store::TaskStore;
use super::{TaskFailure, TaskRecord};

/// Aggregate result of one pool run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolOutcome {
    pub success: usize,
    pub fail: usize,
}

/// Options applied to every task execution in a pool run
#[derive(Clone, Default)]
pub struct UserOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub language: Option<String>,
    pub user_inputs: Vec<String>,
    pub on_stream: Option<StreamSink>,
}

/// Per-dispatch options: the shared abort signal plus parallel-mode labels
#[derive(Clone, Default)]
pub struct ParallelOpts {
    pub cancel: CancellationToken,
    pub task_prefix: Option<String>,
    pub task_color_index: Option<usize>,
}

/// Deterministic prefix coloring for parallel-mode output
pub fn styled_prefix(prefix: &str, color_index: usize) -> ColoredString {
    match color_index % 6 {
        0 => prefix.blue(),
        1 => prefix.green(),
        2 => prefix.magenta(),
        3 => prefix.cyan(),
        4 => prefix.yellow(),
        _ => prefix.bright_blue(),
    }
}

/// Execute one claimed task through a piece engine and record the terminal
/// outcome in the store. Returns whether the task succeeded.
///
/// Failures are recorded with the offending movement, the error text, and
/// an excerpt of the last agent message; they never propagate to the pool.
pub async fn execute_and_complete_task(
    task: TaskRecord,
    store: Arc<TaskStore>,
    cwd: PathBuf,
    piece: Arc<Piece>,
    agent: Arc<dyn AgentRunner>,
    user_options: UserOptions,
    parallel: ParallelOpts,
) -> bool {
    if let (Some(prefix), Some(color)) = (&parallel.task_prefix, parallel.task_color_index) {
        info!("[{}] starting piece '{}'", styled_prefix(prefix, color), piece.name);
    } else {
        info!("Starting piece '{}' for task '{}'", piece.name, task.name);
    }

    let options = EngineOptions {
        provider: user_options.provider,
        model: user_options.model,
        permission_mode: user_options.permission_mode,
        language: user_options.language,
        user_inputs: user_options.user_inputs,
        on_stream: user_options.on_stream,
        start_movement: task.start_movement.clone(),
        cancel: parallel.cancel,
        task_prefix: parallel.task_prefix,
        task_color_index: parallel.task_color_index,
        ..Default::default()
    };

    let mut engine = match PieceEngine::new(
        piece,
        &cwd,
        &task.effective_content(),
        agent,
        options,
    ) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Engine construction failed for task '{}': {}", task.name, e);
            record_failure(&store, &task.name, None, &e.to_string(), None).await;
            return false;
        }
    };

    match engine.run().await {
        Ok(state) => {
            let last_output = state
                .movement_outputs
                .get(&state.current_movement)
                .map(|o| tail_excerpt(&o.content, 500));

            match state.status {
                RunStatus::Completed => {
                    if let Err(e) = store.complete_task(&task.name, last_output).await {
                        error!("Failed to record completion of '{}': {}", task.name, e);
                        return false;
                    }
                    true
                }
                _ => {
                    let reason = state
                        .abort_reason
                        .unwrap_or_else(|| "aborted".to_string());
                    record_failure(
                        &store,
                        &task.name,
                        Some(state.current_movement),
                        &reason,
                        last_output,
                    )
                    .await;
                    false
                }
            }
        }
        Err(e) => {
            error!("Task '{}' failed with engine error: {}", task.name, e);
            record_failure(&store, &task.name, None, &e.to_string(), None).await;
            false
        }
    }
}

async fn record_failure(
    store: &TaskStore,
    name: &str,
    movement: Option<String>,
    error_text: &str,
    last_message: Option<String>,
) {
    let failure = TaskFailure {
        movement,
        error: Some(error_text.to_string()),
        last_message,
    };
    if let Err(e) = store.fail_task(name, failure).await {
        error!("Failed to record failure of '{}': {}", name, e);
    }
}

/// Run up to `concurrency` concurrent task executions until the store
/// drains (or the shared token cancels everything).
///
/// - Initial in-flight work comes from `initial_tasks` (already claimed).
/// - Freed slots claim more work immediately; a poll timer with period
///   `poll_interval_ms` claims too, so tasks added mid-run are picked up.
/// - The poll timer never outlives this call, and the pool returns only
///   after every started execution has settled.
/// - A task-level failure increments `fail` and the pool continues; a
///   store-level error cancels in-flight work and propagates.
#[allow(clippy::too_many_arguments)]
pub async fn run_with_worker_pool(
    store: Arc<TaskStore>,
    initial_tasks: Vec<TaskRecord>,
    concurrency: usize,
    cwd: &Path,
    piece: Arc<Piece>,
    agent: Arc<dyn AgentRunner>,
    user_options: UserOptions,
    poll_interval_ms: u64,
    cancel: CancellationToken,
) -> Result<PoolOutcome> {
    let concurrency = concurrency.max(1);
    let cwd = cwd.to_path_buf();

    let mut backlog: VecDeque<TaskRecord> = initial_tasks.into();
    let mut join_set: JoinSet<(usize, bool)> = JoinSet::new();
    let mut slot_busy = vec![false; concurrency];
    let mut slot_by_task_id: HashMap<tokio::task::Id, usize> = HashMap::new();
    let mut outcome = PoolOutcome::default();

    let mut poll = tokio::time::interval(Duration::from_millis(poll_interval_ms.max(1)));
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Claim and dispatch until every slot is busy or no work remains.
    macro_rules! dispatch {
        () => {{
            while join_set.len() < concurrency && !cancel.is_cancelled() {
                let task = match backlog.pop_front() {
                    Some(task) => task,
                    None => {
                        let free = concurrency - join_set.len();
                        let claimed = match store.claim_next_tasks(free).await {
                            Ok(claimed) => claimed,
                            Err(e) => {
                                // Store-level failure: stop everything
                                cancel.cancel();
                                while join_set.join_next().await.is_some() {}
                                return Err(e);
                            }
                        };
                        if claimed.is_empty() {
                            break;
                        }
                        backlog.extend(claimed);
                        continue;
                    }
                };

                let slot = slot_busy.iter().position(|busy| !busy).unwrap_or(0);
                slot_busy[slot] = true;

                let parallel = if concurrency == 1 {
                    ParallelOpts {
                        cancel: cancel.clone(),
                        ..Default::default()
                    }
                } else {
                    ParallelOpts {
                        cancel: cancel.clone(),
                        task_prefix: Some(task.name.clone()),
                        task_color_index: Some(slot),
                    }
                };

                let handle = join_set.spawn(execute_task_in_slot(
                    task,
                    slot,
                    store.clone(),
                    cwd.clone(),
                    piece.clone(),
                    agent.clone(),
                    user_options.clone(),
                    parallel,
                ));
                slot_by_task_id.insert(handle.id(), slot);
            }
        }};
    }

    dispatch!();

    loop {
        if join_set.is_empty() {
            if cancel.is_cancelled() {
                break;
            }
            dispatch!();
            if join_set.is_empty() {
                break;
            }
        }

        tokio::select! {
            joined = join_set.join_next_with_id() => {
                match joined {
                    Some(Ok((id, (slot, success)))) => {
                        slot_by_task_id.remove(&id);
                        slot_busy[slot] = false;
                        if success {
                            outcome.success += 1;
                        } else {
                            outcome.fail += 1;
                        }
                    }
                    Some(Err(join_error)) => {
                        // A panicked execution counts as a failure; the
                        // pool keeps going.
                        warn!("Task execution panicked: {}", join_error);
                        if let Some(slot) = slot_by_task_id.remove(&join_error.id()) {
                            slot_busy[slot] = false;
                        }
                        outcome.fail += 1;
                    }
                    None => {}
                }
                if !cancel.is_cancelled() {
                    dispatch!();
                }
            }
            _ = poll.tick() => {
                if !cancel.is_cancelled() {
                    dispatch!();
                }
            }
        }
    }

    info!(
        "Worker pool finished: {} succeeded, {} failed",
        outcome.success, outcome.fail
    );
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
async fn execute_task_in_slot(
    task: TaskRecord,
    slot: usize,
    store: Arc<TaskStore>,
    cwd: PathBuf,
    piece: Arc<Piece>,
    agent: Arc<dyn AgentRunner>,
    user_options: UserOptions,
    parallel: ParallelOpts,
) -> (usize, bool) {
    let success =
        execute_and_complete_task(task, store, cwd, piece, agent, user_options, parallel).await;
    (slot, success)
}
