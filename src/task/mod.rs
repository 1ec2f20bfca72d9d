//! Durable task records and their runner.

pub mod runner;
pub mod store;

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TaktError};

pub use runner::{execute_and_complete_task, run_with_worker_pool, PoolOutcome, UserOptions};
pub use store::TaskStore;

/// Status of a task record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by a worker
    Running,
    /// Terminal: the piece run failed or was cancelled
    Failed,
    /// Terminal: the piece run completed
    Completed,
}

/// Failure details carried by a failed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Movement the run was in when it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub movement: Option<String>,

    /// Error text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Excerpt of the last agent message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

/// A durable work item persisted in `.takt/tasks.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task name, matching `^[A-Za-z0-9._-]+$`
    pub name: String,

    /// Current status
    pub status: TaskStatus,

    /// Task text handed to the piece engine
    pub content: String,

    /// Creation timestamp (claim order follows this)
    pub created_at: DateTime<Utc>,

    /// When a worker claimed the task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Piece to execute, when it differs from the project default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub piece: Option<String>,

    /// Movement to start from, for retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_movement: Option<String>,

    /// Accumulated retry notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_note: Option<String>,

    /// Branch the task runs on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Worktree the task runs in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,

    /// Failure details for failed tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,

    /// Final response excerpt for completed tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

/// Optional metadata supplied when creating a task
#[derive(Debug, Clone, Default)]
pub struct TaskSeed {
    pub piece: Option<String>,
    pub start_movement: Option<String>,
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
}

impl TaskRecord {
    /// Create a pending record
    pub fn new(name: &str, content: &str, seed: TaskSeed) -> Self {
        Self {
            name: name.to_string(),
            status: TaskStatus::Pending,
            content: content.to_string(),
            created_at: crate::utils::time::now(),
            started_at: None,
            completed_at: None,
            piece: seed.piece,
            start_movement: seed.start_movement,
            retry_note: None,
            branch: seed.branch,
            worktree_path: seed.worktree_path,
            failure: None,
            response: None,
        }
    }

    /// The task text handed to the engine: content plus accumulated retry
    /// notes.
    pub fn effective_content(&self) -> String {
        match &self.retry_note {
            Some(note) => format!("{}\n\n{}", self.content, note),
            None => self.content.clone(),
        }
    }
}

fn name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static regex"))
}

/// Validate a task name against `^[A-Za-z0-9._-]+$`
pub fn validate_task_name(name: &str) -> Result<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(TaktError::task(
            name,
            "task names may only contain letters, digits, '.', '_', and '-'",
        ))
    }
}
