//! Agent port: the sole boundary where external I/O to a model provider
//! lives. The engine treats implementations as opaque.

pub mod claude_code;
pub mod scripted;
pub mod session;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TaktError};

pub use claude_code::ClaudeCodeRunner;
pub use scripted::ScriptedRunner;
pub use session::{SessionKey, SessionRegistry};

/// Outcome status of an agent call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Done,
    Error,
}

/// Response from one agent invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Persona the call ran under
    pub persona: String,

    /// Whether the provider finished normally
    pub status: AgentStatus,

    /// Full response text
    pub content: String,

    /// When the response settled
    pub timestamp: DateTime<Utc>,

    /// Provider session id, when the provider supports resumption
    pub session_id: Option<String>,
}

impl AgentResponse {
    pub fn done(persona: &str, content: impl Into<String>) -> Self {
        Self {
            persona: persona.to_string(),
            status: AgentStatus::Done,
            content: content.into(),
            timestamp: crate::utils::time::now(),
            session_id: None,
        }
    }

    pub fn error(persona: &str, content: impl Into<String>) -> Self {
        Self {
            persona: persona.to_string(),
            status: AgentStatus::Error,
            content: content.into(),
            timestamp: crate::utils::time::now(),
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == AgentStatus::Error
    }
}

/// Kind of incremental output forwarded to stream consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    Text,
    Tool,
    System,
}

/// An incremental output event for TUI rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    pub data: String,
}

/// Callback receiving incremental agent output
pub type StreamSink = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Options for one agent invocation.
///
/// `task_prefix` and `task_color_index` must both be set or both absent;
/// they exist only for parallel worker-pool output labelling.
#[derive(Clone, Default)]
pub struct AgentRunOptions {
    /// Working directory the agent operates in
    pub cwd: PathBuf,

    /// Directory report files are written to (Phase 2)
    pub report_dir: Option<PathBuf>,

    /// Session id to tag the call with
    pub session_id: Option<String>,

    /// Session id to resume, when the provider supports it
    pub resume_session_id: Option<String>,

    /// Tools the provider may use
    pub allowed_tools: Option<Vec<String>>,

    /// Provider permission mode
    pub permission_mode: Option<String>,

    /// Provider identifier override
    pub provider: Option<String>,

    /// Model override
    pub model: Option<String>,

    /// Shared abort signal; implementations must return promptly once fired
    pub cancel: CancellationToken,

    /// Incremental output sink
    pub on_stream: Option<StreamSink>,

    /// Short task label shown before streamed lines (parallel mode)
    pub task_prefix: Option<String>,

    /// Deterministic color slot for the prefix (parallel mode)
    pub task_color_index: Option<usize>,
}

impl std::fmt::Debug for AgentRunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRunOptions")
            .field("cwd", &self.cwd)
            .field("report_dir", &self.report_dir)
            .field("session_id", &self.session_id)
            .field("resume_session_id", &self.resume_session_id)
            .field("allowed_tools", &self.allowed_tools)
            .field("permission_mode", &self.permission_mode)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("task_prefix", &self.task_prefix)
            .field("task_color_index", &self.task_color_index)
            .finish()
    }
}

impl AgentRunOptions {
    /// Enforce the prefix/color pairing invariant
    pub fn validate(&self) -> Result<()> {
        match (&self.task_prefix, &self.task_color_index) {
            (Some(_), None) | (None, Some(_)) => Err(TaktError::config(
                "task_prefix and task_color_index must both be set or both absent",
            )),
            _ => Ok(()),
        }
    }

    /// Forward an event to the stream sink, when one is attached
    pub fn stream(&self, kind: StreamEventKind, data: impl Into<String>) {
        if let Some(sink) = &self.on_stream {
            sink(StreamEvent {
                kind,
                data: data.into(),
            });
        }
    }
}

/// Thin abstraction over an LLM call.
///
/// Implementations must observe `options.cancel`: once the token fires, any
/// in-flight provider request is aborted and an `Error`-status response is
/// returned without unbounded delay.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one agent invocation with the given persona and instruction
    async fn run(&self, persona: &str, task: &str, options: AgentRunOptions)
        -> Result<AgentResponse>;
}
