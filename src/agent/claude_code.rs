//! Claude Code provider: drives the `claude` CLI as a subprocess.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, TaktError};

use super::{AgentResponse, AgentRunOptions, AgentRunner, StreamEventKind};

/// Claude Code executor configuration
#[derive(Debug, Clone)]
pub struct ClaudeCodeRunner {
    /// Binary to invoke
    pub command: String,
    /// Default model when neither movement nor options override it
    pub model: Option<String>,
    /// Request JSON output so session ids can be recovered
    pub json_output: bool,
}

impl Default for ClaudeCodeRunner {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            model: None,
            json_output: true,
        }
    }
}

/// Shape of `claude --output-format json` responses
#[derive(Debug, Deserialize)]
struct ClaudeJsonResult {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    is_error: Option<bool>,
}

impl ClaudeCodeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Build Claude Code command arguments for one invocation
    fn build_args(&self, persona: &str, task: &str, options: &AgentRunOptions) -> Vec<String> {
        let mut args = vec!["-p".to_string(), task.to_string()];

        if !persona.is_empty() {
            args.push("--append-system-prompt".to_string());
            args.push(persona.to_string());
        }

        if self.json_output {
            args.push("--output-format".to_string());
            args.push("json".to_string());
        }

        if let Some(model) = options.model.as_ref().or(self.model.as_ref()) {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if let Some(tools) = &options.allowed_tools {
            if !tools.is_empty() {
                args.push("--allowed-tools".to_string());
                args.push(tools.join(","));
            }
        }

        if let Some(mode) = &options.permission_mode {
            args.push("--permission-mode".to_string());
            args.push(mode.clone());
        }

        if let Some(session) = &options.resume_session_id {
            args.push("--resume".to_string());
            args.push(session.clone());
        }

        args
    }

    /// Parse the provider output into a response
    fn parse_output(&self, persona: &str, stdout: String) -> AgentResponse {
        if self.json_output {
            if let Ok(parsed) = serde_json::from_str::<ClaudeJsonResult>(&stdout) {
                let content = parsed.result.unwrap_or_else(|| stdout.clone());
                let mut response = if parsed.is_error.unwrap_or(false) {
                    AgentResponse::error(persona, content)
                } else {
                    AgentResponse::done(persona, content)
                };
                response.session_id = parsed.session_id;
                return response;
            }
            warn!("Claude Code output was not valid JSON; using raw text");
        }
        AgentResponse::done(persona, stdout)
    }
}

#[async_trait]
impl AgentRunner for ClaudeCodeRunner {
    async fn run(
        &self,
        persona: &str,
        task: &str,
        options: AgentRunOptions,
    ) -> Result<AgentResponse> {
        options.validate()?;

        if options.cancel.is_cancelled() {
            return Ok(AgentResponse::error(persona, "cancelled"));
        }

        let args = self.build_args(persona, task, &options);
        debug!(
            "Executing {} for persona '{}' in {}",
            self.command,
            persona,
            options.cwd.display()
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(&args)
            .current_dir(&options.cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| TaktError::Agent {
            persona: persona.to_string(),
            message: format!("failed to spawn '{}'", self.command),
            source: Some(Box::new(e)),
        })?;

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let output = tokio::select! {
            result = &mut wait => result.map_err(|e| TaktError::Agent {
                persona: persona.to_string(),
                message: "provider process failed".to_string(),
                source: Some(Box::new(e)),
            })?,
            _ = options.cancel.cancelled() => {
                // Dropping the wait future kills the child (kill_on_drop)
                return Ok(AgentResponse::error(persona, "cancelled"));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            // Sometimes the CLI writes to stderr even on success
            let body = if stdout.trim().is_empty() && !stderr.trim().is_empty() {
                stderr
            } else {
                stdout
            };
            let response = self.parse_output(persona, body);
            options.stream(StreamEventKind::Text, response.content.clone());
            Ok(response)
        } else {
            let message = format!(
                "provider exited with {:?}\nStderr: {}\nStdout: {}",
                output.status.code(),
                stderr,
                stdout
            );
            options.stream(StreamEventKind::System, message.clone());
            Ok(AgentResponse::error(persona, message))
        }
    }
}
