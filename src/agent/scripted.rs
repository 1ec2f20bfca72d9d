//! Scripted agent runner: replays canned responses.
//!
//! Backs the test suites and `--dry-run` style experiments; no provider
//! process is involved. Responses come from per-persona scripts first,
//! then a shared FIFO queue, then the default response.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

use super::{AgentResponse, AgentRunOptions, AgentRunner, StreamEventKind};

/// Replays canned responses in order
#[derive(Default)]
pub struct ScriptedRunner {
    queue: Mutex<VecDeque<String>>,
    persona_scripts: Mutex<HashMap<String, VecDeque<String>>>,
    default_response: Mutex<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<(String, String)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the shared FIFO queue
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let runner = Self::new();
        for response in responses {
            runner.push_response(response);
        }
        runner
    }

    /// Simulate provider latency per call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Response used when both the persona script and the queue are empty
    pub fn with_default(self, response: impl Into<String>) -> Self {
        *self.default_response.lock().unwrap() = response.into();
        self
    }

    /// Append a response to the shared FIFO queue
    pub fn push_response(&self, response: impl Into<String>) {
        self.queue.lock().unwrap().push_back(response.into());
    }

    /// Append a response to one persona's script.
    ///
    /// Persona scripts win over the shared queue, which keeps parallel
    /// sub-movement scripting deterministic.
    pub fn push_persona_response(&self, persona: impl Into<String>, response: impl Into<String>) {
        self.persona_scripts
            .lock()
            .unwrap()
            .entry(persona.into())
            .or_default()
            .push_back(response.into());
    }

    /// Every (persona, instruction) pair seen so far
    pub fn call_log(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls made
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// High-water mark of concurrent in-flight calls
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_response(&self, persona: &str) -> String {
        if let Some(script) = self.persona_scripts.lock().unwrap().get_mut(persona) {
            if let Some(response) = script.pop_front() {
                return response;
            }
        }
        if let Some(response) = self.queue.lock().unwrap().pop_front() {
            return response;
        }
        self.default_response.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run(
        &self,
        persona: &str,
        task: &str,
        options: AgentRunOptions,
    ) -> Result<AgentResponse> {
        options.validate()?;

        self.calls
            .lock()
            .unwrap()
            .push((persona.to_string(), task.to_string()));

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let result = async {
            if options.cancel.is_cancelled() {
                return AgentResponse::error(persona, "cancelled");
            }

            if let Some(delay) = self.delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = options.cancel.cancelled() => {
                        return AgentResponse::error(persona, "cancelled");
                    }
                }
            }

            let content = self.next_response(persona);
            options.stream(StreamEventKind::Text, content.clone());
            AgentResponse::done(persona, content)
        }
        .await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn options() -> AgentRunOptions {
        AgentRunOptions {
            cwd: PathBuf::from("/work"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_queue_order() {
        let runner = ScriptedRunner::with_responses(["first", "second"]);

        let a = runner.run("p", "t", options()).await.unwrap();
        let b = runner.run("p", "t", options()).await.unwrap();
        assert_eq!(a.content, "first");
        assert_eq!(b.content, "second");
        assert_eq!(runner.call_count(), 2);
    }

    #[tokio::test]
    async fn test_persona_scripts_win() {
        let runner = ScriptedRunner::with_responses(["queued"]);
        runner.push_persona_response("arch", "[ARCH:1] approved");

        let arch = runner.run("arch", "review", options()).await.unwrap();
        assert_eq!(arch.content, "[ARCH:1] approved");

        let other = runner.run("sec", "review", options()).await.unwrap();
        assert_eq!(other.content, "queued");
    }

    #[tokio::test]
    async fn test_default_response() {
        let runner = ScriptedRunner::new().with_default("fallback");
        let response = runner.run("p", "t", options()).await.unwrap();
        assert_eq!(response.content, "fallback");
    }

    #[tokio::test]
    async fn test_cancel_during_delay() {
        let runner = ScriptedRunner::with_responses(["never delivered"])
            .with_delay(Duration::from_secs(60));
        let opts = options();
        let cancel = opts.cancel.clone();

        let handle = tokio::spawn(async move { runner.run("p", "t", opts).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let response = handle.await.unwrap().unwrap();
        assert!(response.is_error());
        assert_eq!(response.content, "cancelled");
    }
}
