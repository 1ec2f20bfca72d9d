//! The piece engine: a bounded state machine over a piece configuration.
//!
//! Each iteration executes one movement (or one parallel group), classifies
//! the output against the movement's rules, and transitions to the next
//! movement until a terminal rule, the iteration budget, a cancellation, or
//! an unresolved classification ends the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{
    AgentResponse, AgentRunOptions, AgentRunner, SessionKey, SessionRegistry, StreamSink,
};
use crate::config::{ProjectLayout, RunPaths};
use crate::error::{Result, TaktError};
use crate::utils::text::tail_excerpt;

use super::config::{JudgeSpec, LoopMonitor, Movement, Piece, ABORT, COMPLETE};
use super::events::{EventListeners, PhaseKind, PieceEvent};
use super::instruction::{InstructionBuilder, InstructionContext};
use super::loop_detector::LoopDetector;
use super::phases;
use super::rules::{self, SubMovementResult};
use super::state::{MatchMethod, MovementOutput, PieceRunState, RuleMatch, RunStatus};

/// Abort reason when the iteration budget is exhausted
pub const REASON_MAX_MOVEMENTS: &str = "max_movements";
/// Abort reason when no rule matched and no fallback resolved
pub const REASON_NO_MATCHING_RULE: &str = "no_matching_rule";
/// Abort reason when the shared abort signal fired
pub const REASON_CANCELLED: &str = "cancelled";
/// Abort reason when a loop monitor's judge resolved nothing
pub const REASON_LOOP_UNRESOLVED: &str = "loop_unresolved";

/// Injected rule detector override (test seam)
pub type RuleDetector = Arc<dyn Fn(&Movement, &str) -> Option<RuleMatch> + Send + Sync>;

/// Injected Phase 3 judge: returns a 0-based rule index, or -1 when the
/// judgment is unresolved.
pub type AiJudgeFn = Arc<dyn Fn(&Movement, &str) -> i64 + Send + Sync>;

/// Options recognized by [`PieceEngine::new`]
#[derive(Clone, Default)]
pub struct EngineOptions {
    /// Project root; defaults to the execution cwd
    pub project_cwd: Option<PathBuf>,

    /// Provider identifier applied when a movement has no override
    pub provider: Option<String>,

    /// Model applied when a movement has no override
    pub model: Option<String>,

    /// Permission mode applied when a movement has no override
    pub permission_mode: Option<String>,

    /// Movement to start from instead of the piece's `initial_movement`
    pub start_movement: Option<String>,

    /// Extra user inputs injected into instructions
    pub user_inputs: Vec<String>,

    /// Language hint for agent responses
    pub language: Option<String>,

    /// Incremental output sink forwarded to the agent port
    pub on_stream: Option<StreamSink>,

    /// Task label for parallel worker-pool output; paired with
    /// `task_color_index`
    pub task_prefix: Option<String>,

    /// Color slot for the task label; paired with `task_prefix`
    pub task_color_index: Option<usize>,

    /// Shared abort signal
    pub cancel: CancellationToken,

    /// Rule detection override
    pub detect_rule_index: Option<RuleDetector>,

    /// Phase 3 judge override
    pub ai_judge: Option<AiJudgeFn>,

    /// Run directory override; defaults to `.takt/runs/<run-id>`
    pub run_dir: Option<PathBuf>,
}

/// Result of executing one movement, before recording
struct MovementOutcome {
    content: String,
    matched: Option<RuleMatch>,
    agent_error: Option<String>,
}

/// State machine executor for one piece run
pub struct PieceEngine {
    piece: Arc<Piece>,
    cwd: PathBuf,
    task: String,
    agent: Arc<dyn AgentRunner>,
    sessions: Arc<SessionRegistry>,
    options: EngineOptions,
    listeners: EventListeners,
    run_id: String,
    paths: RunPaths,
    start_movement: String,
}

impl std::fmt::Debug for PieceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceEngine")
            .field("run_id", &self.run_id)
            .field("start_movement", &self.start_movement)
            .finish_non_exhaustive()
    }
}

impl PieceEngine {
    /// Construct an engine for one task execution.
    ///
    /// Validates every rule target referenced by movements, parallel
    /// children, aggregate parents, and loop-monitor judges; resolves the
    /// start movement; and enforces the task-prefix/color pairing. Fails
    /// fast with the offending name in the message.
    pub fn new(
        piece: Arc<Piece>,
        cwd: &Path,
        task: &str,
        agent: Arc<dyn AgentRunner>,
        options: EngineOptions,
    ) -> Result<Self> {
        piece.validate()?;

        let start_movement = options
            .start_movement
            .clone()
            .unwrap_or_else(|| piece.initial_movement.clone());
        if piece.find_movement(&start_movement).is_none() {
            return Err(TaktError::validation(format!(
                "start movement '{}' not found in piece '{}'",
                start_movement, piece.name
            )));
        }

        if options.task_prefix.is_some() != options.task_color_index.is_some() {
            return Err(TaktError::config(
                "task_prefix and task_color_index must both be set or both absent",
            ));
        }

        let run_id = Uuid::new_v4().to_string();
        let project_cwd = options
            .project_cwd
            .clone()
            .unwrap_or_else(|| cwd.to_path_buf());
        let paths = match &options.run_dir {
            Some(dir) => RunPaths::from_run_dir(dir.clone()),
            None => RunPaths::new(&ProjectLayout::new(&project_cwd), &run_id),
        };

        Ok(Self {
            piece,
            cwd: cwd.to_path_buf(),
            task: task.to_string(),
            agent,
            sessions: Arc::new(SessionRegistry::new()),
            options,
            listeners: EventListeners::default(),
            run_id,
            paths,
            start_movement,
        })
    }

    /// Subscribe to lifecycle events
    pub fn on_event<F>(&mut self, handler: F)
    where
        F: Fn(&PieceEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(handler);
    }

    /// The run directory this engine writes under
    pub fn run_paths(&self) -> &RunPaths {
        &self.paths
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn emit(&self, event: PieceEvent) {
        self.listeners.emit(&event);
    }

    /// Execute the piece until a terminal state.
    ///
    /// Movements run strictly serially; `iteration` increments once per
    /// movement entry (parallel sub-movements do not count separately).
    pub async fn run(&mut self) -> Result<PieceRunState> {
        let mut state = PieceRunState::new(&self.piece.name, &self.run_id, &self.start_movement);
        let mut detector = LoopDetector::new(&self.piece.loop_monitors);
        let mut previous_output: Option<String> = None;

        info!(
            "Starting piece '{}' at movement '{}' (budget {})",
            self.piece.name, self.start_movement, self.piece.max_movements
        );

        loop {
            if self.options.cancel.is_cancelled() {
                return Ok(self.abort(state, REASON_CANCELLED));
            }

            if state.iteration >= self.piece.max_movements {
                self.emit(PieceEvent::IterationLimit {
                    iteration: state.iteration,
                    limit: self.piece.max_movements,
                });
                return Ok(self.abort(state, REASON_MAX_MOVEMENTS));
            }

            let current = state.current_movement.clone();
            state.iteration += 1;
            *state
                .movement_iteration_counts
                .entry(current.clone())
                .or_insert(0) += 1;

            // Loop arbitration: a fired monitor swaps in its judge for
            // exactly this iteration.
            let mut judge_of: Option<LoopMonitor> = None;
            if let Some(hit) = detector.record_entry(&current) {
                let monitor = detector.monitor(hit.monitor_index).clone();
                self.emit(PieceEvent::CycleDetected {
                    monitor: monitor.display_name(),
                    cycle_count: hit.cycle_count,
                });
                detector.reset();
                judge_of = Some(monitor);
            }
            state.movement_history = detector.history().to_vec();

            let is_judge = judge_of.is_some();
            let movement = match judge_of {
                Some(monitor) => build_judge_movement(&monitor),
                None => self
                    .piece
                    .find_movement(&current)
                    .ok_or_else(|| {
                        TaktError::validation(format!(
                            "movement '{}' not found in piece '{}'",
                            current, self.piece.name
                        ))
                    })?
                    .clone(),
            };

            let movement_iteration = state.movement_iteration(&current);
            let outcome = if movement.is_parallel() {
                self.run_parallel_movement(
                    &movement,
                    &mut state,
                    previous_output.as_deref(),
                    movement_iteration,
                )
                .await?
            } else {
                self.run_normal_movement(
                    &movement,
                    &mut state,
                    previous_output.as_deref(),
                    movement_iteration,
                )
                .await?
            };

            if self.options.cancel.is_cancelled() {
                return Ok(self.abort(state, REASON_CANCELLED));
            }

            state.movement_outputs.insert(
                movement.name.clone(),
                MovementOutput {
                    content: outcome.content.clone(),
                    matched: outcome.matched,
                },
            );

            let snapshot = phases::snapshot_previous_response(
                &self.paths,
                &movement.name,
                state.iteration,
                &outcome.content,
            )
            .await?;
            state.previous_response_source_path = Some(snapshot);
            previous_output = Some(outcome.content.clone());

            self.emit(PieceEvent::MovementComplete {
                movement: movement.name.clone(),
                matched_rule: outcome.matched,
                output: outcome.content.clone(),
            });

            let Some(matched) = outcome.matched else {
                let reason = if is_judge {
                    REASON_LOOP_UNRESOLVED.to_string()
                } else if let Some(agent_error) = outcome.agent_error {
                    format!("agent_error: {}", agent_error)
                } else {
                    REASON_NO_MATCHING_RULE.to_string()
                };
                return Ok(self.abort(state, &reason));
            };

            let next = movement.rules[matched.index].next.clone();
            match next.as_str() {
                COMPLETE => {
                    state.status = RunStatus::Completed;
                    state.completed_at = Some(crate::utils::time::now());
                    info!(
                        "Piece '{}' completed after {} iterations",
                        self.piece.name, state.iteration
                    );
                    self.emit(PieceEvent::PieceComplete {
                        state: state.clone(),
                    });
                    return Ok(state);
                }
                ABORT => {
                    let condition = movement.rules[matched.index].condition.label();
                    return Ok(self.abort(state, &format!("abort_rule: {}", condition)));
                }
                _ => {
                    debug!(
                        "Movement '{}' -> '{}' (rule {})",
                        movement.name,
                        next,
                        matched.index + 1
                    );
                    state.current_movement = next;
                }
            }
        }
    }

    fn abort(&self, mut state: PieceRunState, reason: &str) -> PieceRunState {
        warn!(
            "Piece '{}' aborted at iteration {}: {}",
            self.piece.name, state.iteration, reason
        );
        state.status = RunStatus::Aborted;
        state.abort_reason = Some(reason.to_string());
        state.completed_at = Some(crate::utils::time::now());
        self.emit(PieceEvent::PieceAbort {
            state: state.clone(),
            reason: reason.to_string(),
        });
        state
    }

    /// Execute a normal (single-agent) movement: Phase 1, then Phase 2 for
    /// output contracts, then rule detection with the Phase 3 fallback.
    async fn run_normal_movement(
        &self,
        movement: &Movement,
        state: &mut PieceRunState,
        previous_output: Option<&str>,
        movement_iteration: u32,
    ) -> Result<MovementOutcome> {
        let instruction = self.build_instruction(movement, state, previous_output, movement_iteration);

        self.emit(PieceEvent::MovementStart {
            movement: movement.name.clone(),
            iteration: state.iteration,
            instruction: instruction.clone(),
        });

        let persona = self.resolve_persona(movement);
        let response = self
            .run_phase(movement, PhaseKind::Execute, &persona, &instruction)
            .await?;

        // Phase 2: report files, with prior-version rotation
        if !movement.output_contracts.is_empty() && !response.is_error() {
            let report_instruction = super::instruction::ReportInstructionBuilder::build(
                movement,
                &self.paths.reports_dir(),
            )?;
            self.emit(PieceEvent::PhaseStart {
                movement: movement.name.clone(),
                phase: PhaseKind::Report,
                instruction_preview: preview(&report_instruction),
            });
            let report = phases::run_report_phase(
                &self.agent,
                movement,
                &persona,
                &self.paths,
                self.agent_options(movement),
            )
            .await?;
            self.record_session(movement, &report.response);
            self.emit(PieceEvent::PhaseComplete {
                movement: movement.name.clone(),
                phase: PhaseKind::Report,
                content: report.response.content.clone(),
                status: report.response.status,
                error: report
                    .response
                    .is_error()
                    .then(|| tail_excerpt(&report.response.content, 200)),
            });
        }

        let mut matched = match &self.options.detect_rule_index {
            Some(detect) => detect(movement, &response.content),
            None => rules::detect_matched_rule(movement, &response.content),
        };

        // Phase 3: AI-condition judgment when tags were inconclusive
        if matched.is_none() && movement.has_ai_rules() && !response.is_error() {
            matched = self
                .run_judgment(movement, &persona, &response.content)
                .await?;
        }

        let agent_error = response
            .is_error()
            .then(|| tail_excerpt(&response.content, 200));

        Ok(MovementOutcome {
            content: response.content,
            matched,
            agent_error,
        })
    }

    /// Execute one agent phase and emit its start/complete events.
    ///
    /// Agent port errors are folded into an `Error`-status response so the
    /// engine can still evaluate rules over the failure text.
    async fn run_phase(
        &self,
        movement: &Movement,
        phase: PhaseKind,
        persona: &str,
        instruction: &str,
    ) -> Result<AgentResponse> {
        self.emit(PieceEvent::PhaseStart {
            movement: movement.name.clone(),
            phase,
            instruction_preview: preview(instruction),
        });

        let response = match self
            .agent
            .run(persona, instruction, self.agent_options(movement))
            .await
        {
            Ok(response) => response,
            Err(e) => AgentResponse::error(persona, e.to_string()),
        };
        self.record_session(movement, &response);

        self.emit(PieceEvent::PhaseComplete {
            movement: movement.name.clone(),
            phase,
            content: response.content.clone(),
            status: response.status,
            error: response
                .is_error()
                .then(|| tail_excerpt(&response.content, 200)),
        });

        Ok(response)
    }

    async fn run_judgment(
        &self,
        movement: &Movement,
        persona: &str,
        content: &str,
    ) -> Result<Option<RuleMatch>> {
        if let Some(judge) = &self.options.ai_judge {
            let index = judge(movement, content);
            if index >= 0 && (index as usize) < movement.rules.len() {
                return Ok(Some(RuleMatch::new(
                    index as usize,
                    MatchMethod::AiJudgeFallback,
                )));
            }
            return Ok(auto_select_fallback(movement));
        }

        let judgment_instruction =
            super::instruction::StatusJudgmentBuilder::build(movement, content)?;
        self.emit(PieceEvent::PhaseStart {
            movement: movement.name.clone(),
            phase: PhaseKind::Judgment,
            instruction_preview: preview(&judgment_instruction),
        });

        let outcome = phases::run_judgment_phase(
            &self.agent,
            movement,
            persona,
            content,
            self.agent_options(movement),
        )
        .await?;
        self.record_session(movement, &outcome.response);

        self.emit(PieceEvent::PhaseComplete {
            movement: movement.name.clone(),
            phase: PhaseKind::Judgment,
            content: outcome.response.content.clone(),
            status: outcome.response.status,
            error: None,
        });

        if outcome.rule_index >= 0 {
            Ok(Some(RuleMatch::new(
                outcome.rule_index as usize,
                outcome.method,
            )))
        } else {
            Ok(auto_select_fallback(movement))
        }
    }

    /// Execute a parallel movement: fan out the sub-movements, aggregate
    /// their outputs in declaration order, and route on the parent's
    /// aggregate rules.
    async fn run_parallel_movement(
        &self,
        parent: &Movement,
        state: &mut PieceRunState,
        previous_output: Option<&str>,
        movement_iteration: u32,
    ) -> Result<MovementOutcome> {
        // Parallel parents have no instruction of their own
        self.emit(PieceEvent::MovementStart {
            movement: parent.name.clone(),
            iteration: state.iteration,
            instruction: String::new(),
        });

        let calls = parent.parallel.iter().map(|sub| {
            let instruction =
                self.build_instruction(sub, state, previous_output, movement_iteration);
            let persona = self.resolve_persona(sub);
            async move {
                let response = self
                    .run_phase(sub, PhaseKind::Execute, &persona, &instruction)
                    .await?;
                Ok::<_, TaktError>(response)
            }
        });

        // Any transport-level failure fails the parent; dropping the
        // remaining futures cancels their in-flight calls.
        let responses = futures::future::try_join_all(calls).await?;

        let mut sub_results = Vec::with_capacity(parent.parallel.len());
        let mut sections = Vec::with_capacity(parent.parallel.len());

        for (sub, response) in parent.parallel.iter().zip(&responses) {
            let matched = rules::detect_matched_rule(sub, &response.content);
            let matched_condition =
                matched.map(|m| sub.rules[m.index].condition.label());

            state.movement_outputs.insert(
                sub.name.clone(),
                MovementOutput {
                    content: response.content.clone(),
                    matched,
                },
            );

            sections.push(format!("## {}\n{}", sub.name, response.content));
            sub_results.push(SubMovementResult {
                name: sub.name.clone(),
                matched_condition,
            });
        }

        let aggregate_content = sections.join("\n\n---\n\n");
        let matched = rules::evaluate_aggregate(parent, &sub_results);

        let agent_error = responses
            .iter()
            .find(|r| r.is_error())
            .map(|r| tail_excerpt(&r.content, 200));

        Ok(MovementOutcome {
            content: aggregate_content,
            matched,
            agent_error,
        })
    }

    fn build_instruction(
        &self,
        movement: &Movement,
        state: &PieceRunState,
        previous_output: Option<&str>,
        movement_iteration: u32,
    ) -> String {
        let reports_dir = self.paths.reports_dir();
        let project_cwd = self
            .options
            .project_cwd
            .clone()
            .unwrap_or_else(|| self.cwd.clone());
        let ctx = InstructionContext {
            task: &self.task,
            iteration: state.iteration,
            max_movements: self.piece.max_movements,
            movement_iteration,
            cwd: &self.cwd,
            project_cwd: &project_cwd,
            report_dir: Some(&reports_dir),
            previous_output: if movement.pass_previous_response {
                previous_output
            } else {
                None
            },
            user_inputs: &self.options.user_inputs,
            language: self.options.language.as_deref(),
        };
        InstructionBuilder::build(movement, &ctx)
    }

    /// Resolve a movement's persona reference to its prompt text: a key in
    /// the piece's persona map, or the literal inline text.
    fn resolve_persona(&self, movement: &Movement) -> String {
        match &movement.persona {
            Some(key) => self
                .piece
                .personas
                .get(key)
                .cloned()
                .unwrap_or_else(|| key.clone()),
            None => String::new(),
        }
    }

    fn session_key(&self, movement: &Movement) -> SessionKey {
        let provider = movement
            .provider
            .clone()
            .or_else(|| self.options.provider.clone())
            .unwrap_or_else(|| "default".to_string());
        let persona = movement.persona.clone().unwrap_or_default();
        SessionKey::new(&self.cwd, &persona, &provider)
    }

    fn record_session(&self, movement: &Movement, response: &AgentResponse) {
        self.sessions
            .record(&self.session_key(movement), response.session_id.as_deref());
    }

    fn agent_options(&self, movement: &Movement) -> AgentRunOptions {
        AgentRunOptions {
            cwd: self.cwd.clone(),
            report_dir: Some(self.paths.reports_dir()),
            session_id: None,
            resume_session_id: self.sessions.resume_id(&self.session_key(movement)),
            allowed_tools: movement.allowed_tools.clone(),
            permission_mode: movement
                .permission_mode
                .clone()
                .or_else(|| self.options.permission_mode.clone()),
            provider: movement
                .provider
                .clone()
                .or_else(|| self.options.provider.clone()),
            model: movement.model.clone().or_else(|| self.options.model.clone()),
            cancel: self.options.cancel.clone(),
            on_stream: self.options.on_stream.clone(),
            task_prefix: self.options.task_prefix.clone(),
            task_color_index: self.options.task_color_index,
        }
    }
}

/// Materialize a loop monitor's judge as a movement so it can reuse the
/// normal execution path.
fn build_judge_movement(monitor: &LoopMonitor) -> Movement {
    let JudgeSpec {
        persona,
        instruction,
        rules,
        ..
    } = monitor.judge.clone();

    Movement {
        name: monitor.judge_name(),
        persona,
        persona_path: None,
        instruction,
        pass_previous_response: true,
        rules,
        output_contracts: vec![],
        quality_gates: vec![],
        edit: false,
        allowed_tools: None,
        parallel: vec![],
        provider: None,
        model: None,
        permission_mode: None,
    }
}

/// Fallback when Phase 3 resolves nothing: prefer an ABORT rule, else the
/// last rule.
fn auto_select_fallback(movement: &Movement) -> Option<RuleMatch> {
    let index = movement
        .rules
        .iter()
        .position(|r| r.next == ABORT)
        .or_else(|| movement.rules.len().checked_sub(1))?;
    Some(RuleMatch::new(index, MatchMethod::AutoSelect))
}

fn preview(instruction: &str) -> String {
    const LIMIT: usize = 160;
    let mut out: String = instruction.chars().take(LIMIT).collect();
    if instruction.chars().count() > LIMIT {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScriptedRunner;
    use crate::piece::config::Piece;

    fn engine_options(run_dir: &Path) -> EngineOptions {
        EngineOptions {
            run_dir: Some(run_dir.to_path_buf()),
            ..Default::default()
        }
    }

    fn two_step_piece() -> Arc<Piece> {
        Arc::new(
            Piece::from_yaml(
                r#"
name: two-step
max_movements: 10
initial_movement: plan
movements:
  - name: plan
    persona: planner
    instruction: "Plan {task}"
    rules:
      - condition: ready
        next: implement
      - condition: stuck
        next: ABORT
  - name: implement
    persona: coder
    instruction: "Implement the plan"
    rules:
      - condition: done
        next: COMPLETE
"#,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_construction_rejects_unknown_start_movement() {
        let agent: Arc<dyn AgentRunner> = Arc::new(ScriptedRunner::new());
        let err = PieceEngine::new(
            two_step_piece(),
            Path::new("/work"),
            "task",
            agent,
            EngineOptions {
                start_movement: Some("ghost".to_string()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_construction_rejects_unpaired_prefix() {
        let agent: Arc<dyn AgentRunner> = Arc::new(ScriptedRunner::new());
        let err = PieceEngine::new(
            two_step_piece(),
            Path::new("/work"),
            "task",
            agent,
            EngineOptions {
                task_prefix: Some("t1".to_string()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("task_color_index"));
    }

    #[tokio::test]
    async fn test_happy_path_run() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::with_responses([
            "plan ready [PLAN:1]",
            "implemented [IMPLEMENT:1]",
        ]));
        let agent: Arc<dyn AgentRunner> = runner.clone();

        let mut engine = PieceEngine::new(
            two_step_piece(),
            dir.path(),
            "build the feature",
            agent,
            engine_options(&dir.path().join("run")),
        )
        .unwrap();

        let state = engine.run().await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.iteration, 2);
        assert_eq!(state.movement_outputs.len(), 2);
        assert_eq!(
            state.movement_outputs["plan"].matched.unwrap().method,
            MatchMethod::Phase1Tag
        );
        // The second instruction carried the first movement's output
        let calls = runner.call_log();
        assert!(calls[1].1.contains("plan ready [PLAN:1]"));
    }

    #[tokio::test]
    async fn test_no_matching_rule_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let agent: Arc<dyn AgentRunner> =
            Arc::new(ScriptedRunner::new().with_default("no tags whatsoever"));

        let mut engine = PieceEngine::new(
            two_step_piece(),
            dir.path(),
            "task",
            agent,
            engine_options(&dir.path().join("run")),
        )
        .unwrap();

        let state = engine.run().await.unwrap();
        assert_eq!(state.status, RunStatus::Aborted);
        assert_eq!(state.abort_reason.as_deref(), Some(REASON_NO_MATCHING_RULE));
    }

    #[tokio::test]
    async fn test_abort_rule_carries_condition() {
        let dir = tempfile::tempdir().unwrap();
        let agent: Arc<dyn AgentRunner> =
            Arc::new(ScriptedRunner::with_responses(["cannot do it [PLAN:2]"]));

        let mut engine = PieceEngine::new(
            two_step_piece(),
            dir.path(),
            "task",
            agent,
            engine_options(&dir.path().join("run")),
        )
        .unwrap();

        let state = engine.run().await.unwrap();
        assert_eq!(state.status, RunStatus::Aborted);
        assert!(state.abort_reason.unwrap().contains("stuck"));
    }

    #[tokio::test]
    async fn test_injected_ai_judge_resolves_ai_rules() {
        let dir = tempfile::tempdir().unwrap();
        let piece = Arc::new(
            Piece::from_yaml(
                r#"
name: ai-piece
max_movements: 5
initial_movement: check
movements:
  - name: check
    persona: checker
    instruction: "Check it"
    rules:
      - condition: ai("the work is acceptable")
        next: COMPLETE
      - condition: ai("the work needs redoing")
        next: ABORT
"#,
            )
            .unwrap(),
        );
        let agent: Arc<dyn AgentRunner> =
            Arc::new(ScriptedRunner::new().with_default("looks fine to me"));

        let mut options = engine_options(&dir.path().join("run"));
        options.ai_judge = Some(Arc::new(|_movement, _content| 0));

        let mut engine =
            PieceEngine::new(piece, dir.path(), "task", agent, options).unwrap();
        let state = engine.run().await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(
            state.movement_outputs["check"].matched.unwrap().method,
            MatchMethod::AiJudgeFallback
        );
    }

    #[tokio::test]
    async fn test_unresolved_judge_falls_back_to_abort_rule() {
        let dir = tempfile::tempdir().unwrap();
        let piece = Arc::new(
            Piece::from_yaml(
                r#"
name: ai-piece
max_movements: 5
initial_movement: check
movements:
  - name: check
    persona: checker
    instruction: "Check it"
    rules:
      - condition: ai("the work is acceptable")
        next: COMPLETE
      - condition: ai("the work needs redoing")
        next: ABORT
"#,
            )
            .unwrap(),
        );
        let agent: Arc<dyn AgentRunner> =
            Arc::new(ScriptedRunner::new().with_default("inscrutable output"));

        let mut options = engine_options(&dir.path().join("run"));
        options.ai_judge = Some(Arc::new(|_movement, _content| -1));

        let mut engine =
            PieceEngine::new(piece, dir.path(), "task", agent, options).unwrap();
        let state = engine.run().await.unwrap();

        // Auto-select prefers the ABORT rule
        assert_eq!(state.status, RunStatus::Aborted);
        assert_eq!(
            state.movement_outputs["check"].matched.unwrap().method,
            MatchMethod::AutoSelect
        );
    }
}
