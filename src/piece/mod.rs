//! Piece/Movement workflow engine.
//!
//! A **Piece** is a declarative workflow: a graph of named movements with
//! routing rules and an iteration budget. The engine executes movements
//! serially (fanning parallel groups out concurrently), classifies each
//! output against the movement's rules, and transitions until a terminal
//! rule, the budget, or a cancellation ends the run.

mod config;
mod engine;
mod events;
mod instruction;
mod loop_detector;
mod phases;
mod rules;
mod state;

pub use config::{
    JudgeSpec, LoopMonitor, Movement, OutputContract, Piece, Rule, RuleCondition, ABORT, COMPLETE,
};
pub use engine::{
    AiJudgeFn, EngineOptions, PieceEngine, RuleDetector, REASON_CANCELLED, REASON_LOOP_UNRESOLVED,
    REASON_MAX_MOVEMENTS, REASON_NO_MATCHING_RULE,
};
pub use events::{EventListeners, PhaseKind, PieceEvent};
pub use instruction::{
    sanitize_braces, InstructionBuilder, InstructionContext, ReportInstructionBuilder,
    StatusJudgmentBuilder,
};
pub use loop_detector::{CycleHit, LoopDetector};
pub use phases::{
    rotate_report_history, run_judgment_phase, run_report_phase, snapshot_previous_response,
    JudgmentOutcome, ReportOutcome,
};
pub use rules::{
    detect_matched_rule, evaluate_aggregate, movement_tag, parse_judgment_tag, SubMovementResult,
};
pub use state::{MatchMethod, MovementOutput, PieceRunState, RuleMatch, RunStatus};
