//! Engine lifecycle events.
//!
//! One producer (the engine), many consumers; emission is synchronous and
//! serialized in the order the engine advances. Consumers subscribe with
//! `PieceEngine::on_event` and match on the tagged union.

use crate::agent::AgentStatus;

use super::state::{PieceRunState, RuleMatch};

/// The three agent calls a movement can make
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    /// Phase 1: execute the movement instruction
    Execute,
    /// Phase 2: write report files
    Report,
    /// Phase 3: classify the result against the rule table
    Judgment,
}

impl PhaseKind {
    /// Phase number (1, 2, or 3)
    pub fn number(&self) -> u8 {
        match self {
            PhaseKind::Execute => 1,
            PhaseKind::Report => 2,
            PhaseKind::Judgment => 3,
        }
    }
}

/// Lifecycle events emitted during a piece run.
///
/// Parallel parent movements emit `MovementStart` with an empty instruction
/// string; consumers must tolerate it and use sub-movement phases for
/// detail.
#[derive(Debug, Clone)]
pub enum PieceEvent {
    /// A movement is about to execute
    MovementStart {
        movement: String,
        iteration: u32,
        instruction: String,
    },

    /// A movement finished and its output was recorded
    MovementComplete {
        movement: String,
        matched_rule: Option<RuleMatch>,
        output: String,
    },

    /// A loop monitor's cycle threshold was reached
    CycleDetected { monitor: String, cycle_count: u32 },

    /// An agent phase is starting
    PhaseStart {
        movement: String,
        phase: PhaseKind,
        instruction_preview: String,
    },

    /// An agent phase settled
    PhaseComplete {
        movement: String,
        phase: PhaseKind,
        content: String,
        status: AgentStatus,
        error: Option<String>,
    },

    /// The iteration budget was reached; the run aborts next
    IterationLimit { iteration: u32, limit: u32 },

    /// The run completed via a COMPLETE rule
    PieceComplete { state: PieceRunState },

    /// The run aborted (ABORT rule, budget, cancellation, unresolved rules)
    PieceAbort { state: PieceRunState, reason: String },
}

/// Registered event listeners
#[derive(Default)]
pub struct EventListeners {
    handlers: Vec<Box<dyn Fn(&PieceEvent) + Send + Sync>>,
}

impl EventListeners {
    pub fn subscribe<F>(&mut self, handler: F)
    where
        F: Fn(&PieceEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    pub fn emit(&self, event: &PieceEvent) {
        for handler in &self.handlers {
            handler(event);
        }
    }
}

impl std::fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListeners")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
