//! Runtime state of a single piece execution.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Piece execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Currently executing
    Running,
    /// Reached a COMPLETE rule
    Completed,
    /// Reached an ABORT rule, hit the iteration budget, or was cancelled
    Aborted,
}

/// How a rule match was determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    /// `[MOVEMENT_NAME:N]` tag found in the Phase 1 output
    Phase1Tag,
    /// Resolved by the Phase 3 judgment call
    AiJudgeFallback,
    /// Aggregate rule over parallel sub-movement results
    Aggregate,
    /// Judgment returned no tag; the configured fallback rule was selected
    AutoSelect,
}

/// A matched rule: index into the movement's rule list plus the method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    /// 0-based index into the movement's rule list
    pub index: usize,
    /// Detection method
    pub method: MatchMethod,
}

impl RuleMatch {
    pub fn new(index: usize, method: MatchMethod) -> Self {
        Self { index, method }
    }
}

/// Output captured for one executed movement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementOutput {
    /// Agent output content (aggregate content for parallel parents)
    pub content: String,

    /// The rule that matched, when one did
    pub matched: Option<RuleMatch>,
}

/// Runtime state of a piece execution.
///
/// Created by the engine when `run()` starts; `movement_outputs` stays
/// readable after the run settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PieceRunState {
    /// Piece being executed
    pub piece_name: String,

    /// Run identifier (directory name under `.takt/runs/`)
    pub run_id: String,

    /// 1-based count of executed movements
    pub iteration: u32,

    /// Current status
    pub status: RunStatus,

    /// Movement currently executing (or last executed)
    pub current_movement: String,

    /// Outputs per movement name; parallel sub-movements appear under
    /// their own names alongside the parent's aggregate
    pub movement_outputs: HashMap<String, MovementOutput>,

    /// Number of times each movement has been entered in this run
    pub movement_iteration_counts: HashMap<String, u32>,

    /// Recent movement names, bounded for the loop detector
    pub movement_history: Vec<String>,

    /// The snapshot file holding the most recent movement output
    pub previous_response_source_path: Option<PathBuf>,

    /// Why the run aborted, when it did
    pub abort_reason: Option<String>,

    /// Started at
    pub started_at: DateTime<Utc>,

    /// Completed at
    pub completed_at: Option<DateTime<Utc>>,
}

impl PieceRunState {
    pub fn new(piece_name: &str, run_id: &str, start_movement: &str) -> Self {
        Self {
            piece_name: piece_name.to_string(),
            run_id: run_id.to_string(),
            iteration: 0,
            status: RunStatus::Running,
            current_movement: start_movement.to_string(),
            movement_outputs: HashMap::new(),
            movement_iteration_counts: HashMap::new(),
            movement_history: Vec::new(),
            previous_response_source_path: None,
            abort_reason: None,
            started_at: crate::utils::time::now(),
            completed_at: None,
        }
    }

    /// Count of times `movement` has been entered in this run
    pub fn movement_iteration(&self, movement: &str) -> u32 {
        self.movement_iteration_counts
            .get(movement)
            .copied()
            .unwrap_or(0)
    }
}
