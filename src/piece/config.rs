//! Piece and Movement configuration.
//!
//! A **Piece** is a declarative YAML-defined workflow containing:
//! - Named **Movements** (steps with persona/provider/instruction template)
//! - **Rules** for conditional routing between movements, including the
//!   reserved terminals `COMPLETE` and `ABORT`
//! - **Loop monitors** that arbitrate repeated movement cycles via a judge
//!
//! Example YAML:
//! ```yaml
//! name: default
//! max_movements: 15
//! initial_movement: plan
//!
//! movements:
//!   - name: plan
//!     persona: planner
//!     instruction: "Analyze the task and create a plan"
//!     rules:
//!       - condition: "Plan is ready"
//!         next: implement
//!       - condition: "Cannot proceed"
//!         next: ABORT
//!
//!   - name: implement
//!     persona: coder
//!     edit: true
//!     instruction: "Implement the plan"
//!     rules:
//!       - condition: "Implementation finished"
//!         next: review
//!       - condition: ai("the changes look incomplete")
//!         next: plan
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::info;

use crate::error::{Result, TaktError};

/// Reserved rule target: the piece run finished successfully
pub const COMPLETE: &str = "COMPLETE";

/// Reserved rule target: the piece run is abandoned
pub const ABORT: &str = "ABORT";

/// A Piece is a complete workflow definition loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Piece {
    /// Piece name (unique identifier)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Maximum number of movement iterations before abort
    #[serde(default = "default_max_movements")]
    pub max_movements: u32,

    /// Name of the first movement to execute
    pub initial_movement: String,

    /// List of movements in this piece
    pub movements: Vec<Movement>,

    /// Cycle monitors that interrupt repeated movement loops
    #[serde(default)]
    pub loop_monitors: Vec<LoopMonitor>,

    /// Named persona texts referenced by movements
    #[serde(default)]
    pub personas: HashMap<String, String>,

    /// Named policy texts referenced by movements
    #[serde(default)]
    pub policies: HashMap<String, String>,

    /// Named knowledge texts referenced by movements
    #[serde(default)]
    pub knowledge: HashMap<String, String>,

    /// Named instruction fragments referenced by templates
    #[serde(default)]
    pub instructions: HashMap<String, String>,

    /// Named report format texts referenced by output contracts
    #[serde(default)]
    pub report_formats: HashMap<String, String>,
}

fn default_max_movements() -> u32 {
    30
}

/// A Movement is a single step in a Piece workflow.
///
/// A movement either carries a `persona` (one agent invocation) or a
/// non-empty `parallel` list (a concurrent group of sub-movements whose
/// results are combined by aggregate rules on this movement).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Movement {
    /// Unique movement name within the piece
    pub name: String,

    /// Persona to use (references a persona key or inline prompt)
    #[serde(default)]
    pub persona: Option<String>,

    /// Resolved persona file path, when the persona came from a file
    #[serde(default)]
    pub persona_path: Option<PathBuf>,

    /// Instruction template with `{placeholder}` substitutions
    #[serde(default)]
    pub instruction: String,

    /// Whether the previous movement's output is passed into the prompt
    #[serde(default = "default_true")]
    pub pass_previous_response: bool,

    /// Routing rules evaluated after the movement completes
    #[serde(default)]
    pub rules: Vec<Rule>,

    /// Report files this movement must produce (Phase 2)
    #[serde(default)]
    pub output_contracts: Vec<OutputContract>,

    /// Quality gates injected into the instruction
    #[serde(default)]
    pub quality_gates: Vec<String>,

    /// Whether the agent may edit files during this movement
    #[serde(default)]
    pub edit: bool,

    /// Tools the provider may use during this movement
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,

    /// Sub-movements executed concurrently (parallel group)
    #[serde(default)]
    pub parallel: Vec<Movement>,

    /// Provider override for this movement
    #[serde(default)]
    pub provider: Option<String>,

    /// Model override for this movement
    #[serde(default)]
    pub model: Option<String>,

    /// Permission mode override for this movement
    #[serde(default)]
    pub permission_mode: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Movement {
    /// Whether this movement fans out into parallel sub-movements
    pub fn is_parallel(&self) -> bool {
        !self.parallel.is_empty()
    }

    /// Whether any rule defers to the AI judge (Phase 3)
    pub fn has_ai_rules(&self) -> bool {
        self.rules
            .iter()
            .any(|r| matches!(r.condition, RuleCondition::Ai(_)))
    }
}

/// A report file descriptor produced by a movement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputContract {
    /// File name under the run's reports directory (e.g. `01-plan.md`)
    pub name: String,

    /// What the report should contain
    #[serde(default)]
    pub description: String,
}

/// A routing rule: when `condition` matches, transition to `next`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Condition to evaluate against the movement output
    pub condition: RuleCondition,

    /// Next movement name, or the reserved `COMPLETE` / `ABORT`
    pub next: String,
}

impl Rule {
    pub fn targets_terminal(&self) -> bool {
        self.next == COMPLETE || self.next == ABORT
    }
}

/// Condition variants for movement routing.
///
/// Serialized as the YAML string the piece author wrote:
/// - plain text → a tag rule matched via `[MOVEMENT_NAME:N]`
/// - `ai("…")` → deferred to the Phase 3 judgment call
/// - `all("…", …)` / `any("…", …)` → aggregate over parallel sub-movements
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleCondition {
    /// Tag rule: human-readable condition matched by index tag
    Tag(String),
    /// AI condition: `ai("phrase")`, evaluated in Phase 3
    Ai(String),
    /// Aggregate: every sub-movement matched a condition in the set
    All(Vec<String>),
    /// Aggregate: at least one sub-movement matched a condition in the set
    Any(Vec<String>),
}

impl RuleCondition {
    /// Parse the condition surface syntax.
    ///
    /// Malformed `ai(`/`all(`/`any(` expressions are fatal here, before any
    /// engine is constructed.
    pub fn parse(input: &str) -> std::result::Result<Self, String> {
        let trimmed = input.trim();

        for (prefix, kind) in [("ai(", "ai"), ("all(", "all"), ("any(", "any")] {
            if let Some(rest) = trimmed.strip_prefix(prefix) {
                let inner = rest.strip_suffix(')').ok_or_else(|| {
                    format!("malformed {} condition (missing ')'): {}", kind, input)
                })?;
                let args = parse_quoted_args(inner)
                    .map_err(|e| format!("malformed {} condition: {}: {}", kind, e, input))?;
                return match kind {
                    "ai" => {
                        if args.len() != 1 {
                            Err(format!("ai() takes exactly one argument: {}", input))
                        } else {
                            Ok(Self::Ai(args.into_iter().next().unwrap_or_default()))
                        }
                    }
                    "all" => Ok(Self::All(args)),
                    _ => Ok(Self::Any(args)),
                };
            }
        }

        if trimmed.is_empty() {
            return Err("empty rule condition".to_string());
        }
        Ok(Self::Tag(trimmed.to_string()))
    }

    /// The condition text used for display and aggregate matching
    pub fn label(&self) -> String {
        match self {
            Self::Tag(text) => text.clone(),
            Self::Ai(phrase) => phrase.clone(),
            Self::All(args) => format!("all({})", quote_args(args)),
            Self::Any(args) => format!("any({})", quote_args(args)),
        }
    }

    /// Render back to the surface syntax the author wrote
    pub fn to_source(&self) -> String {
        match self {
            Self::Tag(text) => text.clone(),
            Self::Ai(phrase) => format!("ai(\"{}\")", phrase),
            Self::All(args) => format!("all({})", quote_args(args)),
            Self::Any(args) => format!("any({})", quote_args(args)),
        }
    }
}

fn quote_args(args: &[String]) -> String {
    args.iter()
        .map(|a| format!("\"{}\"", a))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse a comma-separated list of double-quoted strings
fn parse_quoted_args(inner: &str) -> std::result::Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut rest = inner.trim();

    if rest.is_empty() {
        return Err("expected at least one quoted argument".to_string());
    }

    loop {
        let after_quote = rest
            .strip_prefix('"')
            .ok_or_else(|| "expected '\"'".to_string())?;
        let end = after_quote
            .find('"')
            .ok_or_else(|| "unterminated string".to_string())?;
        args.push(after_quote[..end].to_string());
        rest = after_quote[end + 1..].trim_start();

        if rest.is_empty() {
            return Ok(args);
        }
        rest = rest
            .strip_prefix(',')
            .ok_or_else(|| "expected ','".to_string())?
            .trim_start();
    }
}

impl Serialize for RuleCondition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_source())
    }
}

impl<'de> Deserialize<'de> for RuleCondition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(D::Error::custom)
    }
}

/// A loop monitor: when `cycle` repeats `threshold` times, the `judge`
/// movement arbitrates where the flow goes next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopMonitor {
    /// Monitor name used in events and judge namespacing
    #[serde(default)]
    pub name: Option<String>,

    /// Ordered cycle of movement names (length >= 2)
    pub cycle: Vec<String>,

    /// Number of complete cycle repetitions before the judge fires
    pub threshold: u32,

    /// Synthetic arbitration movement
    pub judge: JudgeSpec,
}

impl LoopMonitor {
    /// Display name: explicit name, or the cycle joined with dashes
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.cycle.join("-"))
    }

    /// Name of the synthetic judge movement: the judge's explicit name,
    /// or `<monitor>/judge` when it has none.
    pub fn judge_name(&self) -> String {
        self.judge
            .name
            .clone()
            .unwrap_or_else(|| format!("{}/judge", self.display_name()))
    }
}

/// Specification of a loop monitor's arbitration movement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeSpec {
    /// Judge movement name; drives its `[NAME:N]` detection tags.
    /// Defaults to `<monitor>/judge` when absent.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub persona: Option<String>,

    pub instruction: String,

    pub rules: Vec<Rule>,
}

impl Piece {
    /// Load a piece from a YAML file
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            TaktError::Config {
                message: format!("failed to read piece file: {}", path.display()),
                source: Some(Box::new(e)),
            }
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse a piece from YAML and validate its structure
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let piece: Self = serde_yaml::from_str(yaml).map_err(|e| TaktError::Config {
            message: "failed to parse piece YAML".to_string(),
            source: Some(Box::new(e)),
        })?;
        piece.validate()?;
        info!(
            "Loaded piece '{}' with {} movements",
            piece.name,
            piece.movements.len()
        );
        Ok(piece)
    }

    /// Get a top-level movement by name
    pub fn get_movement(&self, name: &str) -> Option<&Movement> {
        self.movements.iter().find(|m| m.name == name)
    }

    /// Find a movement anywhere in the piece, parallel sub-movements
    /// included. Rule targets may name either.
    pub fn find_movement(&self, name: &str) -> Option<&Movement> {
        self.get_movement(name).or_else(|| {
            self.movements
                .iter()
                .flat_map(|m| m.parallel.iter())
                .find(|m| m.name == name)
        })
    }

    /// All movement names, including parallel sub-movements
    pub fn movement_names(&self) -> HashSet<&str> {
        let mut names = HashSet::new();
        for movement in &self.movements {
            names.insert(movement.name.as_str());
            for sub in &movement.parallel {
                names.insert(sub.name.as_str());
            }
        }
        names
    }

    /// Validate piece structure.
    ///
    /// Every rule target (movements, parallel children, aggregate parents,
    /// loop-monitor judges) must reference an existing movement or a
    /// terminal token; failures name the offender.
    pub fn validate(&self) -> Result<()> {
        if self.max_movements == 0 {
            return Err(TaktError::validation(format!(
                "piece '{}' has max_movements = 0; the iteration budget must be positive",
                self.name
            )));
        }

        // Movement names must be unique across the piece, sub-movements included
        let mut seen = HashSet::new();
        for movement in &self.movements {
            if !seen.insert(movement.name.as_str()) {
                return Err(TaktError::validation(format!(
                    "duplicate movement name '{}' in piece '{}'",
                    movement.name, self.name
                )));
            }
            for sub in &movement.parallel {
                if !seen.insert(sub.name.as_str()) {
                    return Err(TaktError::validation(format!(
                        "duplicate movement name '{}' in piece '{}'",
                        sub.name, self.name
                    )));
                }
            }
        }

        if self.get_movement(&self.initial_movement).is_none() {
            return Err(TaktError::validation(format!(
                "initial movement '{}' not found in piece '{}'",
                self.initial_movement, self.name
            )));
        }

        let names = self.movement_names();

        for movement in &self.movements {
            self.validate_movement(movement, &names)?;
            for sub in &movement.parallel {
                if sub.is_parallel() {
                    return Err(TaktError::validation(format!(
                        "movement '{}' nests a parallel group inside parallel sub-movement '{}'",
                        movement.name, sub.name
                    )));
                }
                self.validate_movement(sub, &names)?;
            }
        }

        for monitor in &self.loop_monitors {
            let label = monitor.display_name();
            if monitor.cycle.len() < 2 {
                return Err(TaktError::validation(format!(
                    "loop monitor '{}' needs a cycle of at least 2 movements",
                    label
                )));
            }
            if monitor.threshold == 0 {
                return Err(TaktError::validation(format!(
                    "loop monitor '{}' has threshold 0; it must be positive",
                    label
                )));
            }
            for step in &monitor.cycle {
                if !names.contains(step.as_str()) {
                    return Err(TaktError::validation(format!(
                        "loop monitor '{}' cycle references unknown movement '{}'",
                        label, step
                    )));
                }
            }
            if monitor.judge.rules.is_empty() {
                return Err(TaktError::validation(format!(
                    "loop monitor '{}' judge has no rules",
                    label
                )));
            }
            for (index, rule) in monitor.judge.rules.iter().enumerate() {
                if !rule.targets_terminal() && !names.contains(rule.next.as_str()) {
                    return Err(TaktError::validation(format!(
                        "rule {} of loop monitor '{}' judge references unknown movement '{}'",
                        index + 1,
                        label,
                        rule.next
                    )));
                }
            }
        }

        Ok(())
    }

    fn validate_movement(&self, movement: &Movement, names: &HashSet<&str>) -> Result<()> {
        if movement.persona.is_some() && movement.is_parallel() {
            return Err(TaktError::validation(format!(
                "movement '{}' declares both a persona and parallel sub-movements",
                movement.name
            )));
        }

        for (index, rule) in movement.rules.iter().enumerate() {
            if !rule.targets_terminal() && !names.contains(rule.next.as_str()) {
                return Err(TaktError::validation(format!(
                    "rule {} of movement '{}' references unknown movement '{}'",
                    index + 1,
                    movement.name,
                    rule.next
                )));
            }

            let aggregate = matches!(
                rule.condition,
                RuleCondition::All(_) | RuleCondition::Any(_)
            );
            if aggregate && !movement.is_parallel() {
                return Err(TaktError::validation(format!(
                    "rule {} of movement '{}' uses an aggregate condition but the movement has no parallel sub-movements",
                    index + 1,
                    movement.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn minimal_yaml() -> &'static str {
        r#"
name: test-piece
max_movements: 10
initial_movement: plan
movements:
  - name: plan
    persona: planner
    instruction: "Plan the task"
    rules:
      - condition: "Plan ready"
        next: implement
      - condition: "Cannot proceed"
        next: ABORT
  - name: implement
    persona: coder
    instruction: "Do the work"
    rules:
      - condition: "Done"
        next: COMPLETE
"#
    }

    #[test]
    fn test_piece_from_yaml() {
        let piece = Piece::from_yaml(minimal_yaml()).expect("parse failed");
        assert_eq!(piece.name, "test-piece");
        assert_eq!(piece.movements.len(), 2);
        assert_eq!(piece.initial_movement, "plan");
        assert!(piece.movements[0].pass_previous_response);
        assert_eq!(
            piece.movements[0].rules[0].condition,
            RuleCondition::Tag("Plan ready".to_string())
        );
    }

    #[test]
    fn test_condition_parse_variants() {
        assert_eq!(
            RuleCondition::parse("approved").unwrap(),
            RuleCondition::Tag("approved".to_string())
        );
        assert_eq!(
            RuleCondition::parse("ai(\"tests are green\")").unwrap(),
            RuleCondition::Ai("tests are green".to_string())
        );
        assert_eq!(
            RuleCondition::parse("all(\"approved\")").unwrap(),
            RuleCondition::All(vec!["approved".to_string()])
        );
        assert_eq!(
            RuleCondition::parse("any(\"needs_fix\", \"blocked\")").unwrap(),
            RuleCondition::Any(vec!["needs_fix".to_string(), "blocked".to_string()])
        );
    }

    #[test]
    fn test_condition_parse_malformed() {
        assert!(RuleCondition::parse("all(approved)").is_err());
        assert!(RuleCondition::parse("all(\"a\"").is_err());
        assert!(RuleCondition::parse("any()").is_err());
        assert!(RuleCondition::parse("ai(\"a\", \"b\")").is_err());
        assert!(RuleCondition::parse("").is_err());
    }

    #[test]
    fn test_condition_source_round_trip() {
        for source in [
            "approved",
            "ai(\"tests are green\")",
            "all(\"approved\")",
            "any(\"a\", \"b\")",
        ] {
            let parsed = RuleCondition::parse(source).unwrap();
            assert_eq!(parsed.to_source(), source);
        }
    }

    #[test]
    fn test_validation_unknown_rule_target() {
        let yaml = r#"
name: bad-rules
initial_movement: start
movements:
  - name: start
    persona: p
    instruction: "Hello"
    rules:
      - condition: ok
        next: nonexistent
"#;
        let err = Piece::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("nonexistent"));
        assert!(err.to_string().contains("start"));
    }

    #[test]
    fn test_validation_unknown_initial_movement() {
        let yaml = r#"
name: bad-initial
initial_movement: nope
movements:
  - name: start
    persona: p
    instruction: "Hello"
"#;
        let err = Piece::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_validation_duplicate_names() {
        let yaml = r#"
name: dup
initial_movement: start
movements:
  - name: start
    persona: p
    instruction: "First"
  - name: start
    persona: p
    instruction: "Duplicate"
"#;
        assert!(Piece::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_validation_aggregate_on_non_parallel() {
        let yaml = r#"
name: bad-aggregate
initial_movement: solo
movements:
  - name: solo
    persona: p
    instruction: "Work"
    rules:
      - condition: all("approved")
        next: COMPLETE
"#;
        let err = Piece::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("aggregate"));
    }

    #[test]
    fn test_validation_persona_and_parallel_conflict() {
        let yaml = r#"
name: conflict
initial_movement: both
movements:
  - name: both
    persona: p
    instruction: ""
    parallel:
      - name: sub
        persona: q
        instruction: "Sub work"
    rules:
      - condition: all("ok")
        next: COMPLETE
"#;
        let err = Piece::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn test_validation_loop_monitor() {
        let yaml = r#"
name: with-monitor
initial_movement: a
movements:
  - name: a
    persona: p
    instruction: "A"
    rules:
      - condition: next
        next: b
  - name: b
    persona: p
    instruction: "B"
    rules:
      - condition: back
        next: a
loop_monitors:
  - cycle: [a, b]
    threshold: 2
    judge:
      instruction: "Is this loop productive?"
      rules:
        - condition: "Healthy"
          next: a
        - condition: "Stuck"
          next: ABORT
"#;
        let piece = Piece::from_yaml(yaml).expect("parse failed");
        assert_eq!(piece.loop_monitors.len(), 1);
        assert_eq!(piece.loop_monitors[0].display_name(), "a-b");
        assert_eq!(piece.loop_monitors[0].judge_name(), "a-b/judge");
    }

    #[test]
    fn test_validation_monitor_unknown_cycle_movement() {
        let yaml = r#"
name: bad-monitor
initial_movement: a
movements:
  - name: a
    persona: p
    instruction: "A"
loop_monitors:
  - cycle: [a, ghost]
    threshold: 1
    judge:
      instruction: "?"
      rules:
        - condition: go
          next: a
"#;
        let err = Piece::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_parallel_sub_movement_names_visible() {
        let yaml = r#"
name: fan-out
initial_movement: reviewers
movements:
  - name: reviewers
    instruction: ""
    parallel:
      - name: arch
        persona: architect
        instruction: "Review architecture"
        rules:
          - condition: approved
            next: COMPLETE
      - name: sec
        persona: security
        instruction: "Review security"
        rules:
          - condition: approved
            next: COMPLETE
    rules:
      - condition: all("approved")
        next: COMPLETE
      - condition: any("needs_fix")
        next: ABORT
"#;
        let piece = Piece::from_yaml(yaml).expect("parse failed");
        let names = piece.movement_names();
        assert!(names.contains("arch"));
        assert!(names.contains("sec"));
        assert!(piece.get_movement("reviewers").unwrap().is_parallel());
    }
}
