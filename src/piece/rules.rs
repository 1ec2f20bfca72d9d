//! Rule evaluation: tag detection and aggregate conditions.
//!
//! Evaluation order for a normal movement (takt-style):
//! 1. `[MOVEMENT_NAME:N]` tag detection against the Phase 1 output
//! 2. AI conditions are not evaluated here; the engine runs the Phase 3
//!    judgment call when tags were inconclusive
//!
//! A parallel parent movement routes on its aggregate rules instead,
//! evaluated over the sub-movements' own match results.

use regex::Regex;
use tracing::{debug, warn};

use super::config::{Movement, RuleCondition};
use super::state::{MatchMethod, RuleMatch};

/// Render the detection tag for a rule: `[MOVEMENT_NAME:N]`.
///
/// Movement names are uppercased; hyphens are preserved. `index` is the
/// 0-based rule index, rendered 1-based.
pub fn movement_tag(movement_name: &str, index: usize) -> String {
    format!("[{}:{}]", movement_name.to_uppercase(), index + 1)
}

/// Detect the matched rule for a movement's Phase 1 output.
///
/// Tag rules are checked in declaration order; the first whose tag occurs
/// anywhere in the response wins. Detection is pure substring search, so
/// running it twice on the same content returns the same index.
pub fn detect_matched_rule(movement: &Movement, response: &str) -> Option<RuleMatch> {
    for (index, rule) in movement.rules.iter().enumerate() {
        if !matches!(rule.condition, RuleCondition::Tag(_)) {
            continue;
        }
        let tag = movement_tag(&movement.name, index);
        if response.contains(&tag) {
            debug!(
                "Movement '{}' matched rule {} via tag {}",
                movement.name,
                index + 1,
                tag
            );
            return Some(RuleMatch::new(index, MatchMethod::Phase1Tag));
        }
    }
    None
}

/// Parse a `[MOVEMENT_NAME:i]` tag out of a Phase 3 judgment response.
///
/// Returns the 0-based rule index of the first tag occurrence, or `None`
/// when the judgment produced no usable tag.
pub fn parse_judgment_tag(movement_name: &str, rule_count: usize, response: &str) -> Option<usize> {
    let pattern = format!(r"\[{}:(\d+)\]", regex::escape(&movement_name.to_uppercase()));
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(e) => {
            warn!("Invalid judgment tag pattern for '{}': {}", movement_name, e);
            return None;
        }
    };

    let captures = re.captures(response)?;
    let index: usize = captures.get(1)?.as_str().parse().ok()?;
    if index >= 1 && index <= rule_count {
        Some(index - 1)
    } else {
        warn!(
            "Judgment tag index {} out of range for movement '{}' ({} rules)",
            index, movement_name, rule_count
        );
        None
    }
}

/// Result of one parallel sub-movement, as seen by aggregate rules
#[derive(Debug, Clone)]
pub struct SubMovementResult {
    /// Sub-movement name
    pub name: String,
    /// Condition label of the sub-movement's matched rule, when one matched
    pub matched_condition: Option<String>,
}

/// Evaluate a parallel parent's aggregate rules over its sub-results.
///
/// - `all(set)` is true iff every sub-movement matched a rule whose
///   condition is in the set
/// - `any(set)` is true iff at least one did
///
/// With zero sub-movements both are false. A sub-movement with no match
/// falsifies `all` and contributes nothing to `any`. The first matching
/// parent rule wins.
pub fn evaluate_aggregate(parent: &Movement, sub_results: &[SubMovementResult]) -> Option<RuleMatch> {
    for (index, rule) in parent.rules.iter().enumerate() {
        let matched = match &rule.condition {
            RuleCondition::All(set) => {
                !sub_results.is_empty()
                    && sub_results.iter().all(|sub| {
                        sub.matched_condition
                            .as_ref()
                            .is_some_and(|c| set.contains(c))
                    })
            }
            RuleCondition::Any(set) => sub_results.iter().any(|sub| {
                sub.matched_condition
                    .as_ref()
                    .is_some_and(|c| set.contains(c))
            }),
            _ => continue,
        };

        if matched {
            debug!(
                "Parallel movement '{}' matched aggregate rule {}",
                parent.name,
                index + 1
            );
            return Some(RuleMatch::new(index, MatchMethod::Aggregate));
        }
    }
    None
}
