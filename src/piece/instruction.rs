//! Instruction composition for the three movement phases.
//!
//! Phase 1 prompts resolve template placeholders and auto-inject context
//! sections the template did not place itself. Phase 2 and Phase 3 prompts
//! are built by dedicated builders with their own preconditions.

use std::path::Path;

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{Result, TaktError};

use super::config::{Movement, RuleCondition};
use super::rules::movement_tag;

/// Context for building a movement's Phase 1 instruction
#[derive(Debug, Clone, Copy)]
pub struct InstructionContext<'a> {
    /// The user task being executed
    pub task: &'a str,
    /// Current 1-based iteration
    pub iteration: u32,
    /// Iteration budget of the piece
    pub max_movements: u32,
    /// How many times this movement has been entered
    pub movement_iteration: u32,
    /// Working directory of the execution
    pub cwd: &'a Path,
    /// Project root (may differ from cwd under worktrees)
    pub project_cwd: &'a Path,
    /// Report directory for `{report_dir}` / `{report:<name>}`
    pub report_dir: Option<&'a Path>,
    /// Most recent movement output
    pub previous_output: Option<&'a str>,
    /// Extra inputs supplied by the user at launch
    pub user_inputs: &'a [String],
    /// Language hint for agent responses
    pub language: Option<&'a str>,
}

/// Replace `{` / `}` in interpolated user content with full-width
/// look-alikes so substituted text cannot reintroduce placeholders.
pub fn sanitize_braces(input: &str) -> String {
    input.replace('{', "｛").replace('}', "｝")
}

fn report_placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{report:([^}]+)\}").expect("static regex"))
}

/// Builds Phase 1 (execute) instructions
pub struct InstructionBuilder;

impl InstructionBuilder {
    /// Compose the full prompt for a movement.
    ///
    /// Sections are auto-appended only when the template does not already
    /// contain the corresponding placeholder.
    pub fn build(movement: &Movement, ctx: &InstructionContext<'_>) -> String {
        let template = &movement.instruction;
        let task = sanitize_braces(ctx.task);
        let previous = ctx.previous_output.map(sanitize_braces);
        let user_inputs = ctx
            .user_inputs
            .iter()
            .map(|i| sanitize_braces(i))
            .collect::<Vec<_>>();

        let mut text = template.clone();
        text = text.replace("{task}", &task);
        text = text.replace("{iteration}", &ctx.iteration.to_string());
        text = text.replace("{max_movements}", &ctx.max_movements.to_string());
        text = text.replace("{movement_iteration}", &ctx.movement_iteration.to_string());
        text = text.replace(
            "{previous_response}",
            previous.as_deref().unwrap_or_default(),
        );
        text = text.replace("{user_inputs}", &user_inputs.join("\n"));
        if let Some(report_dir) = ctx.report_dir {
            text = text.replace("{report_dir}", &report_dir.display().to_string());
            text = report_placeholder_re()
                .replace_all(&text, |caps: &regex::Captures<'_>| {
                    report_dir.join(&caps[1]).display().to_string()
                })
                .into_owned();
        }

        let mut sections = vec![text];

        if !template.contains("{task}") {
            sections.push(format!("## User Request\n{}", task));
        }

        if movement.pass_previous_response
            && !template.contains("{previous_response}")
        {
            if let Some(previous) = previous.as_deref() {
                sections.push(format!("## Previous Response\n{}", previous));
            }
        }

        if !user_inputs.is_empty() && !template.contains("{user_inputs}") {
            let bullets = user_inputs
                .iter()
                .map(|i| format!("- {}", i))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("## Additional User Inputs\n{}", bullets));
        }

        if !template.contains("{iteration}") && !template.contains("{movement_iteration}") {
            sections.push(format!(
                "## Piece Context\nIteration: {}/{}\nMovement Iteration: {}",
                ctx.iteration, ctx.max_movements, ctx.movement_iteration
            ));
        }

        if !movement.quality_gates.is_empty() {
            let gates = movement
                .quality_gates
                .iter()
                .map(|g| format!("- {}", g))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("## Quality Gates\n{}", gates));
        }

        sections.push(Self::execution_rules(movement, ctx));

        if let Some(tags) = Self::status_tags(movement) {
            sections.push(tags);
        }

        sections.join("\n\n")
    }

    fn execution_rules(movement: &Movement, ctx: &InstructionContext<'_>) -> String {
        let editing = if movement.edit {
            "Editing is ENABLED: you may create and modify files."
        } else {
            "Editing is DISABLED: do not create or modify any files."
        };

        let mut lines = vec!["## Execution Rules".to_string(), editing.to_string()];
        if let Some(language) = ctx.language {
            lines.push(format!("Respond in {}.", language));
        }
        lines.join("\n")
    }

    /// Status tag table for the movement's tag rules.
    ///
    /// AI conditions are not listed here; they are resolved by the Phase 3
    /// judgment call.
    fn status_tags(movement: &Movement) -> Option<String> {
        let entries: Vec<String> = movement
            .rules
            .iter()
            .enumerate()
            .filter_map(|(index, rule)| match &rule.condition {
                RuleCondition::Tag(text) => {
                    Some(format!("{} - {}", movement_tag(&movement.name, index), text))
                }
                _ => None,
            })
            .collect();

        if entries.is_empty() {
            return None;
        }

        Some(format!(
            "## Status Tags\nEnd your response with exactly one of the following tags, on its own line, describing the result:\n{}",
            entries.join("\n")
        ))
    }
}

/// Builds Phase 2 (report-writing) instructions
pub struct ReportInstructionBuilder;

impl ReportInstructionBuilder {
    /// Compose the report-writing prompt.
    ///
    /// Fails when the movement declares no output contracts; Phase 2 must
    /// not be requested for such movements.
    pub fn build(movement: &Movement, report_dir: &Path) -> Result<String> {
        if movement.output_contracts.is_empty() {
            return Err(TaktError::instruction(
                &movement.name,
                "report phase requested but the movement has no output contracts",
            ));
        }

        let mut lines = vec![
            "Write the report files for the work you just completed.".to_string(),
            format!("Report directory: {}", report_dir.display()),
            String::new(),
            "## Report Files".to_string(),
        ];

        for contract in &movement.output_contracts {
            let path = report_dir.join(&contract.name);
            if contract.description.is_empty() {
                lines.push(format!("- {}", path.display()));
            } else {
                lines.push(format!("- {}: {}", path.display(), contract.description));
            }
        }

        lines.push(String::new());
        lines.push(
            "Overwrite existing files; prior versions are archived automatically.".to_string(),
        );

        Ok(lines.join("\n"))
    }
}

/// Builds Phase 3 (status-judgment) instructions
pub struct StatusJudgmentBuilder;

impl StatusJudgmentBuilder {
    /// Compose the rule-classification prompt.
    ///
    /// Fails when the movement has no rules; there is nothing to judge.
    pub fn build(movement: &Movement, response: &str) -> Result<String> {
        if movement.rules.is_empty() {
            return Err(TaktError::instruction(
                &movement.name,
                "status judgment requested but the movement has no rules",
            ));
        }

        let table = movement
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                format!(
                    "{} - {}",
                    movement_tag(&movement.name, index),
                    rule.condition.label()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(format!(
            "Classify the result of movement '{}' against the rules below.\n\n\
             ## Rules\n{}\n\n\
             ## Response To Classify\n{}\n\n\
             Output exactly one tag from the table above, on its own line. \
             Output nothing else.",
            movement.name,
            table,
            sanitize_braces(response)
        ))
    }
}
