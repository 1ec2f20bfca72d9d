//! Phase 2 (report writing) and Phase 3 (status judgment) execution,
//! plus previous-response snapshots.
//!
//! Both phases go through the same agent port as Phase 1, resuming the
//! persona session when the provider supports it. Report rotation and
//! snapshot writes must complete before the engine observes a movement as
//! done.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::agent::{AgentResponse, AgentRunOptions, AgentRunner};
use crate::config::RunPaths;
use crate::error::Result;
use crate::utils::time;

use super::config::Movement;
use super::instruction::{ReportInstructionBuilder, StatusJudgmentBuilder};
use super::rules::parse_judgment_tag;
use super::state::MatchMethod;

/// Outcome of a Phase 2 report call
#[derive(Debug)]
pub struct ReportOutcome {
    pub response: AgentResponse,
    /// History files created for rotated prior report versions
    pub rotated: Vec<PathBuf>,
}

/// Outcome of a Phase 3 judgment call
#[derive(Debug)]
pub struct JudgmentOutcome {
    /// 0-based matched rule index, or -1 when the judgment was unresolved
    pub rule_index: i64,
    pub method: MatchMethod,
    pub response: AgentResponse,
}

/// Run Phase 2: ask the agent to write the movement's report files, then
/// archive any prior versions it overwrote.
pub async fn run_report_phase(
    agent: &Arc<dyn AgentRunner>,
    movement: &Movement,
    persona: &str,
    paths: &RunPaths,
    options: AgentRunOptions,
) -> Result<ReportOutcome> {
    let reports_dir = paths.reports_dir();
    let instruction = ReportInstructionBuilder::build(movement, &reports_dir)?;

    // Snapshot prior report contents before the agent may overwrite them
    let mut prior: HashMap<String, String> = HashMap::new();
    for contract in &movement.output_contracts {
        let path = reports_dir.join(&contract.name);
        if let Ok(existing) = tokio::fs::read_to_string(&path).await {
            prior.insert(contract.name.clone(), existing);
        }
    }

    tokio::fs::create_dir_all(&reports_dir).await?;
    let response = agent.run(persona, &instruction, options).await?;

    let mut rotated = Vec::new();
    for contract in &movement.output_contracts {
        let path = reports_dir.join(&contract.name);
        let Some(old) = prior.get(&contract.name) else {
            continue;
        };
        let Ok(new) = tokio::fs::read_to_string(&path).await else {
            continue;
        };
        if &new != old {
            let archived =
                rotate_report_history(&paths.reports_history_dir(), &contract.name, old, time::now())
                    .await?;
            info!(
                "Archived prior report {} -> {}",
                contract.name,
                archived.display()
            );
            rotated.push(archived);
        }
    }

    Ok(ReportOutcome { response, rotated })
}

/// Archive a prior report version under
/// `logs/reports-history/<stem>.<YYYYMMDDTHHMMSSZ>[.<seq>].md`.
///
/// Same-second collisions get `.1`, `.2`, ... suffixes until unique.
pub async fn rotate_report_history(
    history_dir: &Path,
    file_name: &str,
    prior_contents: &str,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(history_dir).await?;

    let stem = file_name.strip_suffix(".md").unwrap_or(file_name);
    let stamp = time::compact_stamp(now);

    let mut candidate = history_dir.join(format!("{}.{}.md", stem, stamp));
    let mut seq = 0u32;
    while tokio::fs::try_exists(&candidate).await? {
        seq += 1;
        candidate = history_dir.join(format!("{}.{}.{}.md", stem, stamp, seq));
    }

    tokio::fs::write(&candidate, prior_contents).await?;
    Ok(candidate)
}

/// Run Phase 3: classify the Phase 1 output against the movement's rule
/// table with a follow-up judgment call.
pub async fn run_judgment_phase(
    agent: &Arc<dyn AgentRunner>,
    movement: &Movement,
    persona: &str,
    response_text: &str,
    options: AgentRunOptions,
) -> Result<JudgmentOutcome> {
    let instruction = StatusJudgmentBuilder::build(movement, response_text)?;
    let response = agent.run(persona, &instruction, options).await?;

    match parse_judgment_tag(&movement.name, movement.rules.len(), &response.content) {
        Some(index) => {
            debug!(
                "Judgment resolved movement '{}' to rule {}",
                movement.name,
                index + 1
            );
            Ok(JudgmentOutcome {
                rule_index: index as i64,
                method: MatchMethod::AiJudgeFallback,
                response,
            })
        }
        None => Ok(JudgmentOutcome {
            rule_index: -1,
            method: MatchMethod::AutoSelect,
            response,
        }),
    }
}

/// Write the canonical previous-response snapshot for a movement output:
/// `context/previous_responses/<movement>.<iteration>.<ts>.md` plus a
/// `latest.md` copy. Returns the snapshot path.
pub async fn snapshot_previous_response(
    paths: &RunPaths,
    movement_name: &str,
    iteration: u32,
    content: &str,
) -> Result<PathBuf> {
    let dir = paths.previous_responses_dir();
    tokio::fs::create_dir_all(&dir).await?;

    // Judge movements may carry '/' in their namespaced name
    let safe_name = movement_name.replace('/', "_");
    let stamp = time::compact_stamp(time::now());
    let path = dir.join(format!("{}.{}.{}.md", safe_name, iteration, stamp));

    tokio::fs::write(&path, content).await?;
    tokio::fs::write(dir.join("latest.md"), content).await?;
    Ok(path)
}
