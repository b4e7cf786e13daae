//! Status inference for a run that just finished executing.
//!
//! Classification never fails: oracle errors degrade through three tiers
//! (live query, cached hierarchy snapshot, per-run child query) and, if every
//! tier is unavailable, to a conservative `Waiting`.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ports::ChildCompletionOracle;
use crate::state_machine::{
    AdditionalContext, FinalStatus, HierarchySnapshot, RunStatus, RunSummary, SnapshotStatus,
};
use crate::store::StoreError;

/// Tools whose name starts with this prefix spawn child jobs.
pub const DISPATCH_TOOL_PREFIX: &str = "dispatch_";

/// One tool invocation recorded during execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub tool: String,
    /// The call itself executed without error.
    #[serde(default)]
    pub succeeded: bool,
    /// The application-level result reported ok.
    #[serde(default)]
    pub outcome_ok: bool,
    #[serde(default)]
    pub job_definition_id: Option<String>,
}

impl ToolCall {
    /// Child definition id if this call successfully dispatched one.
    fn dispatched_child(&self) -> Option<&str> {
        if !self.tool.starts_with(DISPATCH_TOOL_PREFIX) || !self.succeeded || !self.outcome_ok {
            return None;
        }
        self.job_definition_id.as_deref().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTelemetry {
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ExecutionTelemetry {
    /// Distinct child definitions dispatched this run. Retries that yield the
    /// same id count once.
    pub fn dispatched_children(&self) -> BTreeSet<&str> {
        self.tool_calls
            .iter()
            .filter_map(ToolCall::dispatched_child)
            .collect()
    }
}

pub struct InferenceInput<'a> {
    pub run_id: &'a str,
    pub job_definition_id: &'a str,
    pub error: Option<&'a str>,
    pub telemetry: &'a ExecutionTelemetry,
    pub delegated_this_run: bool,
    pub context: &'a AdditionalContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TallySource {
    Live,
    Snapshot,
    RunQuery,
}

#[derive(Debug, Default)]
struct ChildTally {
    total: usize,
    pending: Vec<String>,
    failed: Vec<String>,
}

enum Completeness {
    NoChildren,
    Found(TallySource, ChildTally),
    Unknown(String),
}

/// Classify a finished run. First match wins: error, delegation, child
/// completeness, direct work.
pub async fn infer_status(
    oracle: &impl ChildCompletionOracle,
    input: &InferenceInput<'_>,
) -> FinalStatus {
    if let Some(error) = input.error {
        let message = if error.trim().is_empty() {
            "execution failed".to_string()
        } else {
            error.to_string()
        };
        return FinalStatus::failed(message);
    }

    let dispatched = input.telemetry.dispatched_children();
    if input.delegated_this_run || !dispatched.is_empty() {
        let message = if dispatched.is_empty() {
            "delegated work to child jobs".to_string()
        } else {
            format!(
                "dispatched {} child job(s): {}",
                dispatched.len(),
                dispatched.into_iter().collect::<Vec<_>>().join(", ")
            )
        };
        return FinalStatus::delegating(message);
    }

    match child_completeness(oracle, input).await {
        Completeness::NoChildren => FinalStatus::completed("completed direct work"),
        Completeness::Found(source, tally) => classify(source, &tally),
        Completeness::Unknown(reason) => FinalStatus::waiting(format!(
            "could not verify child completion: {reason}"
        )),
    }
}

async fn child_completeness(
    oracle: &impl ChildCompletionOracle,
    input: &InferenceInput<'_>,
) -> Completeness {
    match live_tally(oracle, input.job_definition_id).await {
        Ok(tally) if tally.total == 0 => return Completeness::NoChildren,
        Ok(tally) => return Completeness::Found(TallySource::Live, tally),
        Err(e) => warn!(
            job_def_id = input.job_definition_id,
            error = %e,
            "live child query failed, falling back"
        ),
    }

    if let Some(snapshot) = &input.context.hierarchy_snapshot {
        debug!(
            job_def_id = input.job_definition_id,
            captured_at = %snapshot.captured_at,
            "using cached hierarchy snapshot"
        );
        let tally = snapshot_tally(snapshot);
        if tally.total == 0 {
            return Completeness::NoChildren;
        }
        return Completeness::Found(TallySource::Snapshot, tally);
    }

    match oracle.list_child_runs_of_run(input.run_id).await {
        Ok(runs) if runs.is_empty() => Completeness::NoChildren,
        Ok(runs) => Completeness::Found(TallySource::RunQuery, run_tally(&runs)),
        Err(e) => {
            warn!(run_id = input.run_id, error = %e, "per-run child query failed");
            Completeness::Unknown(e.to_string())
        }
    }
}

async fn live_tally(
    oracle: &impl ChildCompletionOracle,
    job_definition_id: &str,
) -> Result<ChildTally, StoreError> {
    let children = oracle.list_child_definitions(job_definition_id, None).await?;
    let mut tally = ChildTally {
        total: children.len(),
        ..Default::default()
    };

    for child in children {
        let runs = oracle.list_runs_for_definition(&child.id).await?;
        let latest = runs.iter().max_by_key(|r| r.timestamp);
        match latest {
            // Dispatched but not yet visible: still pending.
            None => tally.pending.push(child.id),
            Some(run) if !run.is_settled() => tally.pending.push(child.id),
            Some(run) if run.own_status == Some(RunStatus::Failed) => {
                tally.failed.push(child.id)
            }
            Some(_) => {}
        }
    }
    Ok(tally)
}

fn snapshot_tally(snapshot: &HierarchySnapshot) -> ChildTally {
    let mut tally = ChildTally {
        total: snapshot.children.len(),
        ..Default::default()
    };
    for child in &snapshot.children {
        match child.status {
            SnapshotStatus::Active => tally.pending.push(child.job_definition_id.clone()),
            SnapshotStatus::Failed => tally.failed.push(child.job_definition_id.clone()),
            SnapshotStatus::Completed => {}
        }
    }
    tally
}

fn run_tally(runs: &[RunSummary]) -> ChildTally {
    ChildTally {
        total: runs.len(),
        pending: runs
            .iter()
            .filter(|r| !r.delivered)
            .map(|r| r.id.clone())
            .collect(),
        failed: Vec::new(),
    }
}

fn classify(source: TallySource, tally: &ChildTally) -> FinalStatus {
    if !tally.pending.is_empty() {
        let suffix = if source == TallySource::Snapshot {
            " (cached hierarchy)"
        } else {
            ""
        };
        return FinalStatus::waiting(format!(
            "waiting on {} of {} child job(s){suffix}: {}",
            tally.pending.len(),
            tally.total,
            tally.pending.join(", ")
        ));
    }

    // Only the snapshot tier treats failed children as blocking: the live
    // tier leaves them for the parent to review after completion.
    if source == TallySource::Snapshot && !tally.failed.is_empty() {
        return FinalStatus::waiting(format!(
            "{} child job(s) failed and require remediation: {}",
            tally.failed.len(),
            tally.failed.join(", ")
        ));
    }

    if tally.failed.is_empty() {
        FinalStatus::completed(format!("all {} child job(s) finished", tally.total))
    } else {
        FinalStatus::completed(format!(
            "all {} child job(s) finished, {} failed: {}",
            tally.total,
            tally.failed.len(),
            tally.failed.join(", ")
        ))
    }
}

static SEMANTIC_FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[\s>*#_-]*(?i:(?:final\s+)?status)[*_\s]*[:=][*_\s]*(?i:failed)\b.*$|^[\s>*#_-]*FAILED:.*$|^[\s>*#_-]*(?i:execution failed)\b.*$|^.*(?i:unable to complete the task).*$",
    )
    .expect("valid regex")
});

/// Looks for an explicit failure report in the run's final output.
/// Returns the offending line, trimmed.
pub fn detect_semantic_failure(output: &str) -> Option<String> {
    SEMANTIC_FAILURE_RE
        .find(output)
        .map(|m| m.as_str().trim().to_string())
}
