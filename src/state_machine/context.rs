//! Free-form context carried by every dispatch of a job definition.
//!
//! Recovery markers (verification, continuation, loop, timeout) are mutually
//! exclusive. The cycle marker survives them, so a recurring job keeps its
//! cycle number across recovery re-dispatches within one cycle; starting a new
//! cycle clears every recovery marker.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::RoutingInfo;

/// The re-dispatch protocols a finished run can enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    Verification,
    Continuation,
    Cycle,
    LoopRecovery,
    TimeoutRecovery,
}

impl RecoveryKind {
    /// Key under which the protocol's marker is stored in the context.
    pub fn context_key(self) -> &'static str {
        match self {
            RecoveryKind::Verification => "verification",
            RecoveryKind::Continuation => "continuation",
            RecoveryKind::Cycle => "cycle",
            RecoveryKind::LoopRecovery => "loopRecovery",
            RecoveryKind::TimeoutRecovery => "timeoutRecovery",
        }
    }
}

impl fmt::Display for RecoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryKind::Verification => write!(f, "verification"),
            RecoveryKind::Continuation => write!(f, "continuation"),
            RecoveryKind::Cycle => write!(f, "cycle"),
            RecoveryKind::LoopRecovery => write!(f, "loop-recovery"),
            RecoveryKind::TimeoutRecovery => write!(f, "timeout-recovery"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptMarker {
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationMarker {
    pub attempt: u32,
    #[serde(default)]
    pub pending_children: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleMarker {
    pub number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryMarker {
    pub attempt: u32,
    #[serde(default)]
    pub message: String,
}

/// Point-in-time status of a child, as captured in a hierarchy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Active,
    Failed,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotChild {
    pub job_definition_id: String,
    pub status: SnapshotStatus,
}

/// Cached copy of a job's child hierarchy. May be stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchySnapshot {
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub children: Vec<SnapshotChild>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<AttemptMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<ContinuationMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<CycleMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_recovery: Option<RecoveryMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_recovery: Option<RecoveryMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hierarchy_snapshot: Option<HierarchySnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_child_runs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workstream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub inherited_env: BTreeMap<String, String>,
    /// Anything else the execution layer stored; passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AdditionalContext {
    pub fn is_verification_run(&self) -> bool {
        self.verification.is_some()
    }

    /// Current counter for a protocol. Cycles are numbered from 1; attempts
    /// count prior recovery dispatches and start at 0.
    pub fn counter(&self, kind: RecoveryKind) -> u32 {
        match kind {
            RecoveryKind::Verification => self.verification.as_ref().map_or(0, |m| m.attempt),
            RecoveryKind::Continuation => self.continuation.as_ref().map_or(0, |m| m.attempt),
            RecoveryKind::Cycle => self.cycle.as_ref().map_or(1, |m| m.number),
            RecoveryKind::LoopRecovery => self.loop_recovery.as_ref().map_or(0, |m| m.attempt),
            RecoveryKind::TimeoutRecovery => {
                self.timeout_recovery.as_ref().map_or(0, |m| m.attempt)
            }
        }
    }

    pub fn clear_recovery_markers(&mut self) {
        self.verification = None;
        self.continuation = None;
        self.loop_recovery = None;
        self.timeout_recovery = None;
    }

    /// Copy only the environment entries named in `allowed`. An empty
    /// whitelist passes the whole map through.
    pub fn filtered_env(&self, allowed: &[String]) -> BTreeMap<String, String> {
        if allowed.is_empty() {
            return self.inherited_env.clone();
        }
        self.inherited_env
            .iter()
            .filter(|(k, _)| allowed.iter().any(|a| a == *k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Builds the context for the next dispatch of the same job definition
    /// under `kind`, with `counter` as the new marker value.
    ///
    /// Execution-only state (snapshot, completed children, free-form extras)
    /// is dropped; routing and the inherited environment are carried.
    pub fn for_recovery(
        &self,
        kind: RecoveryKind,
        counter: u32,
        detail: &str,
        pending_children: &[String],
        routing: &RoutingInfo,
        allowed_env: &[String],
    ) -> Self {
        let mut next = Self {
            cycle: self.cycle.clone(),
            workstream_id: routing
                .workstream_id
                .clone()
                .or_else(|| self.workstream_id.clone()),
            base_branch: routing
                .base_branch
                .clone()
                .or_else(|| self.base_branch.clone()),
            inherited_env: self.filtered_env(allowed_env),
            ..Self::default()
        };

        match kind {
            RecoveryKind::Verification => {
                next.verification = Some(AttemptMarker { attempt: counter });
            }
            RecoveryKind::Continuation => {
                next.continuation = Some(ContinuationMarker {
                    attempt: counter,
                    pending_children: pending_children.to_vec(),
                });
            }
            RecoveryKind::Cycle => {
                next.cycle = Some(CycleMarker { number: counter });
            }
            RecoveryKind::LoopRecovery => {
                next.loop_recovery = Some(RecoveryMarker {
                    attempt: counter,
                    message: detail.to_string(),
                });
            }
            RecoveryKind::TimeoutRecovery => {
                next.timeout_recovery = Some(RecoveryMarker {
                    attempt: counter,
                    message: detail.to_string(),
                });
            }
        }
        next
    }
}
