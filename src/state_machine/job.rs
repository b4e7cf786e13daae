use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::AdditionalContext;
use super::state::RunStatus;

/// Reusable identity for a unit of work. Re-dispatches keep the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    pub id: String,
    #[serde(default)]
    pub parent_job_definition_id: Option<String>,
    #[serde(default)]
    pub cyclic: bool,
    #[serde(default)]
    pub max_cycles: Option<u32>,
}

impl JobDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_job_definition_id: None,
            cyclic: false,
            max_cycles: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_job_definition_id = Some(parent.into());
        self
    }

    pub fn cyclic(mut self, max_cycles: Option<u32>) -> Self {
        self.cyclic = true;
        self.max_cycles = max_cycles;
        self
    }
}

/// One concrete execution attempt of a job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub id: String,
    pub job_definition_id: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub delivered: bool,
    #[serde(default)]
    pub own_status: Option<RunStatus>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub additional_context: AdditionalContext,
}

impl JobRun {
    pub fn new(id: impl Into<String>, job_definition_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            job_definition_id: job_definition_id.into(),
            dependencies: Vec::new(),
            delivered: false,
            own_status: None,
            completed_at: None,
            additional_context: AdditionalContext::default(),
        }
    }
}

/// Read-side view of a run as reported by the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: String,
    pub delivered: bool,
    #[serde(default)]
    pub own_status: Option<RunStatus>,
    pub timestamp: DateTime<Utc>,
    /// Cycle number the run was dispatched under, for recurring jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
}

impl RunSummary {
    /// Delivered and not itself waiting on grandchildren.
    ///
    /// Delivery is the completion signal. A delivered run with no recorded
    /// status never delegated, so it counts as settled.
    pub fn is_settled(&self) -> bool {
        self.delivered
            && !matches!(
                self.own_status,
                Some(RunStatus::Waiting) | Some(RunStatus::Delegating)
            )
    }
}

/// A job definition whose parent is some given definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildDefinition {
    pub id: String,
    #[serde(default)]
    pub own_status: Option<RunStatus>,
}

impl ChildDefinition {
    pub fn is_terminal(&self) -> bool {
        self.own_status.is_some_and(RunStatus::is_terminal)
    }
}

/// A persisted dispatch from a child definition to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRecord {
    pub source_job_definition_id: String,
    pub dispatched_at: DateTime<Utc>,
}

/// Best-effort routing hints copied into recovery payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingInfo {
    #[serde(default)]
    pub workstream_id: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
        }
    }
}

impl RetryConfig {
    /// Delay after the given (1-based) failed attempt.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}
