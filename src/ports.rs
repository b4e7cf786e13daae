//! Collaborator seams used by the engines.
//!
//! Every read goes through [`ChildCompletionOracle`], which is eventually
//! consistent: callers tolerate lag with explicit polling budgets and degrade
//! on errors rather than propagating them.

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::state_machine::{
    AdditionalContext, ChildDefinition, DispatchRecord, JobDefinition, RoutingInfo, RunSummary,
};
use crate::store::StoreError;

/// Read-side queries over job definitions and runs.
#[allow(async_fn_in_trait)]
pub trait ChildCompletionOracle {
    async fn get_definition(&self, id: &str) -> Result<Option<JobDefinition>, StoreError>;

    /// Authoritative parent of a definition, `None` for roots.
    async fn get_parent(&self, id: &str) -> Result<Option<String>, StoreError>;

    /// Definitions whose parent is `parent`, optionally leaving one out.
    async fn list_child_definitions(
        &self,
        parent: &str,
        exclude: Option<&str>,
    ) -> Result<Vec<ChildDefinition>, StoreError>;

    async fn list_runs_for_definition(&self, id: &str) -> Result<Vec<RunSummary>, StoreError>;

    /// Runs spawned directly by one run. Coarser than the definition query.
    async fn list_child_runs_of_run(&self, run_id: &str) -> Result<Vec<RunSummary>, StoreError>;

    async fn routing(&self, id: &str) -> Result<RoutingInfo, StoreError>;

    /// Every recorded dispatch targeting `parent`.
    async fn dispatch_history(&self, parent: &str) -> Result<Vec<DispatchRecord>, StoreError>;
}

/// A request to start a new run of an existing job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub job_definition_id: String,
    pub message: String,
    pub additional_context: AdditionalContext,
    /// Set when a child notifies its parent; feeds cooldown and cascade checks.
    #[serde(default)]
    pub source_job_definition_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    pub new_run_id: String,
}

#[allow(async_fn_in_trait)]
pub trait Dispatcher {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimDecision {
    pub allowed: bool,
    #[serde(default)]
    pub claimed_by: Option<String>,
}

/// First caller wins per `(parent, child)` pair.
#[allow(async_fn_in_trait)]
pub trait ClaimService {
    async fn try_claim(&self, parent: &str, child: &str) -> Result<ClaimDecision, StoreError>;
}

/// Reports which children produced work not yet merged into a job's baseline.
#[allow(async_fn_in_trait)]
pub trait IntegrationCheck {
    async fn unintegrated_children(&self, id: &str) -> Result<Vec<String>, StoreError>;
}
