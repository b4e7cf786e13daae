//! Decides whether a `Completed` run re-dispatches its own job definition
//! before the parent hears about it.

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::ports::{ChildCompletionOracle, IntegrationCheck};
use crate::state_machine::{AdditionalContext, FinalStatus, JobDefinition, RunStatus};
use crate::telemetry::TelemetrySink;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum DispatchDecision {
    /// Proceed to parent notification.
    None,
    NeedsVerification,
    NeedsContinuation { unintegrated: Vec<String> },
}

/// - Non-`Completed` runs and verification runs: `None`.
/// - Jobs that never had children: `None`.
/// - Otherwise: continuation while any child's work is unintegrated,
///   verification once everything is merged.
pub async fn decide<S: ChildCompletionOracle + IntegrationCheck>(
    store: &S,
    telemetry: &impl TelemetrySink,
    status: &FinalStatus,
    definition: &JobDefinition,
    context: &AdditionalContext,
) -> DispatchDecision {
    if status.status != RunStatus::Completed {
        return DispatchDecision::None;
    }
    if context.is_verification_run() {
        debug!(job_def_id = %definition.id, "verification run completed, no re-dispatch");
        return DispatchDecision::None;
    }

    if !had_children(store, definition, context).await {
        return DispatchDecision::None;
    }

    let decision = match store.unintegrated_children(&definition.id).await {
        Ok(unintegrated) if unintegrated.is_empty() => DispatchDecision::NeedsVerification,
        Ok(unintegrated) => DispatchDecision::NeedsContinuation { unintegrated },
        Err(e) => {
            // Verification reviews the merged result anyway.
            warn!(job_def_id = %definition.id, error = %e, "integration check failed");
            DispatchDecision::NeedsVerification
        }
    };
    telemetry.checkpoint(
        "decision",
        "decided",
        json!({ "jobDefinitionId": definition.id, "decision": decision }),
    );
    decision
}

async fn had_children(
    oracle: &impl ChildCompletionOracle,
    definition: &JobDefinition,
    context: &AdditionalContext,
) -> bool {
    if !context.completed_child_runs.is_empty() {
        return true;
    }
    match oracle.list_child_definitions(&definition.id, None).await {
        Ok(children) => !children.is_empty(),
        Err(e) => {
            warn!(job_def_id = %definition.id, error = %e, "child lookup failed, assuming none");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryStore, RecordingTelemetry};
    use crate::state_machine::AttemptMarker;

    fn completed() -> FinalStatus {
        FinalStatus::completed("all 1 child job(s) finished")
    }

    fn store_with_child() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.add_definition(JobDefinition::new("job-1"));
        store.add_definition(JobDefinition::new("child-a").with_parent("job-1"));
        store
    }

    #[tokio::test]
    async fn non_completed_never_redispatches() {
        let store = store_with_child();
        let decision = decide(
            &store,
            &RecordingTelemetry::default(),
            &FinalStatus::failed("boom"),
            &JobDefinition::new("job-1"),
            &AdditionalContext::default(),
        )
        .await;
        assert_eq!(decision, DispatchDecision::None);
    }

    #[tokio::test]
    async fn verification_run_proceeds_to_parent() {
        let store = store_with_child();
        let ctx = AdditionalContext {
            verification: Some(AttemptMarker { attempt: 1 }),
            ..Default::default()
        };
        let decision = decide(
            &store,
            &RecordingTelemetry::default(),
            &completed(),
            &JobDefinition::new("job-1"),
            &ctx,
        )
        .await;
        assert_eq!(decision, DispatchDecision::None);
    }

    #[tokio::test]
    async fn leaf_job_needs_nothing() {
        let store = InMemoryStore::new();
        store.add_definition(JobDefinition::new("leaf"));
        let decision = decide(
            &store,
            &RecordingTelemetry::default(),
            &FinalStatus::completed("completed direct work"),
            &JobDefinition::new("leaf"),
            &AdditionalContext::default(),
        )
        .await;
        assert_eq!(decision, DispatchDecision::None);
    }

    #[tokio::test]
    async fn integrated_children_need_verification() {
        let store = store_with_child();
        let decision = decide(
            &store,
            &RecordingTelemetry::default(),
            &completed(),
            &JobDefinition::new("job-1"),
            &AdditionalContext::default(),
        )
        .await;
        assert_eq!(decision, DispatchDecision::NeedsVerification);
    }

    #[tokio::test]
    async fn unintegrated_children_need_continuation() {
        let store = store_with_child();
        store.set_unintegrated("job-1", vec!["child-a".into()]);
        let decision = decide(
            &store,
            &RecordingTelemetry::default(),
            &completed(),
            &JobDefinition::new("job-1"),
            &AdditionalContext::default(),
        )
        .await;
        assert_eq!(
            decision,
            DispatchDecision::NeedsContinuation {
                unintegrated: vec!["child-a".into()]
            }
        );
    }

    #[tokio::test]
    async fn context_history_counts_as_children_when_oracle_is_down() {
        let store = InMemoryStore::new();
        store.set_oracle_available(false);
        let ctx = AdditionalContext {
            completed_child_runs: vec!["run-child-a".into()],
            ..Default::default()
        };
        let decision = decide(
            &store,
            &RecordingTelemetry::default(),
            &completed(),
            &JobDefinition::new("job-1"),
            &ctx,
        )
        .await;
        // Integration check is down too: falls back to verification.
        assert_eq!(decision, DispatchDecision::NeedsVerification);
    }
}
