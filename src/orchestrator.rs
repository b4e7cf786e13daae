use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::JobNetConfig;
use crate::decision::{DispatchDecision, decide};
use crate::error::JobNetError;
use crate::inference::{ExecutionTelemetry, InferenceInput, detect_semantic_failure, infer_status};
use crate::notifier::{NotifyOutcome, NotifyRequest, ParentNotifier};
use crate::ports::{ChildCompletionOracle, ClaimService, Dispatcher, IntegrationCheck};
use crate::recovery::{RecoveryOutcome, RecoveryProtocol, RecoveryRequest, StopFlag, run_recovery};
use crate::state_machine::{
    FinalStatus, FinalStatusCell, JobDefinition, JobRun, RecoveryKind, RunStatus, StatusError,
};
use crate::telemetry::{TelemetrySink, TracingTelemetry};

/// How the execution loop ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionTermination {
    #[default]
    Normal,
    LoopDetected {
        message: String,
    },
    TimedOut {
        message: String,
    },
}

/// Everything known about a run once its execution pass is over.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCompletion {
    pub run: JobRun,
    pub definition: JobDefinition,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub telemetry: ExecutionTelemetry,
    #[serde(default)]
    pub delegated_this_run: bool,
    /// Final text output of the run.
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub termination: ExecutionTermination,
}

impl RunCompletion {
    pub fn from_file(path: &Path) -> Result<Self, JobNetError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum FinalizeAction {
    /// The same job definition was dispatched again.
    Redispatched {
        kind: RecoveryKind,
        attempt: u32,
        new_run_id: String,
    },
    ParentNotified {
        parent_id: String,
        new_run_id: String,
    },
    ParentSkipped {
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        reason: String,
    },
    CycleStopped {
        cycle: u32,
    },
    Idle,
    NotificationFailed {
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeReport {
    pub run_id: String,
    pub job_definition_id: String,
    pub final_status: FinalStatus,
    pub action: FinalizeAction,
}

/// Decides a finished run's status and what happens next.
pub struct CompletionOrchestrator<S, T = TracingTelemetry> {
    store: S,
    telemetry: T,
    config: JobNetConfig,
    stop: StopFlag,
}

impl<S> CompletionOrchestrator<S, TracingTelemetry> {
    pub fn new(store: S, config: JobNetConfig) -> Self {
        Self::with_telemetry(store, TracingTelemetry, config)
    }
}

impl<S, T> CompletionOrchestrator<S, T> {
    pub fn with_telemetry(store: S, telemetry: T, config: JobNetConfig) -> Self {
        Self {
            store,
            telemetry,
            config,
            stop: StopFlag::new(),
        }
    }

    /// Share a stop signal with other orchestrators in the same process.
    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn telemetry(&self) -> &T {
        &self.telemetry
    }
}

impl<S, T> CompletionOrchestrator<S, T>
where
    S: ChildCompletionOracle + Dispatcher + ClaimService + IntegrationCheck,
    T: TelemetrySink,
{
    /// Never fails: every collaborator error is absorbed into the report.
    pub async fn finalize(&self, completion: &RunCompletion) -> FinalizeReport {
        let (final_status, action) = self.resolve(completion).await;
        info!(
            run_id = %completion.run.id,
            job_def_id = %completion.definition.id,
            status = %final_status.status,
            ?action,
            "run finalized"
        );
        self.telemetry.checkpoint(
            "finalize",
            "finished",
            json!({
                "runId": completion.run.id,
                "jobDefinitionId": completion.definition.id,
                "status": final_status.status,
                "action": action,
            }),
        );
        FinalizeReport {
            run_id: completion.run.id.clone(),
            job_definition_id: completion.definition.id.clone(),
            final_status,
            action,
        }
    }

    async fn resolve(&self, completion: &RunCompletion) -> (FinalStatus, FinalizeAction) {
        let definition = &completion.definition;
        let context = &completion.run.additional_context;

        let termination = match &completion.termination {
            ExecutionTermination::Normal => None,
            ExecutionTermination::LoopDetected { message } => {
                Some((RecoveryKind::LoopRecovery, message.as_str()))
            }
            ExecutionTermination::TimedOut { message } => {
                Some((RecoveryKind::TimeoutRecovery, message.as_str()))
            }
        };
        if let Some((kind, message)) = termination {
            let status = FinalStatus::failed(message);
            let outcome = self.recover(kind, definition, completion, message, &[]).await;
            if let RecoveryOutcome::Dispatched {
                kind,
                attempt,
                new_run_id,
            } = outcome
            {
                return (
                    status,
                    FinalizeAction::Redispatched {
                        kind,
                        attempt,
                        new_run_id,
                    },
                );
            }
            let action = self.notify(completion, &status).await;
            return (status, action);
        }

        let inferred = infer_status(
            &self.store,
            &InferenceInput {
                run_id: &completion.run.id,
                job_definition_id: &definition.id,
                error: completion.error.as_deref(),
                telemetry: &completion.telemetry,
                delegated_this_run: completion.delegated_this_run,
                context,
            },
        )
        .await;
        let status = match settle_status(inferred.clone(), &completion.output) {
            Ok(status) => status,
            Err(e) => {
                warn!(run_id = %completion.run.id, error = %e, "could not settle final status, keeping inference");
                inferred
            }
        };

        let decision = decide(&self.store, &self.telemetry, &status, definition, context).await;
        let recovery = match &decision {
            DispatchDecision::None => None,
            DispatchDecision::NeedsVerification => {
                Some(self.recover(RecoveryKind::Verification, definition, completion, "", &[]).await)
            }
            DispatchDecision::NeedsContinuation { unintegrated } => Some(
                self.recover(RecoveryKind::Continuation, definition, completion, "", unintegrated)
                    .await,
            ),
        };
        match recovery {
            Some(RecoveryOutcome::Dispatched {
                kind,
                attempt,
                new_run_id,
            }) => {
                return (
                    status,
                    FinalizeAction::Redispatched {
                        kind,
                        attempt,
                        new_run_id,
                    },
                );
            }
            Some(outcome) => {
                info!(job_def_id = %definition.id, ?outcome, "no re-dispatch, notifying parent");
            }
            None => {}
        }

        if !status.is_terminal() {
            return (status, FinalizeAction::Idle);
        }
        let action = self.notify(completion, &status).await;
        (status, action)
    }

    async fn recover(
        &self,
        kind: RecoveryKind,
        definition: &JobDefinition,
        completion: &RunCompletion,
        detail: &str,
        pending_children: &[String],
    ) -> RecoveryOutcome {
        let protocol = RecoveryProtocol::for_kind(kind, &self.config, definition);
        run_recovery(
            &self.store,
            &self.telemetry,
            &protocol,
            &RecoveryRequest {
                definition,
                context: &completion.run.additional_context,
                detail,
                pending_children,
            },
            &self.config.inherited_env_keys,
        )
        .await
    }

    async fn notify(&self, completion: &RunCompletion, status: &FinalStatus) -> FinalizeAction {
        let notifier = ParentNotifier::new(&self.store, &self.telemetry, &self.config, &self.stop);
        let result = notifier
            .notify(&NotifyRequest {
                definition: &completion.definition,
                run_id: &completion.run.id,
                status,
                output: &completion.output,
                context: &completion.run.additional_context,
            })
            .await;

        match result {
            Ok(outcome) => action_for(outcome),
            Err(e) => {
                // The run's own status stands regardless.
                warn!(job_def_id = %completion.definition.id, error = %e, "parent notification failed");
                FinalizeAction::NotificationFailed {
                    parent_id: completion
                        .definition
                        .parent_job_definition_id
                        .clone()
                        .filter(|p| *p != completion.definition.id),
                    error: e.to_string(),
                }
            }
        }
    }
}

/// Records the inferred status once, then applies the semantic-failure
/// override if the output reports one.
fn settle_status(inferred: FinalStatus, output: &str) -> Result<FinalStatus, StatusError> {
    let mut cell = FinalStatusCell::new();
    let status = cell.set(inferred)?.status;
    if status == RunStatus::Completed
        && let Some(line) = detect_semantic_failure(output)
    {
        info!(%line, "output reports failure, overriding COMPLETED");
        cell.override_with_semantic_failure(format!("semantic failure: {line}"))?;
    }
    cell.into_inner().ok_or(StatusError::NotSet)
}

fn skipped(parent_id: Option<String>, reason: impl Into<String>) -> FinalizeAction {
    FinalizeAction::ParentSkipped {
        parent_id,
        reason: reason.into(),
    }
}

fn action_for(outcome: NotifyOutcome) -> FinalizeAction {
    match outcome {
        NotifyOutcome::Dispatched {
            parent_id,
            new_run_id,
            ..
        } => FinalizeAction::ParentNotified {
            parent_id,
            new_run_id,
        },
        NotifyOutcome::RootIdle => FinalizeAction::Idle,
        NotifyOutcome::Cycled { recovery } => match recovery {
            RecoveryOutcome::Dispatched {
                kind,
                attempt,
                new_run_id,
            } => FinalizeAction::Redispatched {
                kind,
                attempt,
                new_run_id,
            },
            RecoveryOutcome::CapReached { attempt, .. } => {
                FinalizeAction::CycleStopped { cycle: attempt }
            }
            RecoveryOutcome::DispatchFailed { error, .. } => FinalizeAction::NotificationFailed {
                parent_id: None,
                error,
            },
        },
        NotifyOutcome::CycleStopped { cycle } => FinalizeAction::CycleStopped { cycle },
        NotifyOutcome::ParentUnresolved { error } => {
            skipped(None, format!("parent unresolved: {error}"))
        }
        NotifyOutcome::SiblingsPending { parent_id, pending } => skipped(
            Some(parent_id),
            format!("siblings still running: {}", pending.join(", ")),
        ),
        NotifyOutcome::GateUnavailable { parent_id, error } => {
            skipped(Some(parent_id), format!("sibling status unavailable: {error}"))
        }
        NotifyOutcome::ClaimDenied {
            parent_id,
            claimed_by,
        } => skipped(
            Some(parent_id),
            match claimed_by {
                Some(owner) => format!("already claimed by {owner}"),
                None => "already claimed".to_string(),
            },
        ),
        NotifyOutcome::CooldownActive {
            parent_id,
            last_dispatch_at,
        } => skipped(
            Some(parent_id),
            format!("cooldown active since {}", last_dispatch_at.to_rfc3339()),
        ),
        NotifyOutcome::CascadeCapReached {
            parent_id,
            dispatches,
        } => skipped(
            Some(parent_id),
            format!("cascade cap reached ({dispatches} dispatches)"),
        ),
        NotifyOutcome::RetriesExhausted {
            parent_id,
            attempts,
            error,
        } => FinalizeAction::NotificationFailed {
            parent_id: Some(parent_id),
            error: format!("gave up after {attempts} attempts: {error}"),
        },
    }
}
