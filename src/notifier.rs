//! Notifies a waiting parent at most once when a child reaches a terminal
//! status.
//!
//! Guards run in order: parent resolution, sibling completeness gate (fails
//! closed), atomic claim (fails open), cooldown, cascade cap. Only the final
//! dispatch may surface an error, and only for non-transient failures.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::JobNetConfig;
use crate::error::DispatchError;
use crate::ports::{ChildCompletionOracle, ClaimService, DispatchRequest, Dispatcher};
use crate::recovery::{RecoveryOutcome, RecoveryProtocol, RecoveryRequest, StopFlag, run_recovery};
use crate::state_machine::{
    AdditionalContext, CycleMarker, DispatchRecord, FinalStatus, JobDefinition, RecoveryKind,
    RunStatus,
};
use crate::telemetry::TelemetrySink;

pub struct NotifyRequest<'a> {
    pub definition: &'a JobDefinition,
    pub run_id: &'a str,
    pub status: &'a FinalStatus,
    pub output: &'a str,
    pub context: &'a AdditionalContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "notification", rename_all = "snake_case")]
pub enum NotifyOutcome {
    Dispatched {
        parent_id: String,
        new_run_id: String,
        attempts: u32,
    },
    /// Root job with nothing further to do.
    RootIdle,
    Cycled {
        recovery: RecoveryOutcome,
    },
    CycleStopped {
        cycle: u32,
    },
    ParentUnresolved {
        error: String,
    },
    SiblingsPending {
        parent_id: String,
        pending: Vec<String>,
    },
    GateUnavailable {
        parent_id: String,
        error: String,
    },
    ClaimDenied {
        parent_id: String,
        claimed_by: Option<String>,
    },
    CooldownActive {
        parent_id: String,
        last_dispatch_at: DateTime<Utc>,
    },
    CascadeCapReached {
        parent_id: String,
        dispatches: usize,
    },
    RetriesExhausted {
        parent_id: String,
        attempts: u32,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentResolution {
    Parent(String),
    Root,
    Unresolved(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiblingGate {
    Open,
    Pending(Vec<String>),
    Unavailable(String),
}

pub struct ParentNotifier<'a, S, T> {
    store: &'a S,
    telemetry: &'a T,
    config: &'a JobNetConfig,
    stop: &'a StopFlag,
}

impl<'a, S, T> ParentNotifier<'a, S, T>
where
    S: ChildCompletionOracle + Dispatcher + ClaimService,
    T: TelemetrySink,
{
    pub fn new(store: &'a S, telemetry: &'a T, config: &'a JobNetConfig, stop: &'a StopFlag) -> Self {
        Self {
            store,
            telemetry,
            config,
            stop,
        }
    }

    /// Notify the parent of a terminal run, or cycle a cyclic root.
    pub async fn notify(&self, req: &NotifyRequest<'_>) -> Result<NotifyOutcome, DispatchError> {
        let child_id = req.definition.id.as_str();

        let parent_id = match self.resolve_parent(req.definition).await {
            ParentResolution::Parent(parent) => parent,
            ParentResolution::Root => return Ok(self.finish_root(req).await),
            ParentResolution::Unresolved(error) => {
                warn!(job_def_id = child_id, %error, "could not resolve parent, skipping notification");
                return Ok(NotifyOutcome::ParentUnresolved { error });
            }
        };

        match self.sibling_gate(&parent_id, Some(child_id)).await {
            SiblingGate::Open => {}
            SiblingGate::Pending(pending) => {
                info!(job_def_id = child_id, %parent_id, ?pending, "siblings still running, parent not dispatched");
                self.checkpoint("siblings_pending", json!({ "parentId": parent_id, "pending": pending }));
                return Ok(NotifyOutcome::SiblingsPending { parent_id, pending });
            }
            SiblingGate::Unavailable(error) => {
                warn!(job_def_id = child_id, %parent_id, %error, "sibling query failed, parent not dispatched");
                return Ok(NotifyOutcome::GateUnavailable { parent_id, error });
            }
        }

        match self.store.try_claim(&parent_id, child_id).await {
            Ok(decision) if !decision.allowed => {
                debug!(job_def_id = child_id, %parent_id, claimed_by = ?decision.claimed_by, "claim lost");
                return Ok(NotifyOutcome::ClaimDenied {
                    parent_id,
                    claimed_by: decision.claimed_by,
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!(job_def_id = child_id, %parent_id, error = %e, "claim service failed, proceeding");
            }
        }

        match self.store.dispatch_history(&parent_id).await {
            Ok(history) => {
                if let Some(outcome) = self.history_guard(&parent_id, child_id, &history) {
                    info!(job_def_id = child_id, %parent_id, ?outcome, "dispatch guard tripped");
                    self.checkpoint("guard_tripped", json!({ "parentId": parent_id, "outcome": outcome }));
                    return Ok(outcome);
                }
            }
            Err(e) => {
                warn!(job_def_id = child_id, %parent_id, error = %e, "dispatch history unavailable, skipping cooldown and cascade checks");
            }
        }

        self.dispatch_with_retry(parent_id, req).await
    }

    /// Recorded parent unless missing or self-referential; then the oracle
    /// decides.
    pub async fn resolve_parent(&self, definition: &JobDefinition) -> ParentResolution {
        let recorded = definition.parent_job_definition_id.as_deref();
        if let Some(parent) = recorded
            && parent != definition.id
        {
            return ParentResolution::Parent(parent.to_string());
        }

        match self.store.get_parent(&definition.id).await {
            Ok(Some(parent)) if parent != definition.id => ParentResolution::Parent(parent),
            Ok(_) => {
                if recorded.is_some() {
                    info!(job_def_id = %definition.id, "cleared stale self-referential parent");
                }
                ParentResolution::Root
            }
            Err(e) => ParentResolution::Unresolved(e.to_string()),
        }
    }

    /// Polls the parent's children until all are terminal or the budget runs
    /// out. The notifying child is excluded: it is known terminal, only its
    /// visibility may lag.
    pub async fn sibling_gate(&self, parent_id: &str, exclude: Option<&str>) -> SiblingGate {
        let attempts = self.config.sibling_poll_attempts.max(1);
        let mut last = SiblingGate::Unavailable("not polled".to_string());

        for poll in 1..=attempts {
            match self.store.list_child_definitions(parent_id, exclude).await {
                Ok(siblings) => {
                    let pending: Vec<String> = siblings
                        .into_iter()
                        .filter(|s| Some(s.id.as_str()) != exclude && !s.is_terminal())
                        .map(|s| s.id)
                        .collect();
                    if pending.is_empty() {
                        return SiblingGate::Open;
                    }
                    debug!(parent_id, poll, ?pending, "siblings not yet terminal");
                    last = SiblingGate::Pending(pending);
                }
                Err(e) => {
                    warn!(parent_id, poll, error = %e, "sibling query failed");
                    last = SiblingGate::Unavailable(e.to_string());
                }
            }
            if poll < attempts {
                sleep(self.config.sibling_poll_delay()).await;
            }
        }
        last
    }

    fn history_guard(
        &self,
        parent_id: &str,
        child_id: &str,
        history: &[DispatchRecord],
    ) -> Option<NotifyOutcome> {
        let last_from_child = history
            .iter()
            .filter(|r| r.source_job_definition_id == child_id)
            .map(|r| r.dispatched_at)
            .max();
        if let Some(last) = last_from_child
            && Utc::now().signed_duration_since(last) < self.config.dispatch_cooldown()
        {
            return Some(NotifyOutcome::CooldownActive {
                parent_id: parent_id.to_string(),
                last_dispatch_at: last,
            });
        }

        if history.len() >= self.config.cascade_cap {
            return Some(NotifyOutcome::CascadeCapReached {
                parent_id: parent_id.to_string(),
                dispatches: history.len(),
            });
        }
        None
    }

    async fn dispatch_with_retry(
        &self,
        parent_id: String,
        req: &NotifyRequest<'_>,
    ) -> Result<NotifyOutcome, DispatchError> {
        let request = DispatchRequest {
            job_definition_id: parent_id.clone(),
            message: self.parent_message(req),
            additional_context: AdditionalContext {
                completed_child_runs: vec![req.run_id.to_string()],
                cycle: self.parent_cycle(&parent_id).await,
                inherited_env: req.context.filtered_env(&self.config.inherited_env_keys),
                ..Default::default()
            },
            source_job_definition_id: Some(req.definition.id.clone()),
        };
        let retry = self.config.dispatch_retry();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.dispatch(&request).await {
                Ok(receipt) => {
                    info!(job_def_id = %req.definition.id, %parent_id, attempt, run_id = %receipt.new_run_id, "parent dispatched");
                    self.checkpoint(
                        "parent_dispatched",
                        json!({ "parentId": parent_id, "newRunId": receipt.new_run_id, "attempts": attempt }),
                    );
                    return Ok(NotifyOutcome::Dispatched {
                        parent_id,
                        new_run_id: receipt.new_run_id,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    let delay_ms = retry.delay_for_attempt(attempt);
                    warn!(%parent_id, attempt, max = retry.max_attempts, error = %e, delay_ms, "parent dispatch failed, retrying");
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) if e.is_transient() => {
                    warn!(%parent_id, attempt, error = %e, "parent dispatch retries exhausted");
                    self.checkpoint(
                        "parent_dispatch_exhausted",
                        json!({ "parentId": parent_id, "attempts": attempt, "error": e.message }),
                    );
                    return Ok(NotifyOutcome::RetriesExhausted {
                        parent_id,
                        attempts: attempt,
                        error: e.message,
                    });
                }
                Err(e) => {
                    warn!(%parent_id, attempt, error = %e, "parent dispatch failed permanently");
                    return Err(e);
                }
            }
        }
    }

    /// Cycle of a recurring parent's latest run, carried into the wake-up so
    /// the parent keeps its count across delegation.
    async fn parent_cycle(&self, parent_id: &str) -> Option<CycleMarker> {
        match self.store.get_definition(parent_id).await {
            Ok(Some(parent)) if parent.cyclic => {}
            Ok(_) => return None,
            Err(e) => {
                warn!(%parent_id, error = %e, "parent definition lookup failed, cycle not carried");
                return None;
            }
        }
        match self.store.list_runs_for_definition(parent_id).await {
            Ok(runs) => runs
                .into_iter()
                .max_by_key(|r| r.timestamp)
                .and_then(|r| r.cycle)
                .map(|number| CycleMarker { number }),
            Err(e) => {
                warn!(%parent_id, error = %e, "parent run lookup failed, cycle not carried");
                None
            }
        }
    }

    async fn finish_root(&self, req: &NotifyRequest<'_>) -> NotifyOutcome {
        if !req.definition.cyclic || req.status.status != RunStatus::Completed {
            return NotifyOutcome::RootIdle;
        }

        let current = req.context.counter(RecoveryKind::Cycle);
        if self.stop.is_raised() {
            info!(job_def_id = %req.definition.id, reason = ?self.stop.reason(), "stop signal raised, not cycling");
            return NotifyOutcome::CycleStopped { cycle: current };
        }

        let protocol = RecoveryProtocol::for_kind(RecoveryKind::Cycle, self.config, req.definition);
        let outcome = run_recovery(
            self.store,
            self.telemetry,
            &protocol,
            &RecoveryRequest {
                definition: req.definition,
                context: req.context,
                detail: &req.status.message,
                pending_children: &[],
            },
            &self.config.inherited_env_keys,
        )
        .await;

        if let RecoveryOutcome::CapReached { attempt, cap, .. } = outcome {
            self.stop.raise(format!(
                "job {} reached max cycles ({attempt}/{cap})",
                req.definition.id
            ));
            return NotifyOutcome::CycleStopped { cycle: attempt };
        }
        NotifyOutcome::Cycled { recovery: outcome }
    }

    fn parent_message(&self, req: &NotifyRequest<'_>) -> String {
        let mut message = format!(
            "Child job {} finished with status {}: {}",
            req.definition.id, req.status.status, req.status.message
        );
        let excerpt = excerpt(req.output, self.config.output_excerpt_chars);
        if !excerpt.is_empty() {
            message.push_str("\n\nOutput excerpt:\n");
            message.push_str(&excerpt);
        }
        message
    }

    fn checkpoint(&self, event: &str, metadata: serde_json::Value) {
        self.telemetry.checkpoint("parent_notification", event, metadata);
    }
}

fn excerpt(output: &str, max_chars: usize) -> String {
    let trimmed = output.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(max_chars).collect();
    cut.push('…');
    cut
}
