//! Re-dispatch protocols for a job definition.
//!
//! Verification, continuation, cycle, loop recovery and timeout recovery all
//! share one routine: read the counter from context, refuse past the cap,
//! resolve routing, build a payload carrying this protocol's marker, and
//! re-dispatch the same job definition id. Each protocol differs only in its
//! cap, context key and message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::JobNetConfig;
use crate::ports::{ChildCompletionOracle, DispatchRequest, Dispatcher};
use crate::state_machine::{AdditionalContext, JobDefinition, RecoveryKind};
use crate::telemetry::TelemetrySink;

/// Inputs available to a protocol's message builder.
pub struct RecoveryPrompt<'a> {
    pub job_definition_id: &'a str,
    pub attempt: u32,
    pub cap: Option<u32>,
    pub detail: &'a str,
    pub pending_children: &'a [String],
}

pub struct RecoveryProtocol {
    pub kind: RecoveryKind,
    pub cap: Option<u32>,
    build_message: fn(&RecoveryPrompt<'_>) -> String,
}

impl RecoveryProtocol {
    pub fn verification(cap: u32) -> Self {
        Self {
            kind: RecoveryKind::Verification,
            cap: Some(cap),
            build_message: verification_message,
        }
    }

    /// Uncapped: bounded by the shrinking set of unintegrated children.
    pub fn continuation() -> Self {
        Self {
            kind: RecoveryKind::Continuation,
            cap: None,
            build_message: continuation_message,
        }
    }

    pub fn cycle(max_cycles: Option<u32>) -> Self {
        Self {
            kind: RecoveryKind::Cycle,
            cap: max_cycles,
            build_message: cycle_message,
        }
    }

    pub fn loop_recovery(cap: u32) -> Self {
        Self {
            kind: RecoveryKind::LoopRecovery,
            cap: Some(cap),
            build_message: loop_message,
        }
    }

    pub fn timeout_recovery(cap: u32) -> Self {
        Self {
            kind: RecoveryKind::TimeoutRecovery,
            cap: Some(cap),
            build_message: timeout_message,
        }
    }

    /// Protocol for `kind` with caps taken from config. A definition's own
    /// `max_cycles` wins over the global one.
    pub fn for_kind(kind: RecoveryKind, config: &JobNetConfig, definition: &JobDefinition) -> Self {
        match kind {
            RecoveryKind::Verification => Self::verification(config.verification_cap),
            RecoveryKind::Continuation => Self::continuation(),
            RecoveryKind::Cycle => Self::cycle(definition.max_cycles.or(config.max_cycles)),
            RecoveryKind::LoopRecovery => Self::loop_recovery(config.loop_recovery_cap),
            RecoveryKind::TimeoutRecovery => Self::timeout_recovery(config.timeout_recovery_cap),
        }
    }

    pub fn context_key(&self) -> &'static str {
        self.kind.context_key()
    }
}

fn of_cap(cap: Option<u32>) -> String {
    cap.map(|c| format!("/{c}")).unwrap_or_default()
}

fn verification_message(p: &RecoveryPrompt<'_>) -> String {
    format!(
        "Verification pass {}{}: every child job has finished and its work is integrated. \
         Review the combined result of job {} against its acceptance criteria, fix any gaps, \
         and report the final outcome.",
        p.attempt,
        of_cap(p.cap),
        p.job_definition_id
    )
}

fn continuation_message(p: &RecoveryPrompt<'_>) -> String {
    format!(
        "Continuation {}: {} child job(s) produced work that is not yet integrated: {}. \
         Integrate it into this job's baseline before completing.",
        p.attempt,
        p.pending_children.len(),
        p.pending_children.join(", ")
    )
}

fn cycle_message(p: &RecoveryPrompt<'_>) -> String {
    format!(
        "Cycle {}{}: the previous cycle of job {} completed. Start the next cycle.",
        p.attempt,
        of_cap(p.cap),
        p.job_definition_id
    )
}

fn loop_message(p: &RecoveryPrompt<'_>) -> String {
    format!(
        "Loop recovery {}{}: the previous run was stopped for repeating itself ({}). \
         Take a different approach and avoid repeating the same actions.",
        p.attempt,
        of_cap(p.cap),
        p.detail
    )
}

fn timeout_message(p: &RecoveryPrompt<'_>) -> String {
    format!(
        "Timeout recovery {}{}: the previous run timed out ({}). \
         Narrow the scope, checkpoint progress early, and finish within the time budget.",
        p.attempt,
        of_cap(p.cap),
        p.detail
    )
}

pub struct RecoveryRequest<'a> {
    pub definition: &'a JobDefinition,
    pub context: &'a AdditionalContext,
    /// Free text describing why the protocol fired (loop/timeout message).
    pub detail: &'a str,
    pub pending_children: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Dispatched {
        kind: RecoveryKind,
        attempt: u32,
        new_run_id: String,
    },
    CapReached {
        kind: RecoveryKind,
        attempt: u32,
        cap: u32,
    },
    DispatchFailed {
        kind: RecoveryKind,
        attempt: u32,
        error: String,
    },
}

impl RecoveryOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, RecoveryOutcome::Dispatched { .. })
    }
}

/// Runs one recovery protocol against the same job definition id.
pub async fn run_recovery<S: ChildCompletionOracle + Dispatcher>(
    store: &S,
    telemetry: &impl TelemetrySink,
    protocol: &RecoveryProtocol,
    request: &RecoveryRequest<'_>,
    allowed_env: &[String],
) -> RecoveryOutcome {
    let kind = protocol.kind;
    let job_def_id = request.definition.id.as_str();
    let current = request.context.counter(kind);

    if let Some(cap) = protocol.cap
        && current >= cap
    {
        info!(job_def_id, %kind, current, cap, "recovery cap reached");
        telemetry.checkpoint(
            "recovery",
            "cap_reached",
            json!({ "kind": kind, "contextKey": protocol.context_key(), "jobDefinitionId": job_def_id, "current": current, "cap": cap }),
        );
        return RecoveryOutcome::CapReached {
            kind,
            attempt: current,
            cap,
        };
    }
    let next = current + 1;

    let routing = match store.routing(job_def_id).await {
        Ok(routing) => routing,
        Err(e) => {
            warn!(job_def_id, error = %e, "routing lookup failed, dispatching without it");
            Default::default()
        }
    };

    let context = request.context.for_recovery(
        kind,
        next,
        request.detail,
        request.pending_children,
        &routing,
        allowed_env,
    );
    let message = (protocol.build_message)(&RecoveryPrompt {
        job_definition_id: job_def_id,
        attempt: next,
        cap: protocol.cap,
        detail: request.detail,
        pending_children: request.pending_children,
    });
    let dispatch = DispatchRequest {
        job_definition_id: job_def_id.to_string(),
        message,
        additional_context: context,
        source_job_definition_id: None,
    };

    match store.dispatch(&dispatch).await {
        Ok(receipt) => {
            info!(job_def_id, %kind, attempt = next, run_id = %receipt.new_run_id, "recovery dispatched");
            telemetry.checkpoint(
                "recovery",
                "dispatched",
                json!({ "kind": kind, "contextKey": protocol.context_key(), "jobDefinitionId": job_def_id, "attempt": next, "newRunId": receipt.new_run_id }),
            );
            RecoveryOutcome::Dispatched {
                kind,
                attempt: next,
                new_run_id: receipt.new_run_id,
            }
        }
        Err(e) => {
            warn!(job_def_id, %kind, attempt = next, error = %e, "recovery dispatch failed");
            telemetry.checkpoint(
                "recovery",
                "dispatch_failed",
                json!({ "kind": kind, "contextKey": protocol.context_key(), "jobDefinitionId": job_def_id, "attempt": next, "error": e.to_string() }),
            );
            RecoveryOutcome::DispatchFailed {
                kind,
                attempt: next,
                error: e.to_string(),
            }
        }
    }
}

#[derive(Debug, Default)]
struct StopState {
    raised: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Process-wide signal that no further cycles should be started.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    inner: Arc<StopState>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, reason: impl Into<String>) {
        let mut slot = self
            .inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        self.inner.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::memory::{InMemoryStore, RecordingTelemetry};
    use crate::state_machine::{AttemptMarker, CycleMarker, RecoveryMarker, RoutingInfo};

    fn request<'a>(def: &'a JobDefinition, ctx: &'a AdditionalContext) -> RecoveryRequest<'a> {
        RecoveryRequest {
            definition: def,
            context: ctx,
            detail: "",
            pending_children: &[],
        }
    }

    #[tokio::test]
    async fn verification_dispatches_until_cap() {
        let store = InMemoryStore::new();
        let telemetry = RecordingTelemetry::default();
        let def = JobDefinition::new("job-1");
        let protocol = RecoveryProtocol::verification(3);

        for attempt in 0..3 {
            let ctx = AdditionalContext {
                verification: (attempt > 0).then_some(AttemptMarker { attempt }),
                ..Default::default()
            };
            let outcome = run_recovery(&store, &telemetry, &protocol, &request(&def, &ctx), &[]).await;
            assert!(outcome.is_dispatched(), "attempt counter {attempt} should dispatch");
        }

        let ctx = AdditionalContext {
            verification: Some(AttemptMarker { attempt: 3 }),
            ..Default::default()
        };
        let outcome = run_recovery(&store, &telemetry, &protocol, &request(&def, &ctx), &[]).await;
        assert_eq!(
            outcome,
            RecoveryOutcome::CapReached {
                kind: RecoveryKind::Verification,
                attempt: 3,
                cap: 3
            }
        );
        assert_eq!(store.dispatched().len(), 3);
    }

    #[tokio::test]
    async fn payload_reuses_definition_id_and_sets_own_marker() {
        let store = InMemoryStore::new();
        store.set_routing(
            "job-1",
            RoutingInfo {
                workstream_id: Some("ws-9".into()),
                base_branch: Some("job/parent".into()),
            },
        );
        let def = JobDefinition::new("job-1");
        let mut ctx = AdditionalContext {
            verification: Some(AttemptMarker { attempt: 1 }),
            ..Default::default()
        };
        ctx.inherited_env.insert("REPO".into(), "acme/app".into());

        let req = RecoveryRequest {
            definition: &def,
            context: &ctx,
            detail: "tool call repeated 8 times",
            pending_children: &[],
        };
        let outcome = run_recovery(
            &store,
            &RecordingTelemetry::default(),
            &RecoveryProtocol::loop_recovery(3),
            &req,
            &[],
        )
        .await;
        assert!(outcome.is_dispatched());

        let sent = store.dispatched();
        let payload = &sent[0];
        let marker = serde_json::to_value(&payload.additional_context).unwrap();
        assert!(marker.get(RecoveryKind::LoopRecovery.context_key()).is_some());
        assert_eq!(payload.job_definition_id, "job-1");
        assert!(payload.additional_context.verification.is_none());
        assert_eq!(
            payload.additional_context.loop_recovery,
            Some(RecoveryMarker {
                attempt: 1,
                message: "tool call repeated 8 times".into()
            })
        );
        assert_eq!(payload.additional_context.workstream_id.as_deref(), Some("ws-9"));
        assert_eq!(payload.additional_context.inherited_env["REPO"], "acme/app");
        assert!(payload.message.starts_with("Loop recovery 1/3"));
    }

    #[tokio::test]
    async fn timeout_recovery_has_smaller_cap() {
        let store = InMemoryStore::new();
        let def = JobDefinition::new("job-1");
        let ctx = AdditionalContext {
            timeout_recovery: Some(RecoveryMarker {
                attempt: 2,
                message: "timed out".into(),
            }),
            ..Default::default()
        };
        let protocol = RecoveryProtocol::for_kind(
            RecoveryKind::TimeoutRecovery,
            &JobNetConfig::default(),
            &def,
        );
        let outcome = run_recovery(
            &store,
            &RecordingTelemetry::default(),
            &protocol,
            &request(&def, &ctx),
            &[],
        )
        .await;
        assert!(matches!(outcome, RecoveryOutcome::CapReached { cap: 2, .. }));
        assert!(store.dispatched().is_empty());
    }

    #[tokio::test]
    async fn cycle_progression_respects_max_cycles() {
        let store = InMemoryStore::new();
        let def = JobDefinition::new("root").cyclic(Some(3));
        let protocol = RecoveryProtocol::for_kind(RecoveryKind::Cycle, &JobNetConfig::default(), &def);

        let ctx = AdditionalContext {
            cycle: Some(CycleMarker { number: 2 }),
            ..Default::default()
        };
        let outcome = run_recovery(&store, &RecordingTelemetry::default(), &protocol, &request(&def, &ctx), &[]).await;
        assert!(matches!(outcome, RecoveryOutcome::Dispatched { attempt: 3, .. }));
        assert_eq!(
            store.dispatched()[0].additional_context.cycle,
            Some(CycleMarker { number: 3 })
        );

        let ctx = AdditionalContext {
            cycle: Some(CycleMarker { number: 3 }),
            ..Default::default()
        };
        let outcome = run_recovery(&store, &RecordingTelemetry::default(), &protocol, &request(&def, &ctx), &[]).await;
        assert!(matches!(outcome, RecoveryOutcome::CapReached { attempt: 3, cap: 3, .. }));
    }

    #[tokio::test]
    async fn continuation_is_uncapped_and_lists_children() {
        let store = InMemoryStore::new();
        let def = JobDefinition::new("job-1");
        let ctx = AdditionalContext::default();
        let pending = vec!["child-a".to_string(), "child-b".to_string()];
        let req = RecoveryRequest {
            definition: &def,
            context: &ctx,
            detail: "",
            pending_children: &pending,
        };
        let outcome = run_recovery(
            &store,
            &RecordingTelemetry::default(),
            &RecoveryProtocol::continuation(),
            &req,
            &[],
        )
        .await;
        assert!(outcome.is_dispatched());
        let sent = &store.dispatched()[0];
        assert!(sent.message.contains("child-a, child-b"));
        assert_eq!(
            sent.additional_context.continuation.as_ref().unwrap().pending_children,
            pending
        );
    }

    #[tokio::test]
    async fn routing_failure_does_not_block_dispatch() {
        let store = InMemoryStore::new();
        store.set_oracle_available(false);
        let def = JobDefinition::new("job-1");
        let ctx = AdditionalContext::default();
        let outcome = run_recovery(
            &store,
            &RecordingTelemetry::default(),
            &RecoveryProtocol::verification(3),
            &request(&def, &ctx),
            &[],
        )
        .await;
        assert!(outcome.is_dispatched());
    }

    #[tokio::test]
    async fn dispatch_failure_is_reported() {
        let store = InMemoryStore::new();
        store.fail_next_dispatches(vec![DispatchError::permanent("definition archived")]);
        let telemetry = RecordingTelemetry::default();
        let def = JobDefinition::new("job-1");
        let ctx = AdditionalContext::default();
        let outcome = run_recovery(
            &store,
            &telemetry,
            &RecoveryProtocol::verification(3),
            &request(&def, &ctx),
            &[],
        )
        .await;
        assert!(matches!(outcome, RecoveryOutcome::DispatchFailed { attempt: 1, .. }));
        assert!(telemetry.events().contains(&"recovery/dispatch_failed".to_string()));
        assert_eq!(telemetry.checkpoints()[0].metadata["contextKey"], "verification");
    }

    #[test]
    fn stop_flag_keeps_first_reason() {
        let flag = StopFlag::new();
        assert!(!flag.is_raised());
        let clone = flag.clone();
        clone.raise("max cycles reached for root");
        flag.raise("second");
        assert!(flag.is_raised());
        assert_eq!(flag.reason().as_deref(), Some("max cycles reached for root"));
    }
}
