//! In-process record store used by the `demo` command and the test suites.
//!
//! Mirrors the HTTP store closely enough to exercise the engines: every
//! operation yields once so that concurrently finishing siblings interleave
//! like separate workers would.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::error::DispatchError;
use crate::ports::{
    ChildCompletionOracle, ClaimDecision, ClaimService, DispatchReceipt, DispatchRequest,
    Dispatcher, IntegrationCheck,
};
use crate::state_machine::{
    ChildDefinition, DispatchRecord, JobDefinition, RoutingInfo, RunStatus, RunSummary,
};
use crate::store::StoreError;
use crate::telemetry::{Checkpoint, TelemetrySink};

/// How [`InMemoryStore`] answers claim requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClaimMode {
    /// One claim per `(parent, child)` pair.
    #[default]
    PerPair,
    /// Only the first caller for a parent is allowed, whichever child it is.
    FirstCallerWins,
    AllowAll,
    /// Every claim errors.
    Unavailable,
}

#[derive(Debug)]
struct State {
    definitions: BTreeMap<String, JobDefinition>,
    runs: HashMap<String, Vec<RunSummary>>,
    child_runs_of_run: HashMap<String, Vec<RunSummary>>,
    scripted_listings: HashMap<String, VecDeque<Vec<ChildDefinition>>>,
    routing: HashMap<String, RoutingInfo>,
    history: HashMap<String, Vec<DispatchRecord>>,
    unintegrated: HashMap<String, Vec<String>>,
    claims: HashMap<String, String>,
    claim_mode: ClaimMode,
    dispatched: Vec<DispatchRequest>,
    dispatch_failures: VecDeque<DispatchError>,
    oracle_available: bool,
    definition_queries_fail: bool,
    seq: i64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            definitions: BTreeMap::new(),
            runs: HashMap::new(),
            child_runs_of_run: HashMap::new(),
            scripted_listings: HashMap::new(),
            routing: HashMap::new(),
            history: HashMap::new(),
            unintegrated: HashMap::new(),
            claims: HashMap::new(),
            claim_mode: ClaimMode::default(),
            dispatched: Vec::new(),
            dispatch_failures: VecDeque::new(),
            oracle_available: true,
            definition_queries_fail: false,
            seq: 0,
        }
    }
}

impl State {
    fn check_oracle(&self) -> Result<(), StoreError> {
        if self.oracle_available {
            Ok(())
        } else {
            Err(StoreError::unavailable("record store offline"))
        }
    }

    fn check_definition_queries(&self) -> Result<(), StoreError> {
        self.check_oracle()?;
        if self.definition_queries_fail {
            return Err(StoreError::unavailable("definition index unavailable"));
        }
        Ok(())
    }

    // Strictly increasing timestamps so "latest run" is well defined.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        self.seq += 1;
        Utc::now() + Duration::milliseconds(self.seq)
    }

    fn push_run(
        &mut self,
        definition: &str,
        delivered: bool,
        status: Option<RunStatus>,
        cycle: Option<u32>,
    ) -> String {
        let id = format!("run-{}", uuid::Uuid::new_v4());
        let timestamp = self.next_timestamp();
        self.runs
            .entry(definition.to_string())
            .or_default()
            .push(RunSummary {
                id: id.clone(),
                delivered,
                own_status: status,
                timestamp,
                cycle,
            });
        id
    }

    /// Status of the latest run; `None` while it is still executing.
    fn own_status(&self, definition: &str) -> Option<RunStatus> {
        let latest = self
            .runs
            .get(definition)?
            .iter()
            .max_by_key(|r| r.timestamp)?;
        if latest.delivered { latest.own_status } else { None }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_definition(&self, definition: JobDefinition) {
        self.state()
            .definitions
            .insert(definition.id.clone(), definition);
    }

    pub fn definitions(&self) -> Vec<JobDefinition> {
        self.state().definitions.values().cloned().collect()
    }

    /// Records a finished run and returns its id.
    pub fn deliver_run(&self, definition: &str, status: RunStatus) -> String {
        self.state().push_run(definition, true, Some(status), None)
    }

    /// Records a run that is still executing and returns its id.
    pub fn add_pending_run(&self, definition: &str) -> String {
        self.state().push_run(definition, false, None, None)
    }

    pub fn add_child_run_of_run(&self, run_id: &str, child_run_id: &str, delivered: bool) {
        let mut state = self.state();
        let timestamp = state.next_timestamp();
        state
            .child_runs_of_run
            .entry(run_id.to_string())
            .or_default()
            .push(RunSummary {
                id: child_run_id.to_string(),
                delivered,
                own_status: delivered.then_some(RunStatus::Completed),
                timestamp,
                cycle: None,
            });
    }

    pub fn set_oracle_available(&self, available: bool) {
        self.state().oracle_available = available;
    }

    /// Fails definition listings and run lookups while per-run queries keep
    /// working.
    pub fn fail_definition_queries(&self, fail: bool) {
        self.state().definition_queries_fail = fail;
    }

    /// Queues stale listings returned, in order, by the next child queries
    /// for `parent` before live data is served again.
    pub fn script_child_listing(&self, parent: &str, listings: Vec<Vec<ChildDefinition>>) {
        self.state()
            .scripted_listings
            .entry(parent.to_string())
            .or_default()
            .extend(listings);
    }

    pub fn set_routing(&self, definition: &str, routing: RoutingInfo) {
        self.state().routing.insert(definition.to_string(), routing);
    }

    pub fn set_unintegrated(&self, definition: &str, children: Vec<String>) {
        self.state()
            .unintegrated
            .insert(definition.to_string(), children);
    }

    pub fn set_claim_mode(&self, mode: ClaimMode) {
        self.state().claim_mode = mode;
    }

    pub fn record_dispatch(&self, parent: &str, source: &str, at: DateTime<Utc>) {
        self.state()
            .history
            .entry(parent.to_string())
            .or_default()
            .push(DispatchRecord {
                source_job_definition_id: source.to_string(),
                dispatched_at: at,
            });
    }

    /// The next dispatch calls fail with these errors, in order.
    pub fn fail_next_dispatches(&self, errors: Vec<DispatchError>) {
        self.state().dispatch_failures.extend(errors);
    }

    pub fn pending_dispatch_failures(&self) -> usize {
        self.state().dispatch_failures.len()
    }

    /// Every successful dispatch, oldest first.
    pub fn dispatched(&self) -> Vec<DispatchRequest> {
        self.state().dispatched.clone()
    }
}

impl ChildCompletionOracle for InMemoryStore {
    async fn get_definition(&self, id: &str) -> Result<Option<JobDefinition>, StoreError> {
        tokio::task::yield_now().await;
        let state = self.state();
        state.check_oracle()?;
        Ok(state.definitions.get(id).cloned())
    }

    async fn get_parent(&self, id: &str) -> Result<Option<String>, StoreError> {
        tokio::task::yield_now().await;
        let state = self.state();
        state.check_oracle()?;
        Ok(state
            .definitions
            .get(id)
            .and_then(|d| d.parent_job_definition_id.clone()))
    }

    async fn list_child_definitions(
        &self,
        parent: &str,
        exclude: Option<&str>,
    ) -> Result<Vec<ChildDefinition>, StoreError> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        state.check_definition_queries()?;

        let scripted = state
            .scripted_listings
            .get_mut(parent)
            .and_then(VecDeque::pop_front);
        let children = match scripted {
            Some(listing) => listing,
            None => state
                .definitions
                .values()
                .filter(|d| d.parent_job_definition_id.as_deref() == Some(parent))
                .map(|d| ChildDefinition {
                    id: d.id.clone(),
                    own_status: state.own_status(&d.id),
                })
                .collect(),
        };
        Ok(children
            .into_iter()
            .filter(|c| Some(c.id.as_str()) != exclude)
            .collect())
    }

    async fn list_runs_for_definition(&self, id: &str) -> Result<Vec<RunSummary>, StoreError> {
        tokio::task::yield_now().await;
        let state = self.state();
        state.check_definition_queries()?;
        Ok(state.runs.get(id).cloned().unwrap_or_default())
    }

    async fn list_child_runs_of_run(&self, run_id: &str) -> Result<Vec<RunSummary>, StoreError> {
        tokio::task::yield_now().await;
        let state = self.state();
        state.check_oracle()?;
        Ok(state
            .child_runs_of_run
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn routing(&self, id: &str) -> Result<RoutingInfo, StoreError> {
        tokio::task::yield_now().await;
        let state = self.state();
        state.check_oracle()?;
        Ok(state.routing.get(id).cloned().unwrap_or_default())
    }

    async fn dispatch_history(&self, parent: &str) -> Result<Vec<DispatchRecord>, StoreError> {
        tokio::task::yield_now().await;
        let state = self.state();
        state.check_oracle()?;
        Ok(state.history.get(parent).cloned().unwrap_or_default())
    }
}

impl Dispatcher for InMemoryStore {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        if let Some(err) = state.dispatch_failures.pop_front() {
            return Err(err);
        }

        let cycle = request.additional_context.cycle.as_ref().map(|c| c.number);
        let new_run_id = state.push_run(&request.job_definition_id, false, None, cycle);
        if let Some(source) = &request.source_job_definition_id {
            let dispatched_at = Utc::now();
            state
                .history
                .entry(request.job_definition_id.clone())
                .or_default()
                .push(DispatchRecord {
                    source_job_definition_id: source.clone(),
                    dispatched_at,
                });
        }
        state.dispatched.push(request.clone());
        Ok(DispatchReceipt { new_run_id })
    }
}

impl ClaimService for InMemoryStore {
    async fn try_claim(&self, parent: &str, child: &str) -> Result<ClaimDecision, StoreError> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        let key = match state.claim_mode {
            ClaimMode::AllowAll => {
                return Ok(ClaimDecision {
                    allowed: true,
                    claimed_by: None,
                });
            }
            ClaimMode::Unavailable => return Err(StoreError::unavailable("claim service offline")),
            ClaimMode::PerPair => format!("{parent}/{child}"),
            ClaimMode::FirstCallerWins => parent.to_string(),
        };

        match state.claims.get(&key) {
            Some(owner) => Ok(ClaimDecision {
                allowed: false,
                claimed_by: Some(owner.clone()),
            }),
            None => {
                state.claims.insert(key, child.to_string());
                Ok(ClaimDecision {
                    allowed: true,
                    claimed_by: None,
                })
            }
        }
    }
}

impl IntegrationCheck for InMemoryStore {
    async fn unintegrated_children(&self, id: &str) -> Result<Vec<String>, StoreError> {
        tokio::task::yield_now().await;
        let state = self.state();
        state.check_oracle()?;
        Ok(state.unintegrated.get(id).cloned().unwrap_or_default())
    }
}

/// Telemetry sink that keeps every checkpoint for later inspection.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    checkpoints: Mutex<Vec<Checkpoint>>,
}

impl RecordingTelemetry {
    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `phase/event` for each checkpoint, in emission order.
    pub fn events(&self) -> Vec<String> {
        self.checkpoints()
            .into_iter()
            .map(|c| format!("{}/{}", c.phase, c.event))
            .collect()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn checkpoint(&self, phase: &str, event: &str, metadata: Value) {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Checkpoint {
                phase: phase.to_string(),
                event: event.to_string(),
                metadata,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::CycleMarker;

    #[tokio::test]
    async fn own_status_follows_latest_run() {
        let store = InMemoryStore::new();
        store.add_definition(JobDefinition::new("p"));
        store.add_definition(JobDefinition::new("c").with_parent("p"));

        store.deliver_run("c", RunStatus::Completed);
        let children = store.list_child_definitions("p", None).await.unwrap();
        assert_eq!(children[0].own_status, Some(RunStatus::Completed));

        store.add_pending_run("c");
        let children = store.list_child_definitions("p", None).await.unwrap();
        assert_eq!(children[0].own_status, None);

        assert!(store.list_child_definitions("p", Some("c")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scripted_listings_drain_before_live_data() {
        let store = InMemoryStore::new();
        store.add_definition(JobDefinition::new("c").with_parent("p"));
        store.deliver_run("c", RunStatus::Failed);
        store.script_child_listing(
            "p",
            vec![vec![ChildDefinition {
                id: "c".into(),
                own_status: None,
            }]],
        );

        let first = store.list_child_definitions("p", None).await.unwrap();
        assert_eq!(first[0].own_status, None);
        let second = store.list_child_definitions("p", None).await.unwrap();
        assert_eq!(second[0].own_status, Some(RunStatus::Failed));
    }

    #[tokio::test]
    async fn dispatch_with_source_lands_in_history() {
        let store = InMemoryStore::new();
        let request = DispatchRequest {
            job_definition_id: "p".into(),
            message: "child done".into(),
            additional_context: Default::default(),
            source_job_definition_id: Some("c".into()),
        };
        let receipt = store.dispatch(&request).await.unwrap();
        assert!(receipt.new_run_id.starts_with("run-"));

        let history = store.dispatch_history("p").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].source_job_definition_id, "c");
        assert_eq!(store.list_runs_for_definition("p").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispatched_run_reports_its_cycle() {
        let store = InMemoryStore::new();
        let mut request = DispatchRequest {
            job_definition_id: "nightly".into(),
            message: "next cycle".into(),
            additional_context: Default::default(),
            source_job_definition_id: None,
        };
        request.additional_context.cycle = Some(CycleMarker { number: 4 });
        store.dispatch(&request).await.unwrap();

        let runs = store.list_runs_for_definition("nightly").await.unwrap();
        assert_eq!(runs[0].cycle, Some(4));
        assert!(!runs[0].delivered);
    }

    #[tokio::test]
    async fn claim_modes() {
        let store = InMemoryStore::new();
        assert!(store.try_claim("p", "a").await.unwrap().allowed);
        assert!(store.try_claim("p", "b").await.unwrap().allowed);
        let denied = store.try_claim("p", "a").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.claimed_by.as_deref(), Some("a"));

        let store = InMemoryStore::new();
        store.set_claim_mode(ClaimMode::FirstCallerWins);
        assert!(store.try_claim("p", "a").await.unwrap().allowed);
        assert!(!store.try_claim("p", "b").await.unwrap().allowed);

        store.set_claim_mode(ClaimMode::Unavailable);
        assert!(store.try_claim("p", "c").await.is_err());
    }

    #[test]
    fn recording_telemetry_lists_events() {
        let telemetry = RecordingTelemetry::default();
        telemetry.checkpoint("recovery", "dispatched", Value::Null);
        assert_eq!(telemetry.events(), vec!["recovery/dispatched".to_string()]);
    }
}
