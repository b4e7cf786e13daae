//! Scripted scenarios against the in-memory store.

use crate::config::JobNetConfig;
use crate::inference::{ExecutionTelemetry, ToolCall};
use crate::memory::{ClaimMode, InMemoryStore};
use crate::orchestrator::{CompletionOrchestrator, ExecutionTermination, FinalizeReport, RunCompletion};
use crate::state_machine::{AttemptMarker, CycleMarker, JobDefinition, JobRun, RunStatus};
use crate::ui;

fn completion(definition: &JobDefinition, run_id: &str) -> RunCompletion {
    RunCompletion {
        run: JobRun::new(run_id, definition.id.clone()),
        definition: definition.clone(),
        error: None,
        telemetry: ExecutionTelemetry::default(),
        delegated_this_run: false,
        output: String::new(),
        termination: ExecutionTermination::Normal,
    }
}

fn dispatch_call(child: &str) -> ToolCall {
    ToolCall {
        tool: "dispatch_new_job".into(),
        succeeded: true,
        outcome_ok: true,
        job_definition_id: Some(child.into()),
    }
}

/// Runs every scenario and returns `(scenario, report)` pairs in order.
pub async fn run_scenarios(config: JobNetConfig) -> Vec<(&'static str, FinalizeReport)> {
    let config = config.without_delays();
    let mut reports = Vec::new();

    let root = JobDefinition::new("release");
    let api = JobDefinition::new("release-api").with_parent("release");
    let docs = JobDefinition::new("release-docs").with_parent("release");

    let store = InMemoryStore::new();
    store.set_claim_mode(ClaimMode::FirstCallerWins);
    for def in [&root, &api, &docs] {
        store.add_definition(def.clone());
    }
    let orch = CompletionOrchestrator::new(store, config.clone());

    // The root plans the work and hands it to two children.
    let mut planning = completion(&root, "run-release-1");
    planning.telemetry.tool_calls = vec![
        dispatch_call("release-api"),
        dispatch_call("release-docs"),
        dispatch_call("release-api"),
    ];
    reports.push(("delegation", orch.finalize(&planning).await));

    // Woken early: one child is still running.
    orch.store().deliver_run("release-api", RunStatus::Completed);
    orch.store().add_pending_run("release-docs");
    reports.push((
        "waiting child",
        orch.finalize(&completion(&root, "run-release-2")).await,
    ));

    // Both children finish at once; only one may wake the parent.
    orch.store().deliver_run("release-docs", RunStatus::Completed);
    let mut api_done = completion(&api, "run-api-1");
    api_done.output = "Endpoints implemented and tested.".into();
    let mut docs_done = completion(&docs, "run-docs-1");
    docs_done.output = "Changelog written.".into();
    let (first, second) = tokio::join!(orch.finalize(&api_done), orch.finalize(&docs_done));
    reports.push(("sibling race", first));
    reports.push(("sibling race", second));

    // All children done and merged: the root reviews once more.
    let mut review = completion(&root, "run-release-3");
    review.run.additional_context.completed_child_runs = vec!["run-api-1".into()];
    reports.push(("verification", orch.finalize(&review).await));

    let mut verified = completion(&root, "run-release-4");
    verified.run.additional_context.verification = Some(AttemptMarker { attempt: 1 });
    reports.push(("verification pass", orch.finalize(&verified).await));

    // A recurring root job with a two-cycle budget.
    let nightly = JobDefinition::new("nightly-audit").cyclic(Some(2));
    let store = InMemoryStore::new();
    store.add_definition(nightly.clone());
    let orch = CompletionOrchestrator::new(store, config);
    for (run_id, cycle) in [("run-nightly-1", 1), ("run-nightly-2", 2)] {
        let mut run = completion(&nightly, run_id);
        run.run.additional_context.cycle = Some(CycleMarker { number: cycle });
        reports.push(("root cycle", orch.finalize(&run).await));
    }

    reports
}

/// Runs the scenarios and prints each report.
pub async fn run(config: JobNetConfig) {
    let mut current = "";
    for (scenario, report) in run_scenarios(config).await {
        if scenario != current {
            println!();
            println!("── {scenario} ──");
            current = scenario;
        }
        ui::print_report(&report);
    }
}
