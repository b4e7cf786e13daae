//! Status inference and parent notification for distributed job DAGs.
//!
//! After a job run finishes executing, [`orchestrator::CompletionOrchestrator`]
//! decides its final status, whether the same job definition is dispatched
//! again (verification, continuation, cycle, loop or timeout recovery), and
//! whether the waiting parent is notified, at most once, across concurrently
//! finishing siblings.

pub mod cli;
pub mod config;
pub mod decision;
pub mod demo;
pub mod error;
pub mod inference;
pub mod memory;
pub mod notifier;
pub mod orchestrator;
pub mod ports;
pub mod recovery;
pub mod state_machine;
pub mod store;
pub mod telemetry;
pub mod ui;
