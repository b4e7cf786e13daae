//! Structured checkpoints and log setup.

use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// One structured checkpoint emitted while deciding what happens after a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub phase: String,
    pub event: String,
    pub metadata: Value,
}

/// Fire-and-forget sink for checkpoints. Implementations must not fail.
pub trait TelemetrySink {
    fn checkpoint(&self, phase: &str, event: &str, metadata: Value);
}

/// Default sink: every checkpoint becomes a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn checkpoint(&self, phase: &str, event: &str, metadata: Value) {
        tracing::info!(target: "jobnet::checkpoint", phase, event, %metadata);
    }
}

impl<T: TelemetrySink + ?Sized> TelemetrySink for &T {
    fn checkpoint(&self, phase: &str, event: &str, metadata: Value) {
        (**self).checkpoint(phase, event, metadata);
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the verbose flag.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "jobnet=debug" } else { "jobnet=info" };
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
