mod context;
mod job;
mod state;

pub use context::{
    AdditionalContext, AttemptMarker, ContinuationMarker, CycleMarker, HierarchySnapshot,
    RecoveryKind, RecoveryMarker, SnapshotChild, SnapshotStatus,
};
pub use job::{
    ChildDefinition, DispatchRecord, JobDefinition, JobRun, RetryConfig, RoutingInfo, RunSummary,
};
pub use state::{FinalStatus, FinalStatusCell, RunStatus, StatusError};
