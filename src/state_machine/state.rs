use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The four statuses a finished run can be classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Completed,
    Failed,
    Waiting,
    Delegating,
}

impl RunStatus {
    /// `Completed` and `Failed` expect no further automatic transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "COMPLETED"),
            RunStatus::Failed => write!(f, "FAILED"),
            RunStatus::Waiting => write!(f, "WAITING"),
            RunStatus::Delegating => write!(f, "DELEGATING"),
        }
    }
}

/// Terminal classification of one job run plus a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalStatus {
    pub status: RunStatus,
    pub message: String,
}

impl FinalStatus {
    pub fn new(status: RunStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn completed(message: impl Into<String>) -> Self {
        Self::new(RunStatus::Completed, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(RunStatus::Failed, message)
    }

    pub fn waiting(message: impl Into<String>) -> Self {
        Self::new(RunStatus::Waiting, message)
    }

    pub fn delegating(message: impl Into<String>) -> Self {
        Self::new(RunStatus::Delegating, message)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    #[error("final status already recorded as {0}")]
    AlreadySet(RunStatus),

    #[error("no final status recorded yet")]
    NotSet,

    #[error("semantic failure can only override COMPLETED, found {0}")]
    OverrideNotAllowed(RunStatus),

    #[error("final status was already overridden once")]
    AlreadyOverridden,
}

/// Holds the single `FinalStatus` of a run.
///
/// The status is written once. The only permitted change afterwards is one
/// semantic-failure override of a `Completed` inference.
#[derive(Debug, Clone, Default)]
pub struct FinalStatusCell {
    inner: Option<FinalStatus>,
    overridden: bool,
}

impl FinalStatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, status: FinalStatus) -> Result<&FinalStatus, StatusError> {
        if let Some(existing) = &self.inner {
            return Err(StatusError::AlreadySet(existing.status));
        }
        Ok(self.inner.insert(status))
    }

    pub fn override_with_semantic_failure(
        &mut self,
        message: impl Into<String>,
    ) -> Result<&FinalStatus, StatusError> {
        if self.overridden {
            return Err(StatusError::AlreadyOverridden);
        }
        let current = self.inner.as_mut().ok_or(StatusError::NotSet)?;
        if current.status != RunStatus::Completed {
            return Err(StatusError::OverrideNotAllowed(current.status));
        }
        *current = FinalStatus::failed(message);
        self.overridden = true;
        Ok(current)
    }

    pub fn into_inner(self) -> Option<FinalStatus> {
        self.inner
    }
}
