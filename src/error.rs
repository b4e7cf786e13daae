use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum JobNetError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classifies a dispatch failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Transport hiccup (timeout, reset, 5xx, rate limit). Worth retrying.
    Transient,
    /// Rejected request or broken payload. Retrying will not help.
    Permanent,
}

// Patterns seen in transport errors from collaborators that only report text.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "econnreset",
    "econnrefused",
    "socket hang up",
    "network",
    "fetch failed",
    "502",
    "503",
    "504",
    "rate limit",
    "temporarily unavailable",
];

impl FailureKind {
    /// Fallback classification for collaborators that cannot say whether a
    /// failure is retryable.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
            FailureKind::Transient
        } else {
            FailureKind::Permanent
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "Transient"),
            FailureKind::Permanent => write!(f, "Permanent"),
        }
    }
}

/// A failed dispatch call, tagged with whether it may be retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} dispatch failure: {message}")]
pub struct DispatchError {
    pub kind: FailureKind,
    pub message: String,
}

impl DispatchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    /// Builds an error from bare text, sniffing the failure class.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: FailureKind::classify(&message),
            message,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_transport_messages_as_transient() {
        assert_eq!(FailureKind::classify("request timed out"), FailureKind::Transient);
        assert_eq!(FailureKind::classify("read ECONNRESET"), FailureKind::Transient);
        assert_eq!(FailureKind::classify("HTTP 503 from gateway"), FailureKind::Transient);
        assert_eq!(FailureKind::classify("Rate limit exceeded"), FailureKind::Transient);
    }

    #[test]
    fn classify_everything_else_as_permanent() {
        assert_eq!(FailureKind::classify("invalid job definition id"), FailureKind::Permanent);
        assert_eq!(FailureKind::classify(""), FailureKind::Permanent);
    }

    #[test]
    fn dispatch_error_display() {
        let err = DispatchError::transient("socket hang up");
        assert_eq!(err.to_string(), "Transient dispatch failure: socket hang up");
        assert!(err.is_transient());
        assert!(!DispatchError::permanent("bad payload").is_transient());
    }

    #[test]
    fn crate_error_wraps_sources() {
        let err: JobNetError = StoreError::NotFound("definitions/x".into()).into();
        assert!(err.to_string().starts_with("Record store error:"));
        assert_eq!(
            JobNetError::Config("cascade_cap must be positive".into()).to_string(),
            "Config error: cascade_cap must be positive"
        );
    }

    #[test]
    fn from_message_sniffs_kind() {
        assert!(DispatchError::from_message("fetch failed").is_transient());
        assert!(!DispatchError::from_message("schema mismatch").is_transient());
    }
}
