//! Error kinds surfaced by the store layer and consumed from backends.

use std::fmt;

use crate::retry::RetryFailure;

/// Errors returned to callers of the store layer.
///
/// Every backend failure is classified into one of these kinds before it
/// leaves the store; nothing is passed upward as an opaque backend error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Invalid arguments or an operation that does not apply to a record kind.
    /// Never retried.
    #[error("Usage error: {0}")]
    Usage(String),
    /// The backend refused (or never granted) an exclusive session.
    #[error("Session denied for {key}: {reason}")]
    SessionDenied { key: String, reason: DenyReason },
    /// A backend call failed and its retry budget is spent.
    #[error(transparent)]
    Transient(#[from] RetryFailure),
    /// The backend revoked the session outside local control.
    #[error("Session for {key} was ended by the backend")]
    ForcedSessionEnd { key: String },
}

impl StoreError {
    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        StoreError::Usage(msg.into())
    }

    /// Whether the client holding this record must be disconnected.
    pub fn is_client_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::SessionDenied { .. } | StoreError::ForcedSessionEnd { .. }
        )
    }
}

/// Why a session start produced no session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// Another holder kept the lease for every attempt.
    Contended,
    /// The backend kept failing; carries the last failure.
    Unavailable(String),
    /// The cancel predicate fired while the start was in flight.
    Cancelled,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Contended => write!(f, "record is locked by another session"),
            DenyReason::Unavailable(msg) => write!(f, "backend unavailable: {}", msg),
            DenyReason::Cancelled => write!(f, "cancelled before the lease was granted"),
        }
    }
}

/// Errors produced by backend adapters.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Lease for {0} is no longer held")]
    LeaseLost(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Stored record {key} is corrupt: {detail}")]
    Corrupt { key: String, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_fatal_kinds() {
        let denied = StoreError::SessionDenied {
            key: "Player_1".into(),
            reason: DenyReason::Contended,
        };
        assert!(denied.is_client_fatal());
        assert!(StoreError::ForcedSessionEnd {
            key: "Player_1".into()
        }
        .is_client_fatal());
        assert!(!StoreError::usage("bad").is_client_fatal());
    }

    #[test]
    fn test_denied_message_names_reason() {
        let err = StoreError::SessionDenied {
            key: "Player_4".into(),
            reason: DenyReason::Unavailable("timeout".into()),
        };
        assert_eq!(
            err.to_string(),
            "Session denied for Player_4: backend unavailable: timeout"
        );
    }
}
