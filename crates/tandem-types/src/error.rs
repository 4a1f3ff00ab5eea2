use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by channel, message and notification operations.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Caller lacks view or post rights. Never downgraded to a silent no-op.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The referenced channel, message, project or notification does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The connection already reached `Closed`; a new one is required.
    #[error("connection closed")]
    ConnectionClosed,

    /// Live delivery could not complete. The message itself is persisted.
    #[error("transient delivery failure: {0}")]
    TransientDeliveryFailure(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ChatError {
    pub fn denied(what: impl Into<String>) -> Self {
        Self::PermissionDenied(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        Self::ValidationFailed(what.into())
    }

    pub fn reason(&self) -> ErrorReason {
        ErrorReason::from(self)
    }
}

/// Machine-readable error classification sent to clients in `join_error`
/// and `send_error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    PermissionDenied,
    NotFound,
    ValidationFailed,
    Conflict,
    Internal,
}

impl From<&ChatError> for ErrorReason {
    fn from(err: &ChatError) -> Self {
        match err {
            ChatError::PermissionDenied(_) => Self::PermissionDenied,
            ChatError::NotFound(_) => Self::NotFound,
            ChatError::ValidationFailed(_) => Self::ValidationFailed,
            ChatError::Conflict(_) => Self::Conflict,
            ChatError::ConnectionClosed
            | ChatError::TransientDeliveryFailure(_)
            | ChatError::Storage(_) => Self::Internal,
        }
    }
}
