use thiserror::Error;

use crate::providers::ProviderError;

/// Errors surfaced by the client and runtime API.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DurableError {
    #[error("instance '{0}' not found")]
    InstanceNotFound(String),
    /// The instance exists but is already in a terminal state.
    #[error("instance '{instance}' is not running (status: {status})")]
    InstanceNotRunning { instance: String, status: String },
    #[error("instance '{0}' already exists")]
    InstanceAlreadyExists(String),
    #[error("orchestration '{0}' is not registered")]
    UnknownOrchestration(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("failed to decode result: {0}")]
    ResultDecoding(String),
    #[error("{0}")]
    Nondeterminism(String),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("timed out waiting for instance '{0}'")]
    Timeout(String),
}

impl DurableError {
    /// HTTP status a service front end should map this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            DurableError::InstanceNotFound(_) => 404,
            DurableError::InstanceNotRunning { .. } | DurableError::InstanceAlreadyExists(_) => 409,
            DurableError::UnknownOrchestration(_)
            | DurableError::InvalidInput(_)
            | DurableError::ResultDecoding(_) => 400,
            DurableError::Timeout(_) => 504,
            DurableError::Nondeterminism(_) | DurableError::Provider(_) => 500,
        }
    }
}

/// Outcome of a failed activity, as seen by the dispatcher and the orchestration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActivityError {
    /// Retryable failure reported by the activity.
    #[error("{0}")]
    Transient(String),
    /// An attempt exceeded its per-attempt timeout.
    #[error("activity attempt timed out after {0:?}")]
    TimedOut(std::time::Duration),
    /// Retry policy exhausted; `message` is the last attempt's error.
    #[error("{message} (after {attempts} attempt(s))")]
    Terminal { message: String, attempts: u32 },
}

impl ActivityError {
    /// The underlying failure text without attempt decoration.
    pub fn message(&self) -> String {
        match self {
            ActivityError::Transient(m) => m.clone(),
            ActivityError::TimedOut(d) => format!("activity attempt timed out after {d:?}"),
            ActivityError::Terminal { message, .. } => message.clone(),
        }
    }
}
