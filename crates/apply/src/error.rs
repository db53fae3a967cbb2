//! Typed errors surfaced by the apply engine.

use serde::Serialize;

/// Every way an operation can fail. One of these terminates a run; the same
/// value rides the terminal `Error` event (except `Cancelled`, which is
/// returned without synthesizing an event).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error("apply failed: {0}")]
    Apply(String),
    #[error("timed out waiting for resources: {0}")]
    WaitTimeout(String),
    #[error("polling for status failed: {0}")]
    Poller(String),
    #[error("prune failed: {0}")]
    Prune(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Stable kind name used on the wire and in rendered output.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Input(_) => "InputError",
            EngineError::Apply(_) => "ApplyError",
            EngineError::WaitTimeout(_) => "WaitTimeoutError",
            EngineError::Poller(_) => "PollerError",
            EngineError::Prune(_) => "PruneError",
            EngineError::Cancelled => "Cancelled",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::WaitTimeout(_))
    }
}
