//! Engine-level errors.

use crate::host::HostError;

/// Error types for the engine controller
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Host error: {0}")]
    Host(#[from] HostError),
    #[error("Invalid panel command: {0}")]
    InvalidCommand(#[from] serde_json::Error),
    #[error("Declarative fast path is disabled")]
    FastPathDisabled,
}
