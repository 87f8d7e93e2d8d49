// Tether Error Types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Caller-initiated cancellation. Never retried, never surfaced as an
    /// error message.
    #[error("cancelled")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Agent service error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
