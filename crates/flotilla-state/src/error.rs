//! Error types for the state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store timeout: {0}")]
    Timeout(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StateError {
    /// Whether retrying the operation can plausibly help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StateError::Timeout(_)
                | StateError::Unavailable(_)
                | StateError::Transaction(_)
                | StateError::Read(_)
                | StateError::Write(_)
        )
    }
}
