//! Error Types
//!
//! Errors surfaced by the admission core. Rate-limit rejection is not an
//! error: it is an [`Admission`](crate::rate_limit::Admission) outcome.

/// Error types for admission, queueing and execution
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The window store or queue backend could not be reached or failed
    #[error("Store error: {0}")]
    Store(String),

    /// The task body failed after admission
    #[error("Task execution failed for {identity}: {message}")]
    Execution { identity: String, message: String },

    /// Submission carried no usable identity
    #[error("user_id is required")]
    InvalidIdentity,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl GateError {
    /// Whether this error came from the backing store
    pub fn is_store(&self) -> bool {
        matches!(self, GateError::Store(_))
    }
}

impl From<rusqlite::Error> for GateError {
    fn from(err: rusqlite::Error) -> Self {
        GateError::Store(err.to_string())
    }
}

impl From<tokio::task::JoinError> for GateError {
    fn from(err: tokio::task::JoinError) -> Self {
        GateError::Store(format!("store worker panicked: {}", err))
    }
}

/// Result alias for the admission core
pub type Result<T> = std::result::Result<T, GateError>;
