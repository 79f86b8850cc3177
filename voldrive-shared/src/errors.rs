//! Error taxonomy shared by the orchestrating process and the executor.
//!
//! Registry and configuration errors are structural: they surface during
//! bring-up and abort it. Everything else is a per-request error that is
//! returned to the individual caller and never touches process-wide state.
//!
//! `VoldriveError` is `Clone` so a single initialization outcome can be
//! handed to every caller waiting on it.

use thiserror::Error;

/// Result alias used across the workspace.
pub type VoldriveResult<T> = Result<T, VoldriveError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VoldriveError {
    /// A driver or executor name was registered twice.
    #[error("already registered: {0}")]
    DuplicateDriver(String),

    /// Unknown driver, executor, service, or volume.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed or unreadable configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A driver operation was attempted before `init` completed.
    #[error("driver not initialized: {0}")]
    UninitializedDriver(String),

    /// The host-local executor reported failure.
    #[error("executor {executor} failed {operation}: {message}")]
    ExecutorFailed {
        executor: String,
        operation: String,
        /// Process exit status, when the executor ran out of process.
        status: Option<i32>,
        message: String,
        /// Captured stderr or panic payload.
        diagnostics: String,
    },

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VoldriveError {
    /// True for errors raised because the request's context ended.
    pub fn is_context_error(&self) -> bool {
        matches!(self, Self::DeadlineExceeded(_) | Self::Cancelled(_))
    }

    /// Stable, lower-case kind label used in logs and wire responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateDriver(_) => "duplicate_driver",
            Self::NotFound(_) => "not_found",
            Self::InvalidConfig(_) => "invalid_config",
            Self::UninitializedDriver(_) => "uninitialized_driver",
            Self::ExecutorFailed { .. } => "executor_failed",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::Cancelled(_) => "cancelled",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidState(_) => "invalid_state",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Unsupported(_) => "unsupported",
            Self::Storage(_) => "storage",
            Self::Database(_) => "database",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for VoldriveError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for VoldriveError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
