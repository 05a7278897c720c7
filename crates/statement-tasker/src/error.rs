//! Error types for the statement tasker.

use statement_api::GatewayError;
use thiserror::Error;

/// Tasker errors.
#[derive(Error, Debug)]
pub enum TaskerError {
    /// Rate limited; retried with backoff before surfacing.
    #[error("Throttled: {0}")]
    Throttled(String),

    /// An unresolved record already exists for the invocation.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A singleton statement is already in flight.
    #[error("Concurrent execution: {0}")]
    ConcurrentExecution(String),

    /// Statement service rejected or failed the call.
    #[error("Statement service error: {0}")]
    Gateway(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// `LATEST` was requested but the execution has no invocation history.
    #[error("Previous execution not found: {0}")]
    PreviousExecutionNotFound(String),

    /// Callback token was already consumed or has expired.
    #[error("Expired token: {0}")]
    ExpiredToken(String),

    /// Malformed invocation request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Deadline exceeded
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Statement finished unsuccessfully; `error` is the terminal status.
    #[error("{error}: {cause}")]
    TaskFailed { error: String, cause: String },

    /// Tracking store error
    #[error("Tracking store error: {0}")]
    Store(String),

    /// Callback signal error
    #[error("Callback signal error: {0}")]
    Signal(String),

    /// Work queue error
    #[error("Work queue error: {0}")]
    Queue(String),

    /// NATS messaging error
    #[error("NATS error: {0}")]
    Nats(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TaskerError {
    /// Whether the error is a transient throttling condition.
    pub fn is_throttled(&self) -> bool {
        matches!(self, TaskerError::Throttled(_))
    }

    /// Whether the error may clear on its own: throttling or an unreachable queue.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TaskerError::Throttled(_) | TaskerError::Queue(_) | TaskerError::Nats(_)
        )
    }

    /// Error code visible to the workflow.
    pub fn error_name(&self) -> &str {
        match self {
            TaskerError::Throttled(_) => "ThrottlingException",
            TaskerError::Conflict(_) => "Conflict",
            TaskerError::ConcurrentExecution(_) => "ConcurrentExecution",
            TaskerError::Gateway(_) => "StatementServiceError",
            TaskerError::NotFound(_) => "ResourceNotFound",
            TaskerError::PreviousExecutionNotFound(_) => "PreviousExecutionNotFound",
            TaskerError::ExpiredToken(_) => "ExpiredToken",
            TaskerError::InvalidRequest(_) => "InvalidRequest",
            TaskerError::Timeout(_) => "States.Timeout",
            TaskerError::TaskFailed { error, .. } => error,
            _ => "States.TaskFailed",
        }
    }

    /// Human readable cause, without the error name prefix.
    pub fn cause(&self) -> String {
        match self {
            TaskerError::TaskFailed { cause, .. } => cause.clone(),
            other => other.to_string(),
        }
    }
}

impl From<GatewayError> for TaskerError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Throttled(msg) => TaskerError::Throttled(msg),
            GatewayError::NotFound(msg) => TaskerError::NotFound(msg),
            other => TaskerError::Gateway(other.to_string()),
        }
    }
}

impl From<envy::Error> for TaskerError {
    fn from(err: envy::Error) -> Self {
        TaskerError::Config(err.to_string())
    }
}

impl From<async_nats::Error> for TaskerError {
    fn from(err: async_nats::Error) -> Self {
        TaskerError::Nats(err.to_string())
    }
}

/// Result type alias using TaskerError.
pub type TaskerResult<T> = Result<T, TaskerError>;
