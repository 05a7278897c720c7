//! Callback signals back into the workflow engine.
//!
//! A waiting task is identified by an opaque callback token. Signalling
//! consumes the token: a second signal, or a signal after the waiter gave
//! up, is rejected as expired.

mod hub;
mod nats;

pub use hub::{CallbackHub, PendingCallback};
pub use nats::{spawn_callback_listener, NatsCallbackSignal};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::TaskerError;
use crate::retry::Retryable;

/// Outcome delivered to a waiting task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success(serde_json::Value),
    Failure(TaskFailure),
}

/// Failure payload: `error` is a short code, `cause` the details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub error: String,
    pub cause: String,
}

/// Signal errors.
#[derive(Debug, Clone, Error)]
pub enum SignalError {
    /// Token already consumed, cancelled or unknown.
    #[error("callback token expired: {0}")]
    Expired(String),

    /// Signal could not be delivered.
    #[error("callback transport error: {0}")]
    Transport(String),
}

impl Retryable for SignalError {
    fn is_throttled(&self) -> bool {
        false
    }
}

impl From<SignalError> for TaskerError {
    fn from(err: SignalError) -> Self {
        match err {
            SignalError::Expired(token) => TaskerError::ExpiredToken(token),
            SignalError::Transport(msg) => TaskerError::Signal(msg),
        }
    }
}

/// Delivers task outcomes to waiting workflow tasks.
#[async_trait]
pub trait CallbackSignal: Send + Sync {
    async fn signal(&self, token: &str, outcome: TaskOutcome) -> Result<(), SignalError>;

    async fn signal_success(&self, token: &str, output: serde_json::Value) -> Result<(), SignalError> {
        self.signal(token, TaskOutcome::Success(output)).await
    }

    async fn signal_failure(&self, token: &str, failure: TaskFailure) -> Result<(), SignalError> {
        self.signal(token, TaskOutcome::Failure(failure)).await
    }
}
