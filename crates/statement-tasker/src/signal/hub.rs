//! In-process callback hub.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use uuid::Uuid;

use super::{CallbackSignal, SignalError, TaskOutcome};

/// Handle held by a task waiting for its callback.
#[derive(Debug)]
pub struct PendingCallback {
    pub token: String,
    pub receiver: oneshot::Receiver<TaskOutcome>,
}

/// Registry of waiting tasks keyed by callback token.
#[derive(Clone, Default)]
pub struct CallbackHub {
    pending: Arc<RwLock<HashMap<String, oneshot::Sender<TaskOutcome>>>>,
}

impl CallbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new token and register a waiter for it.
    pub async fn register(&self) -> PendingCallback {
        let token = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        self.pending.write().await.insert(token.clone(), tx);
        tracing::debug!(token = %token, "Registered callback");

        PendingCallback { token, receiver: rx }
    }

    /// Deliver an outcome, consuming the token.
    pub async fn resolve(&self, token: &str, outcome: TaskOutcome) -> Result<(), SignalError> {
        let Some(tx) = self.pending.write().await.remove(token) else {
            return Err(SignalError::Expired(token.to_string()));
        };

        tx.send(outcome).map_err(|_| {
            tracing::warn!(token = %token, "Callback receiver dropped");
            SignalError::Expired(token.to_string())
        })?;

        tracing::debug!(token = %token, "Delivered callback");
        Ok(())
    }

    /// Drop a waiter, e.g. after its heartbeat timed out.
    pub async fn cancel(&self, token: &str) {
        if self.pending.write().await.remove(token).is_some() {
            tracing::debug!(token = %token, "Cancelled callback");
        }
    }

    /// Number of tokens still waiting.
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

#[async_trait]
impl CallbackSignal for CallbackHub {
    async fn signal(&self, token: &str, outcome: TaskOutcome) -> Result<(), SignalError> {
        self.resolve(token, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::TaskFailure;
    use tokio_test::{assert_ok, assert_pending, assert_ready_ok, task};

    #[tokio::test]
    async fn test_register_and_resolve() {
        let hub = CallbackHub::new();
        let pending = hub.register().await;
        let mut receiver = task::spawn(pending.receiver);
        assert_pending!(receiver.poll());

        assert_ok!(hub.signal_success(&pending.token, serde_json::json!({"ok": true})).await);

        assert!(receiver.is_woken());
        let outcome = assert_ready_ok!(receiver.poll());
        assert_eq!(outcome, TaskOutcome::Success(serde_json::json!({"ok": true})));
        assert_eq!(hub.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_second_signal_is_expired() {
        let hub = CallbackHub::new();
        let pending = hub.register().await;

        hub.signal_success(&pending.token, serde_json::Value::Null).await.unwrap();
        let err = hub
            .signal_failure(
                &pending.token,
                TaskFailure {
                    error: "FAILED".to_string(),
                    cause: String::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::Expired(_)));
    }

    #[tokio::test]
    async fn test_cancelled_token_is_expired() {
        let hub = CallbackHub::new();
        let pending = hub.register().await;
        hub.cancel(&pending.token).await;

        let err = hub.signal_success(&pending.token, serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, SignalError::Expired(_)));
    }
}
