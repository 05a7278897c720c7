//! Completer: resolves pending callbacks from completion events.

use statement_api::StatementStatus;
use std::sync::Arc;

use crate::error::TaskerError;
use crate::event::CompletionEvent;
use crate::identity::InvocationKey;
use crate::retry::{retry_throttled, RetryPolicy};
use crate::signal::{CallbackSignal, SignalError, TaskFailure};
use crate::store::{PendingCallbackRecord, ResolutionClaim, TrackingStore};

/// What happened to a completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Statement was not started by the tasker.
    Untracked,
    /// No visible record; a late or duplicate completion.
    NotFound,
    /// Record was resolved before.
    Duplicate,
    /// Fire-and-forget record marked resolved.
    Recorded,
    /// Waiting task signalled.
    Signalled,
    /// Waiting task had already given up on the token.
    TokenExpired,
}

/// Correlates completion events with pending callback records.
#[derive(Clone)]
pub struct Completer {
    store: TrackingStore,
    signal: Arc<dyn CallbackSignal>,
    retry: RetryPolicy,
}

impl Completer {
    pub fn new(store: TrackingStore, signal: Arc<dyn CallbackSignal>, retry: RetryPolicy) -> Self {
        Self { store, signal, retry }
    }

    /// Resolve one completion event.
    ///
    /// An error means the event should be redelivered.
    pub async fn resolve(&self, event: &CompletionEvent) -> Result<ResolveOutcome, TaskerError> {
        let Some(key) = &event.invocation else {
            tracing::debug!(statement_id = %event.statement_id, "Untracked statement completed");
            return Ok(ResolveOutcome::Untracked);
        };

        let detail = serde_json::to_value(&event.notification)?;
        let claim = retry_throttled(&self.retry, "claim_resolution", || {
            self.store
                .claim_resolution(key, Some(&event.statement_id), event.status, detail.clone())
        })
        .await?;

        let (record, revision) = match claim {
            ResolutionClaim::NotFound => {
                tracing::info!(
                    execution_id = %key.execution_id,
                    invocation_id = %key.invocation_id,
                    statement_id = %event.statement_id,
                    "No pending callback for completion"
                );
                return Ok(ResolveOutcome::NotFound);
            }
            ResolutionClaim::OtherStatement(tracked) => {
                tracing::info!(
                    invocation = %key,
                    statement_id = %event.statement_id,
                    tracked_statement_id = %tracked,
                    "Completion belongs to a replaced invocation"
                );
                return Ok(ResolveOutcome::NotFound);
            }
            ResolutionClaim::AlreadyResolved => {
                tracing::debug!(invocation = %key, statement_id = %event.statement_id, "Duplicate completion");
                return Ok(ResolveOutcome::Duplicate);
            }
            ResolutionClaim::Claimed { record, revision } => (record, revision),
        };

        let outcome = match &record.callback_token {
            None => ResolveOutcome::Recorded,
            Some(token) => match self.signal_outcome(token, event, detail).await {
                Ok(()) => ResolveOutcome::Signalled,
                Err(SignalError::Expired(_)) => {
                    tracing::warn!(
                        invocation = %key,
                        statement_id = %event.statement_id,
                        "Callback token expired before completion"
                    );
                    ResolveOutcome::TokenExpired
                }
                Err(e) => {
                    tracing::error!(invocation = %key, error = %e, "Failed to signal callback");
                    let reverted = self.store.revert_resolution(key, revision).await;
                    if let Err(revert_err) = reverted {
                        tracing::error!(invocation = %key, error = %revert_err, "Failed to revert resolution");
                    }
                    return Err(e.into());
                }
            },
        };

        self.release_singleton(key, &record).await;

        tracing::info!(
            execution_id = %key.execution_id,
            invocation_id = %key.invocation_id,
            statement_id = %event.statement_id,
            status = %event.status,
            outcome = ?outcome,
            "Completion resolved"
        );
        Ok(outcome)
    }

    async fn signal_outcome(
        &self,
        token: &str,
        event: &CompletionEvent,
        detail: serde_json::Value,
    ) -> Result<(), SignalError> {
        if event.status == StatementStatus::Finished {
            retry_throttled(&self.retry, "signal_success", || {
                self.signal.signal_success(token, detail.clone())
            })
            .await
        } else {
            let failure = TaskFailure {
                error: event.status.to_string(),
                cause: detail.to_string(),
            };
            retry_throttled(&self.retry, "signal_failure", || {
                self.signal.signal_failure(token, failure.clone())
            })
            .await
        }
    }

    async fn release_singleton(&self, key: &InvocationKey, record: &PendingCallbackRecord) {
        let Some(singleton_key) = &record.singleton_key else {
            return;
        };

        let released = retry_throttled(&self.retry, "release_singleton", || {
            self.store.release_singleton(singleton_key, key)
        })
        .await;

        // A guard left behind is stale once the record is resolved.
        if let Err(e) = released {
            tracing::warn!(invocation = %key, singleton_key = %singleton_key, error = %e, "Failed to release singleton guard");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{CallbackHub, TaskOutcome};
    use async_trait::async_trait;
    use statement_api::StatusChangeNotification;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakySignal {
        failures: AtomicU32,
        hub: CallbackHub,
    }

    #[async_trait]
    impl CallbackSignal for FlakySignal {
        async fn signal(&self, token: &str, outcome: TaskOutcome) -> Result<(), SignalError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(SignalError::Transport("connection reset".to_string()));
            }
            self.hub.resolve(token, outcome).await
        }
    }

    fn store() -> TrackingStore {
        TrackingStore::in_memory(Duration::from_secs(3600))
    }

    async fn pending(store: &TrackingStore, token: Option<String>) -> (InvocationKey, CompletionEvent) {
        let key = InvocationKey::generate("exec-1");
        let record = PendingCallbackRecord::new(&key, "select 1", token, store.record_ttl());
        store.create_record(&record).await.unwrap();
        store.attach_statement_id(&key, "stmt-1").await.unwrap();

        (key.clone(), event_for(&key, StatementStatus::Finished))
    }

    fn event_for(key: &InvocationKey, status: StatementStatus) -> CompletionEvent {
        let notification = StatusChangeNotification::new("stmt-1", Some(&key.statement_name()), status);
        CompletionEvent::from_notification(notification).unwrap()
    }

    #[tokio::test]
    async fn test_success_is_signalled_once() {
        let store = store();
        let hub = CallbackHub::new();
        let completer = Completer::new(store.clone(), Arc::new(hub.clone()), RetryPolicy::none());

        let callback = hub.register().await;
        let (_, event) = pending(&store, Some(callback.token.clone())).await;

        assert_eq!(completer.resolve(&event).await.unwrap(), ResolveOutcome::Signalled);
        assert_eq!(completer.resolve(&event).await.unwrap(), ResolveOutcome::Duplicate);

        match callback.receiver.await.unwrap() {
            TaskOutcome::Success(output) => assert_eq!(output["detail"]["state"], "FINISHED"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_carries_status_and_cause() {
        let store = store();
        let hub = CallbackHub::new();
        let completer = Completer::new(store.clone(), Arc::new(hub.clone()), RetryPolicy::none());

        let callback = hub.register().await;
        let (key, _) = pending(&store, Some(callback.token.clone())).await;

        let event = event_for(&key, StatementStatus::Aborted);
        assert_eq!(completer.resolve(&event).await.unwrap(), ResolveOutcome::Signalled);

        match callback.receiver.await.unwrap() {
            TaskOutcome::Failure(failure) => {
                assert_eq!(failure.error, "ABORTED");
                assert!(failure.cause.contains("stmt-1"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fire_and_forget_is_recorded() {
        let store = store();
        let completer = Completer::new(store.clone(), Arc::new(CallbackHub::new()), RetryPolicy::none());
        let (key, event) = pending(&store, None).await;

        assert_eq!(completer.resolve(&event).await.unwrap(), ResolveOutcome::Recorded);

        let record = store.get(&key).await.unwrap().unwrap().value;
        assert_eq!(record.resolution.unwrap().status, StatementStatus::Finished);
    }

    #[tokio::test]
    async fn test_untracked_and_missing_records() {
        let store = store();
        let completer = Completer::new(store.clone(), Arc::new(CallbackHub::new()), RetryPolicy::none());

        let untracked = CompletionEvent::from_notification(StatusChangeNotification::new(
            "stmt-9",
            Some("nightly-vacuum"),
            StatementStatus::Finished,
        ))
        .unwrap();
        assert_eq!(completer.resolve(&untracked).await.unwrap(), ResolveOutcome::Untracked);

        let missing = event_for(&InvocationKey::generate("exec-404"), StatementStatus::Finished);
        assert_eq!(completer.resolve(&missing).await.unwrap(), ResolveOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_completion_after_record_expiry_is_a_no_op() {
        let store = store();
        let hub = CallbackHub::new();
        let completer = Completer::new(store.clone(), Arc::new(hub.clone()), RetryPolicy::none());

        let mut callback = hub.register().await;
        let key = InvocationKey::generate("exec-1");
        let mut record = PendingCallbackRecord::new(&key, "select 1", Some(callback.token.clone()), Duration::ZERO);
        record.statement_id = Some("stmt-1".to_string());
        store.create_record(&record).await.unwrap();

        let event = event_for(&key, StatementStatus::Finished);
        assert_eq!(completer.resolve(&event).await.unwrap(), ResolveOutcome::NotFound);

        // Nothing was signalled and the expired record was left as it was.
        assert_eq!(hub.pending_count().await, 1);
        assert!(callback.receiver.try_recv().is_err());
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_token_is_not_an_error() {
        let store = store();
        let hub = CallbackHub::new();
        let completer = Completer::new(store.clone(), Arc::new(hub.clone()), RetryPolicy::none());

        let callback = hub.register().await;
        let (_, event) = pending(&store, Some(callback.token.clone())).await;
        hub.cancel(&callback.token).await;

        assert_eq!(completer.resolve(&event).await.unwrap(), ResolveOutcome::TokenExpired);
    }

    #[tokio::test]
    async fn test_transport_failure_reverts_claim() {
        let store = store();
        let hub = CallbackHub::new();
        let signal = FlakySignal {
            failures: AtomicU32::new(1),
            hub: hub.clone(),
        };
        let completer = Completer::new(store.clone(), Arc::new(signal), RetryPolicy::none());

        let callback = hub.register().await;
        let (key, event) = pending(&store, Some(callback.token.clone())).await;

        assert!(matches!(completer.resolve(&event).await, Err(TaskerError::Signal(_))));
        assert!(!store.get(&key).await.unwrap().unwrap().value.is_resolved());

        // Redelivery succeeds.
        assert_eq!(completer.resolve(&event).await.unwrap(), ResolveOutcome::Signalled);
        assert!(callback.receiver.await.is_ok());
    }

    #[tokio::test]
    async fn test_singleton_guard_released() {
        let store = store();
        let completer = Completer::new(store.clone(), Arc::new(CallbackHub::new()), RetryPolicy::none());

        let key = InvocationKey::generate("exec-1");
        let mut record = PendingCallbackRecord::new(&key, "select 1", None, store.record_ttl());
        record.singleton_key = Some("select 1".to_string());
        store.create_record(&record).await.unwrap();
        store.acquire_singleton("select 1", &key).await.unwrap();

        completer.resolve(&event_for(&key, StatementStatus::Finished)).await.unwrap();

        let next = InvocationKey::generate("exec-2");
        assert_eq!(
            store.acquire_singleton("select 1", &next).await.unwrap(),
            crate::store::SingletonAcquire::Acquired
        );
    }
}
