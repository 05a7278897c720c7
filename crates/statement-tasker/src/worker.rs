//! Completion worker: drains the work queue into the completer.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::completer::{Completer, ResolveOutcome};
use crate::error::TaskerError;
use crate::queue::{Delivery, RedeliveryPolicy, WorkQueue};

/// Pause between polls of an idle queue.
const IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// Processes queued completions with bounded concurrency.
pub struct CompletionWorker {
    queue: Arc<dyn WorkQueue>,
    completer: Arc<Completer>,
    policy: RedeliveryPolicy,
    semaphore: Arc<Semaphore>,
}

impl CompletionWorker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        completer: Completer,
        policy: RedeliveryPolicy,
        max_concurrent: usize,
    ) -> Self {
        Self {
            queue,
            completer: Arc::new(completer),
            policy,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Process completions until the task is cancelled.
    pub async fn run(&self) -> Result<(), TaskerError> {
        tracing::info!(
            max_concurrent = self.semaphore.available_permits(),
            max_receive_count = self.policy.max_receive_count,
            "Completion worker started"
        );

        loop {
            // Wait for available slot
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| TaskerError::Queue(e.to_string()))?;

            match self.queue.receive().await {
                Ok(Some(delivery)) => {
                    let completer = self.completer.clone();
                    let policy = self.policy;

                    tokio::spawn(async move {
                        // Keep permit until done
                        let _permit = permit;
                        if let Err(e) = settle(&completer, policy, delivery).await {
                            tracing::error!(error = %e, "Failed to settle delivery");
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(IDLE_BACKOFF).await;
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Failed to receive completion");
                    tokio::time::sleep(IDLE_BACKOFF).await;
                }
            }
        }
    }

    /// Receive and settle one delivery inline. Returns `false` when the queue is idle.
    pub async fn process_next(&self) -> Result<bool, TaskerError> {
        match self.queue.receive().await? {
            Some(delivery) => {
                settle(&self.completer, self.policy, delivery).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Settle deliveries until the queue is idle. Returns how many were settled.
    pub async fn drain(&self) -> Result<usize, TaskerError> {
        let mut settled = 0;
        while self.process_next().await? {
            settled += 1;
        }
        Ok(settled)
    }
}

/// Resolve a delivery and ack, nack or dead-letter it.
async fn settle(
    completer: &Completer,
    policy: RedeliveryPolicy,
    delivery: Delivery,
) -> Result<Option<ResolveOutcome>, TaskerError> {
    let attempt = delivery.attempt;
    let statement_id = delivery.event.statement_id.clone();

    match completer.resolve(&delivery.event).await {
        Ok(outcome) => {
            delivery.ack().await?;
            Ok(Some(outcome))
        }
        Err(e) if policy.exhausted(attempt) => {
            tracing::error!(statement_id = %statement_id, attempt, error = %e, "Completion failed, giving up");
            delivery.dead_letter(&e.to_string()).await?;
            Ok(None)
        }
        Err(e) => {
            tracing::warn!(statement_id = %statement_id, attempt, error = %e, "Completion failed, will retry");
            delivery.nack(policy.redelivery_delay).await?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CompletionEvent;
    use crate::identity::InvocationKey;
    use crate::queue::MemoryQueue;
    use crate::retry::RetryPolicy;
    use crate::signal::{CallbackSignal, SignalError, TaskOutcome};
    use crate::store::{PendingCallbackRecord, TrackingStore};
    use async_trait::async_trait;
    use statement_api::{StatementStatus, StatusChangeNotification};

    struct DownSignal;

    #[async_trait]
    impl CallbackSignal for DownSignal {
        async fn signal(&self, _token: &str, _outcome: TaskOutcome) -> Result<(), SignalError> {
            Err(SignalError::Transport("no route".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_delivery_is_dead_lettered() {
        let store = TrackingStore::in_memory(Duration::from_secs(3600));
        let key = InvocationKey::generate("exec-1");
        let record = PendingCallbackRecord::new(&key, "select 1", Some("tok".to_string()), store.record_ttl());
        store.create_record(&record).await.unwrap();

        let queue = MemoryQueue::new();
        let notification =
            StatusChangeNotification::new("stmt-1", Some(&key.statement_name()), StatementStatus::Finished);
        queue
            .enqueue(&CompletionEvent::from_notification(notification).unwrap())
            .await
            .unwrap();

        let completer = Completer::new(store.clone(), Arc::new(DownSignal), RetryPolicy::none());
        let policy = RedeliveryPolicy {
            max_receive_count: 3,
            redelivery_delay: Duration::from_secs(1),
        };
        let worker = CompletionWorker::new(Arc::new(queue.clone()), completer, policy, 1);

        for _ in 0..3 {
            assert!(worker.process_next().await.unwrap());
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert!(!worker.process_next().await.unwrap());

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].event().unwrap().statement_id, "stmt-1");
        assert!(!store.get(&key).await.unwrap().unwrap().value.is_resolved());
    }
}
