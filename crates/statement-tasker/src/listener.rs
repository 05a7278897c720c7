//! Completion listener.
//!
//! Filters status change notifications down to terminal ones and forwards
//! them to the work queue. Correlation happens in the completer.
//!
//! A notification is never dropped because the queue is unavailable:
//! enqueueing is retried, and a notification that still cannot be forwarded
//! is redelivered by its source or moved to dead letter.

use async_nats::jetstream::{self, AckKind};
use futures::{Stream, StreamExt};
use statement_api::StatusChangeNotification;
use std::sync::Arc;
use std::time::Duration;

use crate::config::TaskerConfig;
use crate::error::TaskerError;
use crate::event::CompletionEvent;
use crate::queue::{self, RedeliveryPolicy, WorkQueue};
use crate::retry::{retry_if, RetryPolicy};

/// How long a notification fetch waits before polling again.
const FETCH_EXPIRY: Duration = Duration::from_secs(5);

/// Forwards terminal status changes to the work queue.
#[derive(Clone)]
pub struct CompletionListener {
    queue: Arc<dyn WorkQueue>,
    retry: RetryPolicy,
}

impl CompletionListener {
    pub fn new(queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            queue,
            retry: RetryPolicy::default(),
        }
    }

    /// Retry policy for enqueueing.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Handle one notification. Returns whether it was enqueued.
    pub async fn handle_notification(&self, notification: StatusChangeNotification) -> Result<bool, TaskerError> {
        match Self::completion(notification) {
            Some(event) => self.forward(&event).await.map(|_| true),
            None => Ok(false),
        }
    }

    fn completion(notification: StatusChangeNotification) -> Option<CompletionEvent> {
        let statement_id = notification.detail.statement_id.clone();
        let state = notification.detail.state;

        let event = CompletionEvent::from_notification(notification);
        if event.is_none() {
            tracing::trace!(statement_id = %statement_id, state = %state, "Ignoring notification");
        }
        event
    }

    /// Enqueue `event`, retrying throttling and queue outages.
    async fn forward(&self, event: &CompletionEvent) -> Result<(), TaskerError> {
        retry_if(&self.retry, "enqueue_completion", TaskerError::is_transient, || {
            self.queue.enqueue(event)
        })
        .await?;

        tracing::debug!(
            statement_id = %event.statement_id,
            status = %event.status,
            tracked = event.invocation.is_some(),
            "Completion forwarded"
        );
        Ok(())
    }

    /// Handle a raw notification payload. Malformed payloads are logged and skipped.
    pub async fn handle_payload(&self, payload: &[u8]) -> Result<bool, TaskerError> {
        match serde_json::from_slice::<StatusChangeNotification>(payload) {
            Ok(notification) => self.handle_notification(notification).await,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed notification");
                Ok(false)
            }
        }
    }

    /// Forward every notification of `stream` until it ends.
    ///
    /// The stream cannot redeliver, so a completion that still fails after
    /// retries goes to dead letter and the listener moves on.
    pub async fn run<S>(&self, mut stream: S)
    where
        S: Stream<Item = StatusChangeNotification> + Unpin,
    {
        while let Some(notification) = stream.next().await {
            let Some(event) = Self::completion(notification) else {
                continue;
            };
            if let Err(e) = self.forward(&event).await {
                tracing::error!(statement_id = %event.statement_id, error = %e, "Failed to forward completion");
                let reason = format!("enqueue failed: {}", e);
                if let Err(e) = self.queue.dead_letter(&event, &reason).await {
                    tracing::error!(statement_id = %event.statement_id, error = %e, "Completion lost");
                }
            }
        }
    }

    /// Forward notifications captured by a JetStream stream on the
    /// notification subject.
    ///
    /// A notification is acked only once it is enqueued. Failures are
    /// redelivered and dead-lettered after `max_receive_count` deliveries.
    pub async fn run_jetstream(&self, client: async_nats::Client, config: &TaskerConfig) -> Result<(), TaskerError> {
        let js = jetstream::new(client);
        let policy = config.redelivery_policy();

        queue::ensure_stream(&js, &config.notification_stream, &config.notification_subject).await?;
        let consumer = queue::ensure_consumer(
            &js,
            &config.notification_stream,
            &config.listener_consumer,
            &config.notification_subject,
            &policy,
        )
        .await?;

        tracing::info!(
            stream = %config.notification_stream,
            subject = %config.notification_subject,
            "Listening for statement notifications"
        );

        loop {
            let mut messages = consumer
                .fetch()
                .max_messages(1)
                .expires(FETCH_EXPIRY)
                .messages()
                .await
                .map_err(|e| TaskerError::Nats(e.to_string()))?;

            while let Some(message) = messages.next().await {
                let message = message.map_err(|e| TaskerError::Nats(e.to_string()))?;
                let attempt = message.info().map(|info| info.delivered as u32).unwrap_or(1);

                match self.handle_payload(&message.payload).await {
                    Ok(_) => {
                        message
                            .ack()
                            .await
                            .map_err(|e| TaskerError::Nats(format!("Failed to ack notification: {}", e)))?;
                    }
                    Err(e) => {
                        self.settle_failed(&js, &config.dead_letter_subject, &policy, &message, attempt, &e)
                            .await?;
                    }
                }
            }
        }
    }

    async fn settle_failed(
        &self,
        js: &jetstream::Context,
        dead_letter_subject: &str,
        policy: &RedeliveryPolicy,
        message: &jetstream::Message,
        attempt: u32,
        error: &TaskerError,
    ) -> Result<(), TaskerError> {
        if policy.exhausted(attempt) {
            queue::publish_dead_letter(
                js,
                dead_letter_subject,
                &format!("enqueue failed: {}", error),
                attempt,
                message.subject.as_str(),
                &message.payload,
            )
            .await?;
            return message
                .ack_with(AckKind::Term)
                .await
                .map_err(|e| TaskerError::Nats(format!("Failed to terminate notification: {}", e)));
        }

        tracing::warn!(attempt, error = %error, "Failed to forward completion, redelivering");
        message
            .ack_with(AckKind::Nak(Some(policy.redelivery_delay)))
            .await
            .map_err(|e| TaskerError::Nats(format!("Failed to nack notification: {}", e)))
    }
}
