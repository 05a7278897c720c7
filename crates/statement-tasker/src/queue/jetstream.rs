//! JetStream-backed work queue.

use async_nats::jetstream::{self, consumer::pull::Config as ConsumerConfig, AckKind, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use std::time::Duration;

use super::{Delivery, DeliveryHandle, RedeliveryPolicy, WorkQueue};
use crate::config::TaskerConfig;
use crate::error::TaskerError;
use crate::event::CompletionEvent;

/// How long a fetch waits for a message before reporting the queue idle.
const FETCH_EXPIRY: Duration = Duration::from_secs(5);

/// Dead-letter envelope published to the DLQ stream.
#[derive(Debug, Serialize)]
struct DeadLetterMessage<'a> {
    reason: &'a str,
    attempts: u32,
    subject: &'a str,
    payload: String,
}

/// Work queue on a JetStream stream with a durable pull consumer.
pub struct JetStreamQueue {
    js: Context,
    subject: String,
    consumer: PullConsumer,
    dead_letter_subject: String,
}

pub(crate) type PullConsumer = jetstream::consumer::Consumer<ConsumerConfig>;

pub(crate) async fn ensure_stream(js: &Context, name: &str, subject: &str) -> Result<(), TaskerError> {
    match js.get_stream(name).await {
        Ok(_) => {
            tracing::debug!(stream = %name, "Using existing NATS stream");
        }
        Err(_) => {
            js.create_stream(jetstream::stream::Config {
                name: name.to_string(),
                subjects: vec![subject.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| TaskerError::Queue(format!("Failed to create stream {}: {}", name, e)))?;
            tracing::info!(stream = %name, "Created NATS stream");
        }
    }
    Ok(())
}

/// Create or get a durable pull consumer on `stream`.
pub(crate) async fn ensure_consumer(
    js: &Context,
    stream: &str,
    name: &str,
    subject: &str,
    policy: &RedeliveryPolicy,
) -> Result<PullConsumer, TaskerError> {
    let stream = js
        .get_stream(stream)
        .await
        .map_err(|e| TaskerError::Queue(e.to_string()))?;

    match stream.get_consumer(name).await {
        Ok(consumer) => Ok(consumer),
        Err(_) => {
            let consumer = stream
                .create_consumer(ConsumerConfig {
                    durable_name: Some(name.to_string()),
                    filter_subject: subject.to_string(),
                    // One delivery beyond the policy so the last failure
                    // can still be moved to dead letter explicitly.
                    max_deliver: policy.max_receive_count as i64 + 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| TaskerError::Queue(e.to_string()))?;
            tracing::info!(consumer = %name, "Created NATS consumer");
            Ok(consumer)
        }
    }
}

/// Publish a dead-letter envelope and wait for the stream to store it.
pub(crate) async fn publish_dead_letter(
    js: &Context,
    dead_letter_subject: &str,
    reason: &str,
    attempts: u32,
    subject: &str,
    payload: &[u8],
) -> Result<(), TaskerError> {
    let envelope = DeadLetterMessage {
        reason,
        attempts,
        subject,
        payload: String::from_utf8_lossy(payload).into_owned(),
    };
    let data = serde_json::to_vec(&envelope)?;

    js.publish(dead_letter_subject.to_string(), data.into())
        .await
        .map_err(|e| TaskerError::Queue(e.to_string()))?
        .await
        .map_err(|e| TaskerError::Queue(e.to_string()))?;

    tracing::warn!(attempts, reason, subject, "Message moved to dead letter");
    Ok(())
}

impl JetStreamQueue {
    /// Ensure the work and dead-letter streams and the durable consumer exist.
    pub async fn connect(client: async_nats::Client, config: &TaskerConfig) -> Result<Self, TaskerError> {
        let js = jetstream::new(client);

        ensure_stream(&js, &config.work_stream, &config.work_subject).await?;
        ensure_stream(&js, &config.dead_letter_stream, &config.dead_letter_subject).await?;
        let consumer = ensure_consumer(
            &js,
            &config.work_stream,
            &config.work_consumer,
            &config.work_subject,
            &config.redelivery_policy(),
        )
        .await?;

        Ok(Self {
            js,
            subject: config.work_subject.clone(),
            consumer,
            dead_letter_subject: config.dead_letter_subject.clone(),
        })
    }
}

struct JetStreamDelivery {
    js: Context,
    message: jetstream::Message,
    attempt: u32,
    dead_letter_subject: String,
}

#[async_trait]
impl DeliveryHandle for JetStreamDelivery {
    async fn ack(&self) -> Result<(), TaskerError> {
        self.message
            .ack()
            .await
            .map_err(|e| TaskerError::Queue(format!("Failed to ack message: {}", e)))
    }

    async fn nack(&self, delay: Duration) -> Result<(), TaskerError> {
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| TaskerError::Queue(format!("Failed to nack message: {}", e)))
    }

    async fn dead_letter(&self, reason: &str) -> Result<(), TaskerError> {
        publish_dead_letter(
            &self.js,
            &self.dead_letter_subject,
            reason,
            self.attempt,
            self.message.subject.as_str(),
            &self.message.payload,
        )
        .await?;

        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| TaskerError::Queue(format!("Failed to terminate message: {}", e)))
    }
}

#[async_trait]
impl WorkQueue for JetStreamQueue {
    async fn enqueue(&self, event: &CompletionEvent) -> Result<(), TaskerError> {
        let data = serde_json::to_vec(event)?;
        self.js
            .publish(self.subject.clone(), data.into())
            .await
            .map_err(|e| TaskerError::Queue(e.to_string()))?
            .await
            .map_err(|e| TaskerError::Queue(e.to_string()))?;

        tracing::debug!(statement_id = %event.statement_id, status = %event.status, "Completion enqueued");
        Ok(())
    }

    async fn dead_letter(&self, event: &CompletionEvent, reason: &str) -> Result<(), TaskerError> {
        let payload = serde_json::to_vec(event)?;
        publish_dead_letter(&self.js, &self.dead_letter_subject, reason, 0, &self.subject, &payload).await
    }

    async fn receive(&self) -> Result<Option<Delivery>, TaskerError> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(FETCH_EXPIRY)
            .messages()
            .await
            .map_err(|e| TaskerError::Queue(e.to_string()))?;

        let Some(message) = messages.next().await else {
            return Ok(None);
        };
        let message = message.map_err(|e| TaskerError::Queue(format!("Failed to receive message: {}", e)))?;
        let attempt = message.info().map(|info| info.delivered as u32).unwrap_or(1);

        let decoded = serde_json::from_slice::<CompletionEvent>(&message.payload);
        let handle = JetStreamDelivery {
            js: self.js.clone(),
            message,
            attempt,
            dead_letter_subject: self.dead_letter_subject.clone(),
        };

        match decoded {
            Ok(event) => Ok(Some(Delivery::new(event, attempt, Box::new(handle)))),
            Err(e) => {
                handle.dead_letter(&format!("undecodable completion: {}", e)).await?;
                Ok(None)
            }
        }
    }
}
