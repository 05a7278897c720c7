//! In-memory work queue.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{Delivery, DeliveryHandle, WorkQueue};
use crate::error::TaskerError;
use crate::event::CompletionEvent;

#[derive(Debug, Clone)]
struct QueuedMessage {
    payload: Vec<u8>,
    deliveries: u32,
    available_at: Instant,
}

/// Message moved to the dead-letter list.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub payload: Vec<u8>,
    pub reason: String,
    pub attempts: u32,
}

impl DeadLetter {
    /// Decoded event, when the payload is a valid one.
    pub fn event(&self) -> Option<CompletionEvent> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[derive(Default)]
struct Inner {
    ready: Mutex<VecDeque<QueuedMessage>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

/// Work queue held in process memory, with an inspectable dead-letter list.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw payload.
    pub async fn enqueue_raw(&self, payload: Vec<u8>) {
        self.inner.ready.lock().await.push_back(QueuedMessage {
            payload,
            deliveries: 0,
            available_at: Instant::now(),
        });
    }

    /// Messages waiting for delivery, including delayed ones.
    pub async fn len(&self) -> usize {
        self.inner.ready.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().await.clone()
    }
}

struct MemoryDelivery {
    inner: Arc<Inner>,
    message: QueuedMessage,
}

#[async_trait]
impl DeliveryHandle for MemoryDelivery {
    async fn ack(&self) -> Result<(), TaskerError> {
        Ok(())
    }

    async fn nack(&self, delay: Duration) -> Result<(), TaskerError> {
        let mut message = self.message.clone();
        message.available_at = Instant::now() + delay;
        self.inner.ready.lock().await.push_back(message);
        Ok(())
    }

    async fn dead_letter(&self, reason: &str) -> Result<(), TaskerError> {
        tracing::warn!(attempts = self.message.deliveries, reason, "Completion moved to dead letter");
        self.inner.dead_letters.lock().await.push(DeadLetter {
            payload: self.message.payload.clone(),
            reason: reason.to_string(),
            attempts: self.message.deliveries,
        });
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, event: &CompletionEvent) -> Result<(), TaskerError> {
        self.enqueue_raw(serde_json::to_vec(event)?).await;
        Ok(())
    }

    async fn dead_letter(&self, event: &CompletionEvent, reason: &str) -> Result<(), TaskerError> {
        tracing::warn!(statement_id = %event.statement_id, reason, "Completion moved to dead letter");
        self.inner.dead_letters.lock().await.push(DeadLetter {
            payload: serde_json::to_vec(event)?,
            reason: reason.to_string(),
            attempts: 0,
        });
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, TaskerError> {
        loop {
            let mut message = {
                let mut ready = self.inner.ready.lock().await;
                let now = Instant::now();
                let Some(index) = ready.iter().position(|m| m.available_at <= now) else {
                    return Ok(None);
                };
                match ready.remove(index) {
                    Some(message) => message,
                    None => return Ok(None),
                }
            };
            message.deliveries += 1;

            let handle = MemoryDelivery {
                inner: self.inner.clone(),
                message,
            };

            match serde_json::from_slice::<CompletionEvent>(&handle.message.payload) {
                Ok(event) => {
                    let attempt = handle.message.deliveries;
                    return Ok(Some(Delivery::new(event, attempt, Box::new(handle))));
                }
                Err(e) => {
                    handle.dead_letter(&format!("undecodable completion: {}", e)).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statement_api::{StatementStatus, StatusChangeNotification};

    fn event() -> CompletionEvent {
        let notification = StatusChangeNotification::new("stmt-1", None, StatementStatus::Finished);
        CompletionEvent::from_notification(notification).unwrap()
    }

    #[tokio::test]
    async fn test_receive_and_ack() {
        let queue = MemoryQueue::new();
        queue.enqueue(&event()).await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.event.statement_id, "stmt-1");
        delivery.ack().await.unwrap();

        assert!(queue.receive().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_redelivers_after_delay() {
        let queue = MemoryQueue::new();
        queue.enqueue(&event()).await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        delivery.nack(Duration::from_secs(1)).await.unwrap();
        assert!(queue.receive().await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.attempt, 2);
    }

    #[tokio::test]
    async fn test_poison_message_is_dead_lettered() {
        let queue = MemoryQueue::new();
        queue.enqueue_raw(b"not json".to_vec()).await;
        queue.enqueue(&event()).await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.event.statement_id, "stmt-1");

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("undecodable"));
        assert!(dead[0].event().is_none());
    }
}
