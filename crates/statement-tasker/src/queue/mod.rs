//! Durable work queue between the listener and the completer.
//!
//! Delivery is at-least-once. A delivery that fails is redelivered after
//! `redelivery_delay` until it has been received `max_receive_count` times,
//! then it is moved to the dead-letter destination.

mod jetstream;
mod memory;

pub use jetstream::JetStreamQueue;
pub(crate) use jetstream::{ensure_consumer, ensure_stream, publish_dead_letter};
pub use memory::{DeadLetter, MemoryQueue};

use async_trait::async_trait;
use std::time::Duration;

use crate::error::TaskerError;
use crate::event::CompletionEvent;

/// Redelivery and dead-letter policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedeliveryPolicy {
    pub max_receive_count: u32,
    pub redelivery_delay: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_receive_count: 3,
            redelivery_delay: Duration::from_secs(1),
        }
    }
}

impl RedeliveryPolicy {
    /// Whether a delivery failing on `attempt` (1-based) goes to dead letter.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_receive_count
    }
}

/// Settles one delivery with the queue.
#[async_trait]
pub trait DeliveryHandle: Send + Sync {
    async fn ack(&self) -> Result<(), TaskerError>;

    async fn nack(&self, delay: Duration) -> Result<(), TaskerError>;

    async fn dead_letter(&self, reason: &str) -> Result<(), TaskerError>;
}

/// A received completion event.
pub struct Delivery {
    pub event: CompletionEvent,

    /// 1-based delivery count.
    pub attempt: u32,

    handle: Box<dyn DeliveryHandle>,
}

impl Delivery {
    pub fn new(event: CompletionEvent, attempt: u32, handle: Box<dyn DeliveryHandle>) -> Self {
        Self { event, attempt, handle }
    }

    pub async fn ack(self) -> Result<(), TaskerError> {
        self.handle.ack().await
    }

    pub async fn nack(self, delay: Duration) -> Result<(), TaskerError> {
        self.handle.nack(delay).await
    }

    pub async fn dead_letter(self, reason: &str) -> Result<(), TaskerError> {
        self.handle.dead_letter(reason).await
    }
}

/// Queue of completion events.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, event: &CompletionEvent) -> Result<(), TaskerError>;

    /// Move an event that could not be enqueued straight to dead letter.
    async fn dead_letter(&self, event: &CompletionEvent, reason: &str) -> Result<(), TaskerError>;

    /// Next available delivery, or `None` when the queue is idle.
    ///
    /// Undecodable messages are dead-lettered here and never returned.
    async fn receive(&self) -> Result<Option<Delivery>, TaskerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_exhaustion() {
        let policy = RedeliveryPolicy::default();
        assert!(!policy.exhausted(1));
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
    }
}
