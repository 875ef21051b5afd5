//! Durable at-least-once queues with dead-letter routing.
//!
//! A [`MessageBroker`] owns the queues; a [`Consumer`] is one worker's view of
//! a single queue and enforces prefetch-of-one. Every delivery must be settled
//! with exactly one of [`Consumer::ack`] or [`Consumer::reject`]. Rejected
//! messages are routed, unmodified, to the queue's dead-letter queue when one
//! is declared and dropped otherwise. Nothing is ever requeued by a reject:
//! the only path back onto a queue is [`Consumer::recover`], which models the
//! broker redelivering messages of a consumer that went away.

mod memory;
mod redis_broker;

pub use self::memory::InMemoryBroker;
pub use self::redis_broker::RedisBroker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;

/// A message handed to a consumer and not yet settled.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub consumer: String,
    /// Number of times this message was handed back by `recover`.
    pub redeliveries: u32,
    pub body: String,
    /// Broker-specific receipt used to settle the message.
    receipt: String,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.redeliveries > 0
    }

    pub(crate) fn receipt(&self) -> &str {
        &self.receipt
    }
}

/// What a broker stores per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub tag: u64,
    pub redeliveries: u32,
    pub body: String,
}

impl Envelope {
    pub(crate) fn into_delivery(self, queue: &str, consumer: &str, receipt: String) -> Delivery {
        Delivery {
            tag: self.tag,
            queue: queue.to_string(),
            consumer: consumer.to_string(),
            redeliveries: self.redeliveries,
            body: self.body,
            receipt,
        }
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declare a queue, optionally routing its rejected messages to `dead_letter`.
    /// Idempotent.
    async fn declare_queue(&self, queue: &str, dead_letter: Option<&str>)
        -> Result<(), QueueError>;

    /// Enqueue a message; returns once the broker has accepted it.
    async fn publish(&self, queue: &str, body: &str) -> Result<(), QueueError>;

    /// Wait up to `timeout` for the next message and hand it to `consumer`.
    async fn receive(
        &self,
        queue: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError>;

    /// Remove a delivered message permanently.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Remove a delivered message and route it to the dead-letter queue, if any.
    /// Returns the dead-letter queue the message went to.
    async fn reject(&self, delivery: &Delivery) -> Result<Option<String>, QueueError>;

    /// Remove a delivered message and append it, unmodified, to `queue` in
    /// one step. The message is never on both lists nor on neither.
    async fn forward(&self, delivery: &Delivery, queue: &str) -> Result<(), QueueError>;

    /// Put every unsettled message held by `consumer` back on `queue`.
    /// Returns how many messages were redelivered.
    async fn recover(&self, queue: &str, consumer: &str) -> Result<u64, QueueError>;

    /// Messages waiting to be delivered (unsettled deliveries not included).
    async fn depth(&self, queue: &str) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Names of the queues the pipeline uses.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueTopology {
    pub task_queue: String,
    pub notification_queue: String,
    pub dead_letter_queue: String,
    /// Dead letters whose job status has been reconciled, kept for operators.
    pub reconciled_queue: String,
}

impl QueueTopology {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            task_queue: config.task_queue.clone(),
            notification_queue: config.notification_queue.clone(),
            dead_letter_queue: config.dlq_queue.clone(),
            reconciled_queue: reconciled_queue_of(&config.dlq_queue),
        }
    }

    /// Declare the dead-letter queue, the task queue routed to it, and the
    /// notification and reconciled queues (which have no dead-letter queue).
    pub async fn declare(&self, broker: &dyn MessageBroker) -> Result<(), QueueError> {
        broker.declare_queue(&self.dead_letter_queue, None).await?;
        broker.declare_queue(&self.reconciled_queue, None).await?;
        broker
            .declare_queue(&self.task_queue, Some(&self.dead_letter_queue))
            .await?;
        broker.declare_queue(&self.notification_queue, None).await?;
        Ok(())
    }
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self {
            task_queue: "image_processing".to_string(),
            notification_queue: "notifications".to_string(),
            dead_letter_queue: "dead_letter_queue".to_string(),
            reconciled_queue: reconciled_queue_of("dead_letter_queue"),
        }
    }
}

pub fn reconciled_queue_of(dead_letter_queue: &str) -> String {
    format!("{dead_letter_queue}:reconciled")
}

/// One consumer identity attached to one queue, holding at most one
/// unsettled delivery at a time.
pub struct Consumer {
    broker: Arc<dyn MessageBroker>,
    queue: String,
    consumer_id: String,
    outstanding: Option<u64>,
}

impl Consumer {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        queue: impl Into<String>,
        consumer_id: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            queue: queue.into(),
            consumer_id: consumer_id.into(),
            outstanding: None,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn outstanding(&self) -> Option<u64> {
        self.outstanding
    }

    /// Wait for the next delivery. Fails if the previous one is unsettled.
    pub async fn next(&mut self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        if let Some(tag) = self.outstanding {
            return Err(QueueError::PrefetchExceeded { tag });
        }
        let delivery = self
            .broker
            .receive(&self.queue, &self.consumer_id, timeout)
            .await?;
        if let Some(d) = &delivery {
            self.outstanding = Some(d.tag);
        }
        Ok(delivery)
    }

    pub async fn ack(&mut self, delivery: Delivery) -> Result<(), QueueError> {
        self.check_owned(&delivery)?;
        self.broker.ack(&delivery).await?;
        self.outstanding = None;
        Ok(())
    }

    /// Reject without requeue.
    pub async fn reject(&mut self, delivery: Delivery) -> Result<Option<String>, QueueError> {
        self.check_owned(&delivery)?;
        let routed = self.broker.reject(&delivery).await?;
        self.outstanding = None;
        Ok(routed)
    }

    /// Settle by moving the message to `queue`.
    pub async fn forward(&mut self, delivery: Delivery, queue: &str) -> Result<(), QueueError> {
        self.check_owned(&delivery)?;
        self.broker.forward(&delivery, queue).await?;
        self.outstanding = None;
        Ok(())
    }

    /// Hand any unsettled delivery of this consumer back to the queue, e.g.
    /// after a settle failed or at startup following a crash.
    pub async fn recover(&mut self) -> Result<u64, QueueError> {
        let count = self.broker.recover(&self.queue, &self.consumer_id).await?;
        self.outstanding = None;
        Ok(count)
    }

    fn check_owned(&self, delivery: &Delivery) -> Result<(), QueueError> {
        if self.outstanding != Some(delivery.tag) || delivery.queue != self.queue {
            return Err(QueueError::UnknownDelivery { tag: delivery.tag });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Queue {0} has not been declared")]
    UnknownQueue(String),

    #[error("Delivery {tag} is still unsettled; ack or reject it first")]
    PrefetchExceeded { tag: u64 },

    #[error("Delivery {tag} is not outstanding on this consumer")]
    UnknownDelivery { tag: u64 },
}
