use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Delivery, Envelope, MessageBroker, QueueError};

/// Where a settled message goes.
enum Settle<'a> {
    Discard,
    DeadLetter,
    Forward(&'a str),
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    /// tag -> (consumer, envelope)
    unacked: HashMap<u64, (String, Envelope)>,
    dead_letter: Option<String>,
}

/// In-process broker with the same delivery semantics as [`super::RedisBroker`].
///
/// Used by tests and single-process development setups. The state lock is
/// never held across an await point.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    next_tag: AtomicU64,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bodies waiting on `queue`, in delivery order.
    pub fn peek(&self, queue: &str) -> Vec<String> {
        self.lock()
            .get(queue)
            .map(|q| q.ready.iter().map(|e| e.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of delivered but unsettled messages on `queue`.
    pub fn unacked(&self, queue: &str) -> usize {
        self.lock().get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        // A panic while holding the lock cannot leave a queue half-updated:
        // every mutation below is a single push/pop/insert/remove.
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_take(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut queues = self.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        Ok(state.ready.pop_front().map(|envelope| {
            state
                .unacked
                .insert(envelope.tag, (consumer.to_string(), envelope.clone()));
            envelope.into_delivery(queue, consumer, String::new())
        }))
    }

    /// Remove an unsettled delivery and push it to its destination under one
    /// lock. The destination is resolved first, so a missing queue leaves the
    /// delivery untouched.
    fn settle(&self, delivery: &Delivery, to: Settle<'_>) -> Result<Option<String>, QueueError> {
        let destination = {
            let mut queues = self.lock();
            let state = queues
                .get(&delivery.queue)
                .ok_or_else(|| QueueError::UnknownQueue(delivery.queue.clone()))?;
            match state.unacked.get(&delivery.tag) {
                Some((owner, _)) if *owner == delivery.consumer => {}
                _ => return Err(QueueError::UnknownDelivery { tag: delivery.tag }),
            }
            let destination = match to {
                Settle::Discard => None,
                Settle::DeadLetter => state.dead_letter.clone(),
                Settle::Forward(queue) => Some(queue.to_string()),
            };
            if let Some(queue) = &destination {
                if !queues.contains_key(queue) {
                    return Err(QueueError::UnknownQueue(queue.clone()));
                }
            }

            let (_, envelope) = queues
                .get_mut(&delivery.queue)
                .and_then(|state| state.unacked.remove(&delivery.tag))
                .ok_or(QueueError::UnknownDelivery { tag: delivery.tag })?;
            if let Some(target) = destination.as_ref().and_then(|q| queues.get_mut(q)) {
                target.ready.push_back(envelope);
            }
            destination
        };
        if destination.is_some() {
            self.notify.notify_waiters();
        }
        Ok(destination)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare_queue(
        &self,
        queue: &str,
        dead_letter: Option<&str>,
    ) -> Result<(), QueueError> {
        let mut queues = self.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.dead_letter = dead_letter.map(str::to_string);
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &str) -> Result<(), QueueError> {
        {
            let mut queues = self.lock();
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
            state.ready.push_back(Envelope {
                tag: self.next_tag.fetch_add(1, Ordering::Relaxed) + 1,
                redeliveries: 0,
                body: body.to_string(),
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a publish in between is not missed.
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take(queue, consumer)? {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery, Settle::Discard)?;
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<Option<String>, QueueError> {
        self.settle(delivery, Settle::DeadLetter)
    }

    async fn forward(&self, delivery: &Delivery, queue: &str) -> Result<(), QueueError> {
        self.settle(delivery, Settle::Forward(queue))?;
        Ok(())
    }

    async fn recover(&self, queue: &str, consumer: &str) -> Result<u64, QueueError> {
        let count = {
            let mut queues = self.lock();
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
            let mut tags: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, (owner, _))| owner == consumer)
                .map(|(tag, _)| *tag)
                .collect();
            tags.sort_unstable();
            // Newest first so the oldest ends up at the front.
            for tag in tags.iter().rev() {
                if let Some((_, mut envelope)) = state.unacked.remove(tag) {
                    envelope.redeliveries += 1;
                    state.ready.push_front(envelope);
                }
            }
            tags.len() as u64
        };
        if count > 0 {
            self.notify.notify_waiters();
        }
        Ok(count)
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        self.lock()
            .get(queue)
            .map(|q| q.ready.len() as u64)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
