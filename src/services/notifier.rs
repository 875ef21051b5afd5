//! Consumers that turn queue traffic into job status changes.
//!
//! [`NotificationSink`] applies completion events from the notification
//! queue. [`DeadLetterReconciler`] optionally marks the jobs behind
//! dead-lettered messages `dead_lettered` and parks the messages on the
//! reconciled queue. Both settle every delivery after the status write has
//! been attempted, so a crash in between redelivers the message and the
//! (idempotent) write is simply repeated.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::models::event::CompletionEvent;
use crate::models::job::JobState;
use crate::services::queue::{Consumer, Delivery, MessageBroker, QueueError, QueueTopology};
use crate::services::retry::Backoff;
use crate::services::status::{StatusError, StatusSink, Transition};

const SINK_CONSUMER: &str = "notification-sink";
const RECONCILER_CONSUMER: &str = "dlq-reconciler";

/// What happened to one consumed message.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Applied { job_id: String, transition: Transition },
    /// Valid message that could not be applied (unknown job, stale state).
    Ignored { job_id: String, reason: String },
    /// Undecodable message: rejected by the sink, parked by the reconciler.
    Dropped,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Status sink unavailable: {0}")]
    Sink(#[source] StatusError),

    #[error("Consumer task panicked: {0}")]
    Panicked(String),
}

/// Wait for the first consumer in `tasks` that stops with an error.
///
/// Tasks that finish cleanly are skipped. Once none is left this never
/// resolves, so it can sit in a `select!` next to a shutdown signal.
pub async fn first_failure(tasks: &mut JoinSet<Result<(), NotifierError>>) -> NotifierError {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return e,
            Err(e) => return NotifierError::Panicked(e.to_string()),
        }
    }
    std::future::pending().await
}

/// Applies [`CompletionEvent`]s from the notification queue to a status sink.
pub struct NotificationSink {
    consumer: Consumer,
    sink: Arc<dyn StatusSink>,
}

impl NotificationSink {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        topology: &QueueTopology,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            consumer: Consumer::new(broker, &topology.notification_queue, SINK_CONSUMER),
            sink,
        }
    }

    pub async fn process_one(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<EventOutcome>, NotifierError> {
        let Some(delivery) = self.consumer.next(timeout).await? else {
            return Ok(None);
        };

        let event: CompletionEvent = match serde_json::from_str(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, payload = %delivery.body, "Malformed completion event, dropping");
                self.consumer.reject(delivery).await?;
                return Ok(Some(EventOutcome::Dropped));
            }
        };

        let target = event.target_state();
        let result = self
            .sink
            .record(&event.job_id, target, event.result())
            .await;
        let outcome = settle_outcome(
            &mut self.consumer,
            delivery,
            None,
            &event.job_id,
            target,
            result,
        )
        .await?;
        if let EventOutcome::Applied { transition, .. } = &outcome {
            let status = transition.current.to_string();
            metrics::counter!("pipeline_status_updates_total", "status" => status).increment(1);
            tracing::info!(
                job_id = %event.job_id,
                worker_id = %event.worker_id,
                previous = %transition.previous,
                current = %transition.current,
                "Job status updated"
            );
        }
        Ok(Some(outcome))
    }

    pub async fn run(
        mut self,
        receive_timeout: Duration,
        backoff: Backoff,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), NotifierError> {
        tracing::info!(queue = %self.consumer.queue(), "Notification sink started");
        run_loop(&mut self, receive_timeout, backoff, shutdown).await
    }
}

/// Marks jobs whose task message reached the dead-letter queue.
///
/// Each message is moved, unmodified, to the reconciled queue once handled,
/// so the payload stays available for a manual republish.
pub struct DeadLetterReconciler {
    consumer: Consumer,
    sink: Arc<dyn StatusSink>,
    reconciled_queue: String,
}

impl DeadLetterReconciler {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        topology: &QueueTopology,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            consumer: Consumer::new(broker, &topology.dead_letter_queue, RECONCILER_CONSUMER),
            sink,
            reconciled_queue: topology.reconciled_queue.clone(),
        }
    }

    pub async fn process_one(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<EventOutcome>, NotifierError> {
        let Some(delivery) = self.consumer.next(timeout).await? else {
            return Ok(None);
        };

        let Some(job_id) = job_id_of(&delivery.body) else {
            tracing::error!(payload = %delivery.body, "Dead letter without a job id, parking");
            self.consumer.forward(delivery, &self.reconciled_queue).await?;
            return Ok(Some(EventOutcome::Dropped));
        };

        tracing::warn!(job_id = %job_id, payload = %delivery.body, "Reconciling dead-lettered job");
        let result = self.sink.record(&job_id, JobState::DeadLettered, None).await;
        let outcome = settle_outcome(
            &mut self.consumer,
            delivery,
            Some(self.reconciled_queue.as_str()),
            &job_id,
            JobState::DeadLettered,
            result,
        )
        .await?;
        Ok(Some(outcome))
    }

    pub async fn run(
        mut self,
        receive_timeout: Duration,
        backoff: Backoff,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), NotifierError> {
        tracing::info!(queue = %self.consumer.queue(), "Dead-letter reconciler started");
        run_loop(&mut self, receive_timeout, backoff, shutdown).await
    }
}

fn job_id_of(body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("job_id")?
        .as_str()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Ack, or forward to `park` when given, unless the sink itself is
/// unreachable. Then the delivery is handed back so it is retried once the
/// sink recovers.
async fn settle_outcome(
    consumer: &mut Consumer,
    delivery: Delivery,
    park: Option<&str>,
    job_id: &str,
    target: JobState,
    result: Result<Transition, StatusError>,
) -> Result<EventOutcome, NotifierError> {
    let outcome = match result {
        Ok(transition) => EventOutcome::Applied {
            job_id: job_id.to_string(),
            transition,
        },
        Err(e @ StatusError::NotFound(_)) => {
            tracing::warn!(job_id, status = %target, "Status update for unknown job ignored");
            EventOutcome::Ignored {
                job_id: job_id.to_string(),
                reason: e.to_string(),
            }
        }
        Err(e @ (StatusError::InvalidTransition { .. } | StatusError::Rejected { .. })) => {
            tracing::warn!(job_id, status = %target, error = %e, "Stale status update ignored");
            EventOutcome::Ignored {
                job_id: job_id.to_string(),
                reason: e.to_string(),
            }
        }
        Err(e) => {
            consumer.recover().await?;
            return Err(NotifierError::Sink(e));
        }
    };
    match park {
        Some(queue) => consumer.forward(delivery, queue).await?,
        None => consumer.ack(delivery).await?,
    }
    Ok(outcome)
}

/// A consumer loop body shared by the sink and the reconciler.
#[async_trait]
trait Drain: Send {
    fn consumer(&mut self) -> &mut Consumer;

    async fn step(&mut self, timeout: Duration) -> Result<Option<EventOutcome>, NotifierError>;
}

#[async_trait]
impl Drain for NotificationSink {
    fn consumer(&mut self) -> &mut Consumer {
        &mut self.consumer
    }

    async fn step(&mut self, timeout: Duration) -> Result<Option<EventOutcome>, NotifierError> {
        self.process_one(timeout).await
    }
}

#[async_trait]
impl Drain for DeadLetterReconciler {
    fn consumer(&mut self) -> &mut Consumer {
        &mut self.consumer
    }

    async fn step(&mut self, timeout: Duration) -> Result<Option<EventOutcome>, NotifierError> {
        self.process_one(timeout).await
    }
}

/// Poll until shutdown, backing off on consecutive errors and giving up
/// after `backoff.max_attempts()` of them.
async fn run_loop<D: Drain>(
    drain: &mut D,
    receive_timeout: Duration,
    backoff: Backoff,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), NotifierError> {
    let reclaimed = drain.consumer().recover().await?;
    if reclaimed > 0 {
        tracing::warn!(queue = %drain.consumer().queue(), count = reclaimed, "Redelivering messages left unsettled by a previous run");
    }

    let mut failures = 0u32;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = drain.step(receive_timeout) => result,
        };

        if let Err(e) = result {
            failures += 1;
            if failures >= backoff.max_attempts() {
                return Err(e);
            }
            let delay = backoff.delay(failures);
            let queue = drain.consumer().queue().to_string();
            tracing::error!(
                queue = %queue,
                error = %e,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Consumer error, will retry"
            );
            sleep(delay).await;
            let consumer = drain.consumer();
            if consumer.outstanding().is_some() {
                if let Err(e) = consumer.recover().await {
                    tracing::error!(queue = %queue, error = %e, "Failed to recover unsettled message");
                }
            }
        } else {
            failures = 0;
        }
    }
    Ok(())
}
