use std::sync::Arc;
use std::time::{Duration, Instant};

use garde::Validate;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::models::event::CompletionEvent;
use crate::models::job::JobDescriptor;
use crate::services::queue::{Consumer, Delivery, MessageBroker, QueueError, QueueTopology};
use crate::services::retry::Backoff;
use crate::services::storage::{BlobStore, StorageError};
use crate::services::transforms::{TransformError, TransformRegistry};

const PROCESSED_CONTENT_TYPE: &str = "image/jpeg";
const LOGGED_PAYLOAD_BYTES: usize = 512;

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Output written, completion event published, message acknowledged.
    Completed(CompletionEvent),
    /// Message rejected without requeue; `dead_letter_queue` is where it went.
    DeadLettered {
        job_id: Option<String>,
        dead_letter_queue: Option<String>,
        reason: String,
    },
}

/// Why a job could not be completed. Every variant ends in a reject.
#[derive(Debug, thiserror::Error)]
pub enum JobFailure {
    #[error("Malformed job descriptor: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid job descriptor: {0}")]
    Invalid(#[from] garde::Report),

    #[error("Failed to fetch payload: {0}")]
    Fetch(#[source] StorageError),

    #[error("Transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("Failed to store output: {0}")]
    Store(#[source] StorageError),

    #[error("Failed to encode completion event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to publish completion event: {0}")]
    Notify(#[source] QueueError),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Queue unavailable after {attempts} consecutive failures: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: QueueError,
    },
}

/// Pulls one task at a time from the task queue and runs it to completion.
pub struct Worker {
    id: String,
    consumer: Consumer,
    broker: Arc<dyn MessageBroker>,
    storage: Arc<dyn BlobStore>,
    transforms: Arc<TransformRegistry>,
    notification_queue: String,
    processed_bucket: String,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        broker: Arc<dyn MessageBroker>,
        storage: Arc<dyn BlobStore>,
        transforms: Arc<TransformRegistry>,
        topology: &QueueTopology,
        processed_bucket: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            consumer: Consumer::new(broker.clone(), &topology.task_queue, &id),
            id,
            broker,
            storage,
            transforms,
            notification_queue: topology.notification_queue.clone(),
            processed_bucket: processed_bucket.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reclaim messages this worker identity left unsettled in a previous run.
    pub async fn recover(&mut self) -> Result<u64, QueueError> {
        let count = self.consumer.recover().await?;
        if count > 0 {
            tracing::warn!(worker_id = %self.id, count, "Redelivering unsettled tasks from a previous run");
        }
        Ok(count)
    }

    /// Receive and handle at most one task. Returns `Ok(None)` on timeout.
    pub async fn poll_once(&mut self, timeout: Duration) -> Result<Option<Disposition>, QueueError> {
        match self.consumer.next(timeout).await? {
            Some(delivery) => self.handle(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Process one delivery and settle it with exactly one ack or reject.
    ///
    /// Errors are only returned when settling itself fails; the delivery then
    /// stays unsettled until [`Worker::recover`] or broker redelivery.
    pub async fn handle(&mut self, delivery: Delivery) -> Result<Disposition, QueueError> {
        let started = Instant::now();
        let job_id = job_id_hint(&delivery.body);
        tracing::info!(
            worker_id = %self.id,
            job_id = job_id.as_deref().unwrap_or("<unknown>"),
            delivery_tag = delivery.tag,
            redelivered = delivery.is_redelivery(),
            "Processing task"
        );

        match self.process(&delivery.body, started).await {
            Ok(event) => {
                self.consumer.ack(delivery).await?;
                metrics::counter!("pipeline_jobs_completed_total").increment(1);
                metrics::histogram!("pipeline_processing_seconds").record(event.processing_time);
                tracing::info!(
                    worker_id = %self.id,
                    job_id = %event.job_id,
                    processing_time = event.processing_time,
                    processed_file = event.processed_file.as_deref().unwrap_or_default(),
                    "Job completed"
                );
                Ok(Disposition::Completed(event))
            }
            Err(failure) => {
                tracing::error!(
                    worker_id = %self.id,
                    job_id = job_id.as_deref().unwrap_or("<unknown>"),
                    error = %failure,
                    payload = truncate(&delivery.body, LOGGED_PAYLOAD_BYTES),
                    "Job failed, rejecting to dead-letter queue"
                );
                let routed = self.consumer.reject(delivery).await?;
                metrics::counter!("pipeline_jobs_dead_lettered_total").increment(1);
                Ok(Disposition::DeadLettered {
                    job_id,
                    dead_letter_queue: routed,
                    reason: failure.to_string(),
                })
            }
        }
    }

    async fn process(&self, body: &str, started: Instant) -> Result<CompletionEvent, JobFailure> {
        let descriptor: JobDescriptor = serde_json::from_str(body)?;
        descriptor.validate()?;

        tracing::debug!(worker_id = %self.id, job_id = %descriptor.job_id, bucket = %descriptor.bucket, key = %descriptor.file_name, "Downloading payload");
        let payload = self
            .storage
            .get(&descriptor.bucket, &descriptor.file_name)
            .await
            .map_err(JobFailure::Fetch)?;

        let registry = self.transforms.clone();
        let operations = descriptor.operations.clone();
        let output = tokio::task::spawn_blocking(move || registry.run(&operations, payload))
            .await
            .map_err(|e| TransformError::Aborted(e.to_string()))??;

        for name in &output.skipped {
            metrics::counter!("pipeline_unknown_operations_total").increment(1);
            tracing::warn!(worker_id = %self.id, job_id = %descriptor.job_id, operation = %name, "Unknown operation, skipping");
        }

        let processed_key = descriptor.processed_key();
        self.storage
            .put(
                &self.processed_bucket,
                &processed_key,
                &output.bytes,
                PROCESSED_CONTENT_TYPE,
            )
            .await
            .map_err(JobFailure::Store)?;

        let event = CompletionEvent::completed(
            descriptor.job_id,
            processed_key,
            started.elapsed().as_secs_f64(),
            self.id.clone(),
        );
        let body = serde_json::to_string(&event).map_err(JobFailure::Encode)?;
        self.broker
            .publish(&self.notification_queue, &body)
            .await
            .map_err(JobFailure::Notify)?;
        Ok(event)
    }

    /// Consume until `shutdown` flips to true. Consecutive queue failures are
    /// retried with `backoff`; once `backoff.max_attempts()` is reached the
    /// worker gives up.
    ///
    /// Messages left unsettled by an earlier run under the same identity are
    /// redelivered first.
    pub async fn run(
        mut self,
        receive_timeout: Duration,
        backoff: Backoff,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        self.recover().await.map_err(|source| WorkerError::Unavailable {
            attempts: 1,
            source,
        })?;
        tracing::info!(worker_id = %self.id, queue = %self.consumer.queue(), "Waiting for tasks");
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }
            // Shutdown only interrupts the wait; a received task is always settled.
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.consumer.next(receive_timeout) => next,
            };
            let result = match next {
                Ok(Some(delivery)) => self.handle(delivery).await.map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            };

            match result {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures += 1;
                    if failures >= backoff.max_attempts() {
                        return Err(WorkerError::Unavailable {
                            attempts: failures,
                            source: e,
                        });
                    }
                    let delay = backoff.delay(failures);
                    tracing::error!(
                        worker_id = %self.id,
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Queue error, will retry"
                    );
                    sleep(delay).await;
                    if self.consumer.outstanding().is_some() {
                        if let Err(e) = self.recover().await {
                            tracing::error!(worker_id = %self.id, error = %e, "Failed to recover unsettled task");
                        }
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }
}

/// Best-effort job id for logging, even when the descriptor is invalid.
fn job_id_hint(body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("job_id")?
        .as_str()
        .map(str::to_string)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
