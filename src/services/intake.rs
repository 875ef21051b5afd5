use std::sync::Arc;

use chrono::Utc;
use garde::Validate;
use uuid::Uuid;

use crate::models::job::{JobDescriptor, JobStatusRecord, Operation};
use crate::services::queue::{MessageBroker, QueueError};
use crate::services::status::{StatusError, StatusStore};
use crate::services::storage::{BlobStore, StorageError};

/// Accepted job, as returned to the uploader.
#[derive(Debug, Clone)]
pub struct SubmittedJob {
    pub job_id: String,
    pub operations: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("No valid operations specified. Valid operations: {}", Operation::names().join(", "))]
    NoValidOperations,

    #[error("Invalid job: {0}")]
    Invalid(#[from] garde::Report),

    #[error("Failed to store upload: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to record job status: {0}")]
    Status(#[from] StatusError),

    #[error("Failed to enqueue job: {0}")]
    Queue(#[from] QueueError),

    #[error("Failed to encode job descriptor: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Stores an upload, records it as `queued`, and publishes its descriptor.
///
/// The status record is written before the descriptor is published, so a
/// completion event can never arrive for a job the store does not know.
pub struct JobSubmitter {
    broker: Arc<dyn MessageBroker>,
    storage: Arc<dyn BlobStore>,
    status: Arc<dyn StatusStore>,
    upload_bucket: String,
    task_queue: String,
}

impl JobSubmitter {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        storage: Arc<dyn BlobStore>,
        status: Arc<dyn StatusStore>,
        upload_bucket: impl Into<String>,
        task_queue: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            storage,
            status,
            upload_bucket: upload_bucket.into(),
            task_queue: task_queue.into(),
        }
    }

    pub fn upload_bucket(&self) -> &str {
        &self.upload_bucket
    }

    /// Submit `data` for processing with the comma-separated `operations`.
    /// Unknown operation names are dropped; if none remain the job is refused
    /// before anything is stored.
    pub async fn submit(
        &self,
        original_name: &str,
        content_type: &str,
        data: &[u8],
        operations: &str,
    ) -> Result<SubmittedJob, SubmitError> {
        let operations: Vec<String> = Operation::parse_list(operations)
            .into_iter()
            .map(|op| op.to_string())
            .collect();
        if operations.is_empty() {
            return Err(SubmitError::NoValidOperations);
        }

        let job_id = Uuid::new_v4().to_string();
        let descriptor = JobDescriptor {
            file_name: format!("{job_id}_{original_name}"),
            job_id,
            original_name: original_name.to_string(),
            operations,
            timestamp: Utc::now(),
            bucket: self.upload_bucket.clone(),
        };
        descriptor.validate()?;
        let body = serde_json::to_string(&descriptor)?;

        self.storage
            .put(&descriptor.bucket, &descriptor.file_name, data, content_type)
            .await?;
        tracing::debug!(job_id = %descriptor.job_id, key = %descriptor.file_name, size = data.len(), "Upload stored");

        self.status
            .insert(&descriptor.job_id, JobStatusRecord::queued(&descriptor))
            .await?;

        if let Err(e) = self.broker.publish(&self.task_queue, &body).await {
            // Never published, so nothing will ever update this record.
            if let Err(discard) = self.status.discard(&descriptor.job_id).await {
                tracing::warn!(job_id = %descriptor.job_id, error = %discard, "Failed to discard unpublished job");
            }
            return Err(e.into());
        }

        metrics::counter!("pipeline_jobs_submitted_total").increment(1);
        tracing::info!(
            job_id = %descriptor.job_id,
            operations = ?descriptor.operations,
            original_name,
            "Job queued"
        );
        Ok(SubmittedJob {
            job_id: descriptor.job_id,
            operations: descriptor.operations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobState;
    use crate::services::queue::{InMemoryBroker, QueueTopology};
    use crate::services::status::InMemoryStatusStore;
    use crate::services::storage::InMemoryBlobStore;

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        storage: Arc<InMemoryBlobStore>,
        status: Arc<InMemoryStatusStore>,
        submitter: JobSubmitter,
    }

    async fn fixture(declare: bool) -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        if declare {
            QueueTopology::default().declare(broker.as_ref()).await.unwrap();
        }
        let storage = Arc::new(InMemoryBlobStore::new());
        storage.ensure_bucket("images").await.unwrap();
        let status = Arc::new(InMemoryStatusStore::new());
        let submitter = JobSubmitter::new(
            broker.clone(),
            storage.clone(),
            status.clone(),
            "images",
            "image_processing",
        );
        Fixture {
            broker,
            storage,
            status,
            submitter,
        }
    }

    #[tokio::test]
    async fn test_submit_stores_records_and_publishes() {
        let fx = fixture(true).await;
        let job = fx
            .submitter
            .submit("cat.jpg", "image/jpeg", b"jpeg", "resize,watermark")
            .await
            .unwrap();
        assert_eq!(job.operations, vec!["resize", "watermark"]);

        let key = format!("{}_cat.jpg", job.job_id);
        assert_eq!(fx.storage.object("images", &key).unwrap().data, b"jpeg");

        let record = fx.status.get(&job.job_id).await.unwrap();
        assert_eq!(record.status, JobState::Queued);
        assert_eq!(record.file_name, key);

        let queued = fx.broker.peek("image_processing");
        assert_eq!(queued.len(), 1);
        let descriptor: JobDescriptor = serde_json::from_str(&queued[0]).unwrap();
        assert_eq!(descriptor.job_id, job.job_id);
        assert_eq!(descriptor.bucket, "images");
        assert_eq!(descriptor.original_name, "cat.jpg");
    }

    #[tokio::test]
    async fn test_unknown_operations_are_dropped() {
        let fx = fixture(true).await;
        let job = fx
            .submitter
            .submit("cat.jpg", "image/jpeg", b"jpeg", "sepia, filter")
            .await
            .unwrap();
        assert_eq!(job.operations, vec!["filter"]);
    }

    #[tokio::test]
    async fn test_no_valid_operations_is_refused_before_storing() {
        let fx = fixture(true).await;
        let err = fx
            .submitter
            .submit("cat.jpg", "image/jpeg", b"jpeg", "sepia,,")
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::NoValidOperations));
        assert!(err.to_string().contains("resize, watermark, filter"));
        assert_eq!(fx.storage.object_count("images"), 0);
        assert!(fx.broker.peek("image_processing").is_empty());
    }

    #[tokio::test]
    async fn test_failed_publish_discards_status_record() {
        let fx = fixture(false).await;
        let err = fx
            .submitter
            .submit("cat.jpg", "image/jpeg", b"jpeg", "resize")
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Queue(QueueError::UnknownQueue(_))));
        assert!(fx.status.summary().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_job_ids_are_unique() {
        let fx = fixture(true).await;
        let a = fx.submitter.submit("a.jpg", "image/jpeg", b"1", "resize").await.unwrap();
        let b = fx.submitter.submit("a.jpg", "image/jpeg", b"2", "resize").await.unwrap();
        assert_ne!(a.job_id, b.job_id);
        assert_eq!(fx.storage.object_count("images"), 2);
    }
}
