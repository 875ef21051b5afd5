use std::sync::Arc;

use crate::services::{
    intake::JobSubmitter,
    queue::{MessageBroker, QueueTopology},
    status::StatusStore,
    storage::BlobStore,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<dyn MessageBroker>,
    pub storage: Arc<dyn BlobStore>,
    pub status: Arc<dyn StatusStore>,
    pub submitter: Arc<JobSubmitter>,
    pub topology: Arc<QueueTopology>,
}

impl AppState {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        storage: Arc<dyn BlobStore>,
        status: Arc<dyn StatusStore>,
        topology: QueueTopology,
        upload_bucket: &str,
    ) -> Self {
        let submitter = JobSubmitter::new(
            broker.clone(),
            storage.clone(),
            status.clone(),
            upload_bucket,
            topology.task_queue.clone(),
        );
        Self {
            broker,
            storage,
            status,
            submitter: Arc::new(submitter),
            topology: Arc::new(topology),
        }
    }
}
