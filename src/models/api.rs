use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

use super::job::{JobResult, JobState};

/// Response after an upload has been stored and queued.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub job_id: String,
    pub status: JobState,
    pub operations: Vec<String>,
    pub message: String,
}

/// Body of the internal `POST /jobs/update` callback.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StatusUpdateRequest {
    #[garde(length(min = 1))]
    pub job_id: String,
    #[garde(skip)]
    pub status: JobState,
    #[garde(skip)]
    #[serde(default)]
    pub result: Option<JobResult>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusUpdateResponse {
    pub message: String,
    pub previous: JobState,
    pub current: JobState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueDepth {
    pub name: String,
    pub messages: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueDepths {
    pub task_queue: QueueDepth,
    pub notification_queue: QueueDepth,
    pub dlq: QueueDepth,
    pub reconciled: QueueDepth,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobCounts {
    pub total: u64,
    pub by_status: BTreeMap<JobState, u64>,
}

/// `GET /metrics` body.
#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub timestamp: DateTime<Utc>,
    pub queues: QueueDepths,
    pub jobs: JobCounts,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DlqStats {
    pub dlq: String,
    pub failed_messages: u64,
    /// Dead letters already reflected in job status, still kept for operators
    pub reconciled_messages: u64,
    pub timestamp: DateTime<Utc>,
}
