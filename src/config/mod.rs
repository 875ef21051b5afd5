use serde::Deserialize;
use std::time::Duration;

use crate::services::retry::Backoff;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Gateway bind address (e.g., "0.0.0.0:8000"). Ignored by worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection string for the task, notification and dead-letter queues
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// S3-compatible endpoint (MinIO, R2, ...)
    #[serde(default = "default_s3_endpoint")]
    pub s3_endpoint: String,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    #[serde(default = "default_s3_credential")]
    pub s3_access_key: String,

    #[serde(default = "default_s3_credential")]
    pub s3_secret_key: String,

    /// Bucket receiving raw uploads
    #[serde(default = "default_upload_bucket")]
    pub upload_bucket: String,

    /// Bucket receiving pipeline output
    #[serde(default = "default_processed_bucket")]
    pub processed_bucket: String,

    #[serde(default = "default_task_queue")]
    pub task_queue: String,

    #[serde(default = "default_notification_queue")]
    pub notification_queue: String,

    #[serde(default = "default_dlq_queue")]
    pub dlq_queue: String,

    /// Identity reported in completion events; also names the worker's
    /// processing list, so it must be unique per running worker.
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    /// Consecutive infra failures tolerated before a process gives up
    #[serde(default = "default_connect_max_attempts")]
    pub connect_max_attempts: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// How long a blocking receive waits before re-checking for shutdown
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Run the dead-letter reconciler inside the gateway
    #[serde(default)]
    pub reconcile_dead_letters: bool,

    /// Run the notification sink inside the gateway
    #[serde(default = "default_true")]
    pub embedded_notifier: bool,

    /// Gateway base URL the standalone notifier forwards status updates to
    #[serde(default)]
    pub status_callback_url: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_s3_endpoint() -> String {
    "http://localhost:9000".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_s3_credential() -> String {
    "minioadmin".to_string()
}

fn default_upload_bucket() -> String {
    "images".to_string()
}

fn default_processed_bucket() -> String {
    "processed".to_string()
}

fn default_task_queue() -> String {
    "image_processing".to_string()
}

fn default_notification_queue() -> String {
    "notifications".to_string()
}

fn default_dlq_queue() -> String {
    "dead_letter_queue".to_string()
}

fn default_worker_id() -> String {
    "1".to_string()
}

fn default_connect_max_attempts() -> u32 {
    30
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    10_000
}

fn default_receive_timeout_secs() -> u64 {
    5
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Backoff used for connecting and reconnecting to the broker and blob store.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms),
            self.connect_max_attempts,
        )
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }
}
