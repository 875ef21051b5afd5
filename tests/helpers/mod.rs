//! In-process pipeline harness and HTTP helpers
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart;
use serde_json::Value;
use tokio::time::sleep;

use image_pipeline::app_state::AppState;
use image_pipeline::models::job::{JobDescriptor, JobStatusRecord};
use image_pipeline::routes;
use image_pipeline::services::intake::JobSubmitter;
use image_pipeline::services::notifier::{DeadLetterReconciler, EventOutcome, NotificationSink};
use image_pipeline::services::queue::{InMemoryBroker, MessageBroker, QueueTopology};
use image_pipeline::services::status::{InMemoryStatusStore, StatusStore};
use image_pipeline::services::storage::{BlobStore, InMemoryBlobStore};
use image_pipeline::services::transforms::TransformRegistry;
use image_pipeline::services::worker::{Disposition, Worker};

pub const WAIT: Duration = Duration::from_millis(50);
pub const UPLOAD_LIMIT: usize = 10 * 1024 * 1024;

/// Gateway, worker and notification sink wired to in-memory infrastructure.
pub struct Pipeline {
    pub broker: Arc<InMemoryBroker>,
    pub storage: Arc<InMemoryBlobStore>,
    pub status: Arc<InMemoryStatusStore>,
    pub topology: QueueTopology,
    pub submitter: JobSubmitter,
}

impl Pipeline {
    pub async fn new() -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        let topology = QueueTopology::default();
        topology
            .declare(broker.as_ref())
            .await
            .expect("declare topology");

        let storage = Arc::new(InMemoryBlobStore::new());
        for bucket in ["images", "processed"] {
            storage.ensure_bucket(bucket).await.expect("ensure bucket");
        }

        let status = Arc::new(InMemoryStatusStore::new());
        let submitter = JobSubmitter::new(
            broker.clone(),
            storage.clone(),
            status.clone(),
            "images",
            topology.task_queue.clone(),
        );
        Self {
            broker,
            storage,
            status,
            topology,
            submitter,
        }
    }

    pub fn worker(&self, id: &str) -> Worker {
        self.worker_with(id, TransformRegistry::with_defaults())
    }

    pub fn worker_with(&self, id: &str, registry: TransformRegistry) -> Worker {
        Worker::new(
            id,
            self.broker.clone(),
            self.storage.clone(),
            Arc::new(registry),
            &self.topology,
            "processed",
        )
    }

    pub fn sink(&self) -> NotificationSink {
        NotificationSink::new(self.broker.clone(), &self.topology, self.status.clone())
    }

    pub fn reconciler(&self) -> DeadLetterReconciler {
        DeadLetterReconciler::new(self.broker.clone(), &self.topology, self.status.clone())
    }

    pub fn state(&self) -> AppState {
        AppState::new(
            self.broker.clone(),
            self.storage.clone(),
            self.status.clone(),
            self.topology.clone(),
            "images",
        )
    }

    /// Publish `descriptor` the way the gateway does, but without storing a
    /// payload.
    pub async fn enqueue(&self, descriptor: &JobDescriptor) {
        self.status
            .insert(&descriptor.job_id, JobStatusRecord::queued(descriptor))
            .await
            .expect("insert status");
        self.broker
            .publish(
                &self.topology.task_queue,
                &serde_json::to_string(descriptor).expect("encode descriptor"),
            )
            .await
            .expect("publish");
    }

    /// Let `worker` handle everything currently on the task queue.
    pub async fn run_worker(&self, worker: &mut Worker) -> Vec<Disposition> {
        let mut handled = Vec::new();
        while let Some(disposition) = worker.poll_once(WAIT).await.expect("worker poll") {
            handled.push(disposition);
        }
        handled
    }

    /// Apply every pending completion event.
    pub async fn drain_notifications(&self) -> Vec<EventOutcome> {
        let mut sink = self.sink();
        let mut outcomes = Vec::new();
        while let Some(outcome) = sink.process_one(WAIT).await.expect("sink") {
            outcomes.push(outcome);
        }
        outcomes
    }

    pub async fn depth(&self, queue: &str) -> u64 {
        self.broker.depth(queue).await.expect("depth")
    }
}

/// Serve the gateway router on an ephemeral port; returns its base URL.
pub async fn spawn_gateway(state: AppState) -> String {
    let app = routes::router(state, None, UPLOAD_LIMIT);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

/// POST /upload with a single file part and optional operations.
pub async fn upload_image(
    client: &reqwest::Client,
    base_url: &str,
    file_name: &str,
    mime: &str,
    bytes: Vec<u8>,
    operations: Option<&str>,
) -> Result<reqwest::Response, Box<dyn std::error::Error>> {
    let mut form = multipart::Form::new().part(
        "file",
        multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime)?,
    );
    if let Some(ops) = operations {
        form = form.text("operations", ops.to_string());
    }

    let response = client
        .post(format!("{base_url}/upload"))
        .multipart(form)
        .send()
        .await?;
    Ok(response)
}

/// GET /status/{job_id} as JSON, with the HTTP status code.
pub async fn get_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &str,
) -> Result<(u16, Value), Box<dyn std::error::Error>> {
    let response = client
        .get(format!("{base_url}/status/{job_id}"))
        .send()
        .await?;
    let code = response.status().as_u16();
    Ok((code, response.json().await?))
}

/// Poll the status endpoint until the job leaves `queued`/`processing`.
pub async fn wait_for_terminal(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &str,
    max_wait: Duration,
) -> Result<Value, Box<dyn std::error::Error>> {
    let start = std::time::Instant::now();
    loop {
        let (_, body) = get_status(client, base_url, job_id).await?;
        let state = body["status"].as_str().unwrap_or_default();
        if !matches!(state, "queued" | "processing") {
            return Ok(body);
        }
        if start.elapsed() > max_wait {
            return Err(format!("job {job_id} still {state} after {max_wait:?}").into());
        }
        sleep(Duration::from_millis(250)).await;
    }
}
