use std::error::Error;
use std::sync::Arc;

use tokio::sync::watch;

use image_pipeline::{
    config::AppConfig,
    services::{
        queue::{MessageBroker, QueueTopology, RedisBroker},
        storage::{BlobStore, S3BlobStore},
        transforms::TransformRegistry,
        worker::Worker,
    },
    telemetry,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    telemetry::init();

    let config = AppConfig::from_env()?;
    tracing::info!(worker_id = %config.worker_id, "Starting image worker");

    let backoff = config.backoff();

    tracing::info!(redis_url = %config.redis_url, "Connecting to Redis");
    let broker: Arc<dyn MessageBroker> = Arc::new(RedisBroker::new(&config.redis_url)?);
    backoff.retry("redis", || broker.health_check()).await?;

    tracing::info!(endpoint = %config.s3_endpoint, "Connecting to object storage");
    let storage: Arc<dyn BlobStore> = Arc::new(S3BlobStore::new(
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
    )?);
    backoff
        .retry("object storage", || {
            storage.ensure_bucket(&config.processed_bucket)
        })
        .await?;

    let topology = QueueTopology::from_config(&config);
    topology.declare(broker.as_ref()).await?;

    let worker = Worker::new(
        config.worker_id.clone(),
        broker,
        storage,
        Arc::new(TransformRegistry::with_defaults()),
        &topology,
        config.processed_bucket.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing current task");
            let _ = shutdown_tx.send(true);
        }
    });

    tracing::info!("Worker ready, starting job processing loop");
    worker
        .run(config.receive_timeout(), backoff, shutdown_rx)
        .await?;
    Ok(())
}
