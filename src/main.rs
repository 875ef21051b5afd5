use std::error::Error;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;

use image_pipeline::{
    app_state::AppState,
    config::AppConfig,
    routes,
    services::{
        notifier::{first_failure, DeadLetterReconciler, NotificationSink},
        queue::{MessageBroker, QueueTopology, RedisBroker},
        status::InMemoryStatusStore,
        storage::{BlobStore, S3BlobStore},
    },
    telemetry,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    telemetry::init();

    let config = AppConfig::from_env()?;
    tracing::info!("Initializing image-pipeline gateway");

    let prometheus_handle = Arc::new(PrometheusBuilder::new().install_recorder()?);
    telemetry::describe_metrics();

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
    for bucket in [&config.upload_bucket, &config.processed_bucket] {
        backoff
            .retry("object storage", || storage.ensure_bucket(bucket))
            .await?;
    }

    let topology = QueueTopology::from_config(&config);
    topology.declare(broker.as_ref()).await?;

    let store = Arc::new(InMemoryStatusStore::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = JoinSet::new();

    if config.embedded_notifier {
        let sink = NotificationSink::new(broker.clone(), &topology, store.clone());
        background.spawn(sink.run(config.receive_timeout(), backoff, shutdown_rx.clone()));
    }

    if config.reconcile_dead_letters {
        let reconciler = DeadLetterReconciler::new(broker.clone(), &topology, store.clone());
        background.spawn(reconciler.run(config.receive_timeout(), backoff, shutdown_rx.clone()));
    }

    // A consumer that gives up stops the whole gateway, like the worker does.
    let (failed_tx, failed_rx) = oneshot::channel::<()>();
    let mut stopping = shutdown_rx.clone();
    let supervisor = tokio::spawn(async move {
        let failure = tokio::select! {
            e = first_failure(&mut background) => Some(e),
            _ = stopping.changed() => None,
        };
        if failure.is_some() {
            let _ = failed_tx.send(());
        }
        while background.join_next().await.is_some() {}
        failure
    });

    let state = AppState::new(broker, storage, store, topology, &config.upload_bucket);
    let app = routes::router(state, Some(prometheus_handle), config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        tracing::error!(error = %e, "Failed to listen for shutdown signal");
                    }
                    tracing::info!("Shutdown requested");
                }
                Ok(()) = failed_rx => tracing::error!("Background consumer failed, shutting down"),
            }
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(e) = supervisor.await? {
        tracing::error!(error = %e, "Gateway stopped after consumer failure");
        return Err(e.into());
    }
    tracing::info!("Gateway stopped");
    Ok(())
}
