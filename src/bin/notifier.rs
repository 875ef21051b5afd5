use std::error::Error;
use std::sync::Arc;

use tokio::sync::watch;

use image_pipeline::{
    config::AppConfig,
    services::{
        notifier::NotificationSink,
        queue::{MessageBroker, QueueTopology, RedisBroker},
        status::{LogSink, StatusCallback, StatusSink},
    },
    telemetry,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    telemetry::init();

    let config = AppConfig::from_env()?;
    tracing::info!("Starting notification sink");

    let backoff = config.backoff();
    let broker: Arc<dyn MessageBroker> = Arc::new(RedisBroker::new(&config.redis_url)?);
    backoff.retry("redis", || broker.health_check()).await?;

    let topology = QueueTopology::from_config(&config);
    topology.declare(broker.as_ref()).await?;

    let sink: Arc<dyn StatusSink> = match &config.status_callback_url {
        Some(url) => {
            tracing::info!(url = %url, "Forwarding status updates to gateway");
            Arc::new(StatusCallback::new(url))
        }
        None => {
            tracing::info!("No STATUS_CALLBACK_URL set, logging events only");
            Arc::new(LogSink)
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    NotificationSink::new(broker, &topology, sink)
        .run(config.receive_timeout(), backoff, shutdown_rx)
        .await?;
    Ok(())
}
