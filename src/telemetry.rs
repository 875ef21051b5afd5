use tracing_subscriber::EnvFilter;

/// JSON logs filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .try_init();
}

/// Register descriptions for the pipeline's metrics with the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "pipeline_jobs_submitted_total",
        "Jobs accepted by the gateway and published to the task queue"
    );
    metrics::describe_counter!(
        "pipeline_jobs_completed_total",
        "Jobs a worker finished and acknowledged"
    );
    metrics::describe_counter!(
        "pipeline_jobs_dead_lettered_total",
        "Task messages rejected to the dead-letter queue"
    );
    metrics::describe_counter!(
        "pipeline_unknown_operations_total",
        "Requested operations skipped because no transform is registered"
    );
    metrics::describe_counter!(
        "pipeline_status_updates_total",
        "Status transitions applied from completion events"
    );
    metrics::describe_histogram!(
        "pipeline_processing_seconds",
        "Time from receiving a task to publishing its completion event"
    );
}
