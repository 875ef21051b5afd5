pub mod error;
pub mod health;
pub mod metrics;
pub mod status;
pub mod upload;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::models::job::Operation;

/// Build the gateway router. The Prometheus endpoint is only mounted when a
/// recorder handle is supplied.
pub fn router(
    state: AppState,
    prometheus: Option<Arc<PrometheusHandle>>,
    max_upload_bytes: usize,
) -> Router {
    let mut app = Router::new()
        .route("/", get(service_info))
        .route("/health", get(health::health_check))
        .route("/upload", post(upload::upload_image))
        .route("/status/{job_id}", get(status::get_status))
        .route("/jobs/update", post(status::update_status))
        .route("/metrics", get(metrics::pipeline_metrics))
        .route("/dlq/stats", get(metrics::dlq_stats))
        .with_state(state);

    if let Some(handle) = prometheus {
        app = app.route(
            "/metrics/prometheus",
            get(metrics::prometheus_metrics).with_state(handle),
        );
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
}

/// GET / — service descriptor.
async fn service_info() -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "operations": Operation::names(),
        "endpoints": {
            "upload": "POST /upload",
            "status": "GET /status/{job_id}",
            "update": "POST /jobs/update",
            "metrics": "GET /metrics",
            "dlq_stats": "GET /dlq/stats",
            "health": "GET /health",
        },
    }))
}
