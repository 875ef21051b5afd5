use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::app_state::AppState;
use crate::models::api::{DlqStats, JobCounts, PipelineMetrics, QueueDepth, QueueDepths};
use crate::routes::error::ApiError;

/// GET /metrics — queue depths and job counts by status.
pub async fn pipeline_metrics(
    State(state): State<AppState>,
) -> Result<Json<PipelineMetrics>, ApiError> {
    let topology = &state.topology;
    let (task, notifications, dlq, reconciled) = tokio::try_join!(
        state.broker.depth(&topology.task_queue),
        state.broker.depth(&topology.notification_queue),
        state.broker.depth(&topology.dead_letter_queue),
        state.broker.depth(&topology.reconciled_queue),
    )?;
    let by_status = state.status.summary().await?;

    Ok(Json(PipelineMetrics {
        timestamp: Utc::now(),
        queues: QueueDepths {
            task_queue: QueueDepth {
                name: topology.task_queue.clone(),
                messages: task,
            },
            notification_queue: QueueDepth {
                name: topology.notification_queue.clone(),
                messages: notifications,
            },
            dlq: QueueDepth {
                name: topology.dead_letter_queue.clone(),
                messages: dlq,
            },
            reconciled: QueueDepth {
                name: topology.reconciled_queue.clone(),
                messages: reconciled,
            },
        },
        jobs: JobCounts {
            total: by_status.values().sum(),
            by_status,
        },
    }))
}

/// GET /dlq/stats
pub async fn dlq_stats(State(state): State<AppState>) -> Result<Json<DlqStats>, ApiError> {
    let topology = &state.topology;
    let (failed_messages, reconciled_messages) = tokio::try_join!(
        state.broker.depth(&topology.dead_letter_queue),
        state.broker.depth(&topology.reconciled_queue),
    )?;
    Ok(Json(DlqStats {
        dlq: topology.dead_letter_queue.clone(),
        failed_messages,
        reconciled_messages,
        timestamp: Utc::now(),
    }))
}

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
