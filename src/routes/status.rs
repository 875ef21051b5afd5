use axum::extract::{Path, State};
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::models::api::{StatusUpdateRequest, StatusUpdateResponse};
use crate::models::job::JobStatusRecord;
use crate::routes::error::ApiError;

/// GET /status/{job_id}
pub async fn get_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusRecord>, ApiError> {
    Ok(Json(state.status.get(&job_id).await?))
}

/// POST /jobs/update — status callback used by a standalone notifier.
pub async fn update_status(
    State(state): State<AppState>,
    Json(request): Json<StatusUpdateRequest>,
) -> Result<Json<StatusUpdateResponse>, ApiError> {
    request
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let transition = state
        .status
        .advance(&request.job_id, request.status, request.result)
        .await?;

    tracing::info!(
        job_id = %request.job_id,
        previous = %transition.previous,
        current = %transition.current,
        "Status callback applied"
    );
    let message = if transition.changed() {
        "Status updated"
    } else {
        "Status unchanged"
    };
    Ok(Json(StatusUpdateResponse {
        message: message.to_string(),
        previous: transition.previous,
        current: transition.current,
    }))
}
