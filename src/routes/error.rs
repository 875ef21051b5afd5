use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::services::intake::SubmitError;
use crate::services::queue::QueueError;
use crate::services::status::StatusError;

/// Error returned by HTTP handlers, rendered as `{"error": code, "message": text}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    UnsupportedMediaType(String),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::UnsupportedMediaType(_) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_media_type")
            }
            ApiError::Submit(SubmitError::NoValidOperations) => {
                (StatusCode::BAD_REQUEST, "no_valid_operations")
            }
            ApiError::Submit(SubmitError::Invalid(_)) => (StatusCode::BAD_REQUEST, "invalid_job"),
            ApiError::Submit(_) => (StatusCode::INTERNAL_SERVER_ERROR, "submission_failed"),
            ApiError::Status(StatusError::NotFound(_)) => (StatusCode::NOT_FOUND, "job_not_found"),
            ApiError::Status(StatusError::InvalidTransition { .. } | StatusError::Rejected { .. }) => {
                (StatusCode::CONFLICT, "invalid_transition")
            }
            ApiError::Status(_) => (StatusCode::INTERNAL_SERVER_ERROR, "status_store_error"),
            ApiError::Queue(_) => (StatusCode::SERVICE_UNAVAILABLE, "broker_unavailable"),
        }
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code, "Request failed");
        }
        json_error(status, code, self.to_string())
    }
}
