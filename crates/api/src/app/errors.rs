use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use portal_infra::jobs::{JobStoreError, QueueError};

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        QueueError::Forbidden(_) => {
            json_error(StatusCode::FORBIDDEN, "forbidden", "job belongs to another principal")
        }
        QueueError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        QueueError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        QueueError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    tracing::error!(error = %err, "job store error");
    match err {
        JobStoreError::AlreadyExists(_) => {
            json_error(StatusCode::CONFLICT, "conflict", err.to_string())
        }
        JobStoreError::Corrupt(_) | JobStoreError::Storage(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            "job storage unavailable",
        ),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
