//! Owner-scoped job routes.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Extension, Path, Query,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use portal_core::JobId;
use portal_infra::jobs::{EnqueueOptions, JobError, TerminalKind};

use crate::app::dto::{job_to_json, CreateJobRequest, ListJobsQuery};
use crate::app::{errors, services::AppServices};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/:id", get(get_job))
        .route("/:id/cancel", post(cancel_job))
}

/// POST /jobs - Enqueue a typed job owned by the caller
pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    body: Result<Json<CreateJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text());
        }
    };

    let command = match body.command() {
        Ok(command) => command,
        Err(JobError::Terminal {
            kind: TerminalKind::NotImplemented,
            message,
        }) => return errors::json_error(StatusCode::BAD_REQUEST, "unknown_job_type", message),
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
    };

    let mut options = EnqueueOptions::owned_by(principal.principal_id());
    options.run_at = body.run_at;
    options.max_attempts = body.max_attempts;

    let id = match services.queue.enqueue_command(&command, options).await {
        Ok(id) => id,
        Err(e) => return errors::queue_error_to_response(e),
    };

    match services.queue.get(id).await {
        Ok(Some(job)) => (StatusCode::CREATED, Json(job_to_json(&job))).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// GET /jobs - The caller's jobs, most recent first
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> axum::response::Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_query", rejection.body_text());
        }
    };

    match services
        .queue
        .list_by_owner(principal.principal_id(), query.limit)
        .await
    {
        Ok(jobs) => {
            let items: Vec<_> = jobs.iter().map(job_to_json).collect();
            (
                StatusCode::OK,
                Json(serde_json::json!({ "count": items.len(), "jobs": items })),
            )
                .into_response()
        }
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// GET /jobs/:id - One job; owners see their own, admins see any
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    match services.queue.get(id).await {
        Ok(Some(job)) if principal.is_admin() || job.owner_id == Some(principal.principal_id()) => {
            (StatusCode::OK, Json(job_to_json(&job))).into_response()
        }
        // Other principals' jobs are indistinguishable from missing ones.
        Ok(_) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /jobs/:id/cancel - Cancel a pending or running job owned by the caller
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    match services.queue.cancel(id, principal.principal_id()).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
