//! Operator routes: manual sweep trigger and job counts.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use portal_infra::jobs::SweepRequest;

use crate::app::dto::SweepJobsRequest;
use crate::app::{errors, services::AppServices};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/jobs/sweep", post(sweep_jobs))
        .route("/jobs/stats", get(job_stats))
}

fn require_admin(principal: &PrincipalContext) -> Result<(), axum::response::Response> {
    if principal.is_admin() {
        Ok(())
    } else {
        Err(errors::json_error(
            StatusCode::FORBIDDEN,
            "forbidden",
            "admin role required",
        ))
    }
}

/// POST /admin/jobs/sweep - Run one sweep now
pub async fn sweep_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    body: Option<Json<SweepJobsRequest>>,
) -> axum::response::Response {
    if let Err(resp) = require_admin(&principal) {
        return resp;
    }

    let batch_size = body
        .and_then(|Json(b)| b.batch_size)
        .unwrap_or(services.sweep.batch_size);
    let request = SweepRequest::new(services.sweep.runner_id.clone()).with_batch_size(batch_size);

    tracing::info!(
        principal_id = %principal.principal_id(),
        batch_size,
        "manual sweep requested"
    );

    match services.runner.sweep(&request).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /admin/jobs/stats - Job counts per status
pub async fn job_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    if let Err(resp) = require_admin(&principal) {
        return resp;
    }

    match services.store.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
