use axum::{routing::get, Router};

pub mod admin;
pub mod jobs;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/jobs", jobs::router())
        .nest("/admin", admin::router())
}
