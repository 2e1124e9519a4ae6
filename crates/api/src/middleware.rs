use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use portal_core::OwnerId;

use crate::app::errors::json_error;
use crate::context::PrincipalContext;

/// Header carrying the verified principal id (UUID).
pub const PRINCIPAL_ID_HEADER: &str = "x-principal-id";
/// Optional comma-separated role list.
pub const PRINCIPAL_ROLES_HEADER: &str = "x-principal-roles";

/// Attach a [`PrincipalContext`] built from the gateway's identity headers.
pub async fn principal_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let principal = match extract_principal(req.headers()) {
        Ok(principal) => principal,
        Err(message) => return json_error(StatusCode::UNAUTHORIZED, "unauthorized", message),
    };

    req.extensions_mut().insert(principal);
    next.run(req).await
}

fn extract_principal(headers: &HeaderMap) -> Result<PrincipalContext, &'static str> {
    let raw = headers
        .get(PRINCIPAL_ID_HEADER)
        .ok_or("missing principal")?
        .to_str()
        .map_err(|_| "invalid principal header")?;

    let principal_id: OwnerId = raw.trim().parse().map_err(|_| "invalid principal id")?;

    let roles = match headers.get(PRINCIPAL_ROLES_HEADER) {
        Some(value) => value
            .to_str()
            .map_err(|_| "invalid roles header")?
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    };

    Ok(PrincipalContext::new(principal_id, roles))
}
