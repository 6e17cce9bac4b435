use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::{error::ApiError, state::AppState};

/// Guards the admin routes with the configured bearer token, if any.
pub async fn admin_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.admin_api_token.as_deref() else {
        return Ok(next.run(req).await);
    };

    let Some(provided) = bearer_token(req.headers()) else {
        debug!(path = %req.uri().path(), "admin request without bearer token");
        return Err(ApiError::unauthorized(
            "missing or invalid Authorization header",
        ));
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        debug!(path = %req.uri().path(), "admin request with wrong token");
        return Err(ApiError::unauthorized("invalid token"));
    }

    Ok(next.run(req).await)
}

/// Token of an `Authorization: Bearer <token>` header; the scheme is
/// matched case-insensitively.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim_start();
    let (scheme, token) = value.split_at_checked(7)?;
    if !scheme.eq_ignore_ascii_case("bearer ") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
