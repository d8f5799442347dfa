//! Axum Middleware for Authentication
//!
//! - `/internal/*`: `Authorization: Bearer <INTERNAL_KEY>`, compared in
//!   constant time.
//! - `/v1/*`: the bearer token must belong to a client, checked through the
//!   existence resolver. A resolver failure is a 500, never a 401. With a
//!   JWT validator configured the token is verified as a JWT instead and
//!   every rejection is a 401 carrying the reason.

use crate::error::{ApiError, ErrorCode};
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use clientele_core::Activity;
use secrecy::ExposeSecret;
use tracing::Instrument;

const BEARER_PREFIX: &str = "Bearer ";

/// Token after `Bearer `, when present and non-empty.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix(BEARER_PREFIX))
        .filter(|token| !token.is_empty())
}

/// Constant-time comparison of two byte slices.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Guard for `/internal/*`.
pub async fn internal_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers()).ok_or_else(ApiError::unauthorized)?;
    let expected = state
        .internal_key
        .as_ref()
        .ok_or_else(ApiError::unauthorized)?;

    if !constant_time_eq(token.as_bytes(), expected.expose_secret().as_bytes()) {
        return Err(ApiError::unauthorized());
    }
    Ok(next.run(request).await)
}

/// Guard for `/v1/*`.
pub async fn client_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers())
        .ok_or_else(ApiError::unauthorized)?
        .to_string();

    if let Some(validator) = &state.jwt {
        let activity = Activity::new("http.client_auth_jwt");
        let span = activity.span();
        validator
            .validate(&token)
            .instrument(span)
            .await
            .map_err(|e| {
                activity.log_failed(&e);
                ApiError::new(ErrorCode::Unauthorized, format!("Unauthorized: {}", e))
            })?;
        activity.log_completed();
        return Ok(next.run(request).await);
    }

    let mut activity = Activity::new("http.client_auth");
    let span = activity.span();
    let resolution = state
        .service
        .resolve(&token)
        .instrument(span)
        .await
        .map_err(|e| {
            activity.log_failed(&e);
            ApiError::internal_error(e.root_cause())
        })?;

    if !resolution.exists() {
        return Err(ApiError::unauthorized());
    }
    if let Some(record) = resolution.record() {
        activity = activity.with_client_id(record.id.to_string());
    }
    activity.log_completed();
    Ok(next.run(request).await)
}
