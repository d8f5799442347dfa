//! Liveness check reporting host resources.

use crate::resources::ResourceReport;
use crate::state::AppState;
use axum::{extract::State, Json};

/// `GET /v1/ping`
pub async fn ping(State(state): State<AppState>) -> Json<ResourceReport> {
    Json(ResourceReport::sample(state.ping_sample).await)
}
