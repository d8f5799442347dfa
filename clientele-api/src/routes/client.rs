//! Internal client management handlers.

use super::run_activity;
use crate::error::{ApiError, ApiResponse, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use clientele_core::{Activity, ClientFilter, ClientInput, ClientRecord};

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| ApiError::malformed_body(e.body_text()))
}

/// `POST /internal/client-upsert`
pub async fn upsert(
    State(state): State<AppState>,
    payload: Result<Json<Vec<ClientInput>>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<Vec<ClientRecord>>>> {
    let inputs = body(payload)?;
    let activity = Activity::new("http.client_upsert").with_payload(&inputs);
    let records = run_activity(activity, state.service.upsert(inputs)).await?;
    Ok(Json(ApiResponse::ok(records)))
}

/// `POST /internal/client-find`
pub async fn find(
    State(state): State<AppState>,
    payload: Result<Json<ClientFilter>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<Vec<ClientRecord>>>> {
    let filter = body(payload)?;
    let activity = Activity::new("http.client_find_by_filter").with_payload(&filter);
    let records = run_activity(activity, state.service.find_by_filter(&filter, false)).await?;
    Ok(Json(ApiResponse::ok(records)))
}

/// `DELETE /internal/client-delete`
pub async fn delete(
    State(state): State<AppState>,
    payload: Result<Json<ClientFilter>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<()>>> {
    let filter = body(payload)?;
    let activity = Activity::new("http.client_delete_by_filter").with_payload(&filter);
    run_activity(activity, state.service.delete_by_filter(&filter)).await?;
    Ok(Json(ApiResponse::done()))
}
