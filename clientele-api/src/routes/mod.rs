//! HTTP routes.
//!
//! - `POST /internal/client-upsert`, `POST /internal/client-find`,
//!   `DELETE /internal/client-delete` behind the internal key
//! - `GET /v1/ping` behind client bearer keys

pub mod client;
pub mod ping;

use crate::error::ApiResult;
use crate::middleware::{client_auth, internal_auth};
use crate::state::AppState;
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use clientele_core::{Activity, ClienteleResult};
use serde::Serialize;
use std::future::Future;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

/// Build the full router over `state`.
pub fn create_router(state: AppState) -> Router {
    let internal = Router::new()
        .route("/client-upsert", post(client::upsert))
        .route("/client-find", post(client::find))
        .route("/client-delete", delete(client::delete))
        .route_layer(middleware::from_fn_with_state(state.clone(), internal_auth));

    let v1 = Router::new()
        .route("/ping", get(ping::ping))
        .route_layer(middleware::from_fn_with_state(state.clone(), client_auth));

    Router::new()
        .nest("/internal", internal)
        .nest("/v1", v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run `work` inside the activity's span and log the outcome.
pub(crate) async fn run_activity<T, F>(mut activity: Activity, work: F) -> ApiResult<T>
where
    T: Serialize,
    F: Future<Output = ClienteleResult<T>>,
{
    let span = activity.span();
    match work.instrument(span).await {
        Ok(value) => {
            activity.set_result(&value);
            activity.log_completed();
            Ok(value)
        }
        Err(e) => {
            activity.log_failed(&e);
            Err(e.into())
        }
    }
}
