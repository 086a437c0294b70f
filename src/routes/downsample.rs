// src/routes/downsample.rs
//! `POST /downsample/run`: trigger one downsample/merge run.
//!
//! Intended for a scheduler. Overlapping or repeated calls are safe; each
//! returns the outcome of its own run.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tracing::error;

use super::{bearer_ok, AppState};
use crate::downsample::{self, PgDownsampleStore};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/downsample/run", post(handler))
}

async fn handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    // ---
    if !bearer_ok(&headers, state.config.ingest_token.as_deref()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let store = PgDownsampleStore::new(state.pool.clone());
    match downsample::run(&store, &state.config.downsample).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => {
            error!("Downsample run failed: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json("Downsample run failed")).into_response()
        }
    }
}
