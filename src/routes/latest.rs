use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tracing::{error, info};

use super::AppState;
use crate::latest_reading;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/latest-readings", get(handler))
}

/// Query parameters for `GET /latest-readings`
#[derive(Debug, Deserialize)]
struct LatestQuery {
    sensor_set_id: Option<String>,
}

async fn handler(Query(params): Query<LatestQuery>, State(state): State<AppState>) -> Response {
    // ---
    let set_id = params.sensor_set_id.as_deref().filter(|s| !s.is_empty());

    match latest_reading::fetch_latest(&state.pool, set_id).await {
        Ok(rows) => {
            info!("GET /latest-readings - returning {} sensors", rows.len());
            (StatusCode::OK, Json(rows)).into_response()
        }
        Err(e) => {
            error!("Failed to fetch latest readings: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json("Failed to fetch latest readings"),
            )
                .into_response()
        }
    }
}
