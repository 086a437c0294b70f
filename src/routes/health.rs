// src/routes/health.rs
//! Liveness and readiness endpoints for the sunlight pipeline.
//!
//! - `GET /health` answers without touching any dependency, so orchestrators
//!   can tell the process is up.
//! - `GET /health/db` additionally round-trips the connection pool and reports
//!   503 when PostgreSQL is unreachable.

use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router,
};
use serde::Serialize;

use super::AppState;

/// JSON response body for the health endpoints.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

impl HealthResponse {
    fn new(status: &'static str) -> Self {
        Self {
            status,
            service: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Handle `GET /health`.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::new("ok"))
}

/// Handle `GET /health/db`.
async fn health_db(State(state): State<AppState>) -> impl IntoResponse {
    // ---
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (StatusCode::OK, Json(HealthResponse::new("ok"))),
        Err(e) => {
            tracing::warn!("database health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse::new("database unavailable")),
            )
        }
    }
}

/// Create the health subrouter.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/db", get(health_db))
}
