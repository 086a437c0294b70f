// src/routes/ingest.rs
//! Reading ingest endpoints.
//!
//! - `POST /readings`: devices post a JSON array (or single object) of
//!   readings directly, authenticated with a bearer token.
//! - `POST /pubsub/push`: Pub/Sub push subscription delivering the same
//!   payload base64-encoded inside a message envelope.
//!
//! Both paths store the batch first, then run status notifications whatever
//! the storage outcome was.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{bearer_ok, AppState};
use crate::{ingest, PipelineError};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/readings", post(post_readings))
        .route("/pubsub/push", post(pubsub_push))
}

fn is_empty_batch(payload: &Value) -> bool {
    matches!(payload, Value::Array(items) if items.is_empty())
}

/// Store a decoded payload, then notify. Shared by both endpoints.
async fn handle_payload(state: &AppState, payload: Value) -> Result<Response, PipelineError> {
    // ---
    let (summary, readings) = ingest::ingest_payload(&state.pool, payload).await?;
    state.notifier.process_batch(&readings).await;
    Ok((StatusCode::OK, Json(summary)).into_response())
}

async fn post_readings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    // ---
    if !bearer_ok(&headers, state.config.ingest_token.as_deref()) {
        warn!("POST /readings - unauthorized request");
        return (
            StatusCode::UNAUTHORIZED,
            "Unauthorized: Invalid or missing bearer token.",
        )
            .into_response();
    }
    if is_empty_batch(&payload) {
        warn!("POST /readings - empty array");
        return (StatusCode::BAD_REQUEST, "Bad Request: Empty array not allowed.").into_response();
    }

    debug!("POST /readings - processing batch");
    match handle_payload(&state, payload).await {
        Ok(resp) => resp,
        Err(e) => {
            error!("POST /readings - batch rejected: {}", e);
            e.into_response()
        }
    }
}

/// Pub/Sub treats any 2xx as an ack. Undecodable messages are acked so the
/// broker does not redeliver them forever; only fatal errors ask for retry.
async fn pubsub_push(State(state): State<AppState>, body: Bytes) -> Response {
    // ---
    let payload = match ingest::decode_pubsub_push(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(
                "Could not decode Pub/Sub message, dropping: {} - Raw body: {}",
                e,
                String::from_utf8_lossy(&body)
            );
            return StatusCode::NO_CONTENT.into_response();
        }
    };
    if is_empty_batch(&payload) {
        info!("Pub/Sub message carried an empty batch");
        return StatusCode::NO_CONTENT.into_response();
    }

    match handle_payload(&state, payload).await {
        Ok(resp) => resp,
        Err(e) if e.is_fatal() => {
            error!("Pub/Sub batch aborted: {}", e);
            e.into_response()
        }
        Err(e) => {
            error!("Pub/Sub batch dropped: {}", e);
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_batch_detection() {
        // ---
        assert!(is_empty_batch(&json!([])));
        assert!(!is_empty_batch(&json!([{}])));
        assert!(!is_empty_batch(&json!({})));
    }
}
