//! Batch ingest: decode, normalize, validate, then write each reading to the
//! raw store and the latest-reading cache.
//!
//! Failures are scoped as narrowly as possible: an undecodable payload drops
//! the batch, an invalid item is skipped, and a storage error on one item is
//! logged and counted without stopping the rest. Only a malformed cache
//! statement aborts the batch.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;

use crate::error::PipelineError;
use crate::latest_reading::{self, LatestUpdate};
use crate::models::{IncomingReading, Reading};
use crate::raw_store;

// ---

/// Per-batch counters returned to the caller.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    // ---
    pub received: usize,
    pub accepted: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Normalize a payload into a list of items: an array is used as-is, a single
/// object becomes a one-element batch, anything else is rejected.
pub fn normalize_batch(payload: Value) -> Result<Vec<Value>, PipelineError> {
    // ---
    match payload {
        Value::Array(items) => Ok(items),
        Value::Object(_) => {
            tracing::warn!("received non-list payload, converting to list");
            Ok(vec![payload])
        }
        other => Err(PipelineError::Decode(format!(
            "payload must be a list of readings or a single object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    data: String,
    #[serde(default, rename = "messageId")]
    message_id: Option<String>,
}

/// Unwrap a Pub/Sub push envelope (`{"message": {"data": "<base64 JSON>"}}`).
pub fn decode_pubsub_push(body: &[u8]) -> Result<Value, PipelineError> {
    // ---
    let envelope: PushEnvelope = serde_json::from_slice(body)
        .map_err(|e| PipelineError::Decode(format!("invalid push envelope: {}", e)))?;

    let bytes = STANDARD
        .decode(envelope.message.data.trim())
        .map_err(|e| PipelineError::Decode(format!("message data is not base64: {}", e)))?;

    tracing::debug!(
        message_id = envelope.message.message_id.as_deref().unwrap_or("-"),
        bytes = bytes.len(),
        "decoded push message"
    );

    serde_json::from_slice(&bytes)
        .map_err(|e| PipelineError::Decode(format!("message data is not JSON: {}", e)))
}

/// Validate each item, skipping (and logging) the ones that cannot be used.
pub fn validate_items(items: Vec<Value>) -> (Vec<Reading>, usize) {
    // ---
    let mut readings = Vec::with_capacity(items.len());
    let mut skipped = 0;

    for (i, item) in items.into_iter().enumerate() {
        if !item.is_object() {
            tracing::warn!("Skipping non-object reading {}: {}", i, item);
            skipped += 1;
            continue;
        }
        let parsed = serde_json::from_value::<IncomingReading>(item.clone())
            .map_err(|e| PipelineError::InvalidField {
                field: "reading",
                reason: e.to_string(),
            })
            .and_then(Reading::try_from);

        match parsed {
            Ok(reading) => readings.push(reading),
            Err(e) => {
                tracing::warn!("Skipping reading {}: {} - Raw item: {}", i, e, item);
                skipped += 1;
            }
        }
    }

    (readings, skipped)
}

/// Write validated readings to the raw store and the latest-reading cache.
///
/// The two writes are independent: a failure in one does not prevent the
/// other. Returns `Err` only for fatal errors.
pub async fn store_readings(
    pool: &PgPool,
    readings: &[Reading],
) -> Result<(usize, usize), PipelineError> {
    // ---
    let mut accepted = 0;
    let mut errors = 0;

    for reading in readings {
        // May be older than the commit by up to the pool acquire timeout.
        let ingestion_time = Utc::now();
        let mut ok = true;

        if let Err(e) = raw_store::append(pool, reading, ingestion_time).await {
            tracing::error!(
                sensor_id = %reading.sensor_id,
                "Failed to insert raw reading: {}. Reading: {:?}",
                e,
                reading
            );
            ok = false;
        }

        let cache_result = match LatestUpdate::from_reading(reading, ingestion_time) {
            Ok(update) => latest_reading::apply(pool, &update).await,
            Err(e) => Err(e),
        };
        if let Err(e) = cache_result {
            if e.is_fatal() {
                tracing::error!(
                    sensor_id = %reading.sensor_id,
                    "Aborting batch, latest-reading statement is malformed: {}",
                    e
                );
                return Err(e);
            }
            tracing::error!(
                sensor_id = %reading.sensor_id,
                "Failed to update latest reading: {}. Reading: {:?}",
                e,
                reading
            );
            ok = false;
        }

        if ok {
            accepted += 1;
        } else {
            errors += 1;
        }
    }

    Ok((accepted, errors))
}

/// Full ingest of an already-decoded payload.
pub async fn ingest_payload(
    pool: &PgPool,
    payload: Value,
) -> Result<(IngestSummary, Vec<Reading>), PipelineError> {
    // ---
    let items = normalize_batch(payload)?;
    let received = items.len();
    let (readings, skipped) = validate_items(items);
    let (accepted, errors) = store_readings(pool, &readings).await?;

    let summary = IngestSummary {
        received,
        accepted,
        skipped,
        errors,
    };
    tracing::info!(
        received = summary.received,
        accepted = summary.accepted,
        skipped = summary.skipped,
        errors = summary.errors,
        "ingest batch complete"
    );
    Ok((summary, readings))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_object_becomes_batch() {
        // ---
        let items = normalize_batch(json!({"sensor_id": "x"})).unwrap();
        assert_eq!(items.len(), 1);

        let items = normalize_batch(json!([{"sensor_id": "x"}, {"sensor_id": "y"}])).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_scalar_payload_is_a_decode_error() {
        // ---
        let err = normalize_batch(json!("hello")).unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn test_invalid_items_are_skipped_not_fatal() {
        // ---
        let items = vec![
            json!({"sensor_id": "A", "timestamp": "2025-01-15T10:00:55Z", "light_intensity": 999.0}),
            json!({"timestamp": "2025-01-15T10:01:00Z", "light_intensity": 5.0}),
            json!({"sensor_id": "A", "light_intensity": 5.0}),
            json!({"sensor_id": "A", "timestamp": "2025-01-15T10:02:00Z", "light_intensity": "bright"}),
            json!(42),
            json!({"sensor_id": "B", "timestamp": "2025-01-15T10:00:30+00:00", "status": "[boot] ok"}),
        ];
        let (readings, skipped) = validate_items(items);

        assert_eq!(skipped, 4);
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].sensor_id, "A");
        assert_eq!(readings[1].status.as_deref(), Some("[boot] ok"));
    }

    #[test]
    fn test_decodes_pubsub_push_envelope() {
        // ---
        let data = STANDARD.encode(r#"[{"sensor_id":"x","timestamp":"2025-01-15T10:00:00Z"}]"#);
        let body = json!({
            "message": {"data": data, "messageId": "123"},
            "subscription": "projects/p/subscriptions/s"
        })
        .to_string();

        let payload = decode_pubsub_push(body.as_bytes()).unwrap();
        assert_eq!(payload[0]["sensor_id"], "x");
    }

    #[test]
    fn test_bad_push_envelopes_are_decode_errors() {
        // ---
        for body in [
            r#"{"nope": true}"#.to_string(),
            json!({"message": {"data": "%%%"}}).to_string(),
            json!({"message": {"data": STANDARD.encode("not json")}}).to_string(),
        ] {
            let err = decode_pubsub_push(body.as_bytes()).unwrap_err();
            assert!(matches!(err, PipelineError::Decode(_)), "{}", body);
        }
    }
}
