//! Append-only log of every reading, keyed by (sensor_id, timestamp).

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::Reading;

// ---

/// Append one reading. Redelivery of an already stored (sensor_id, timestamp)
/// is ignored, so the first copy and its `ingestion_time` are kept.
///
/// Returns `true` when a new row was written.
pub async fn append(
    pool: &PgPool,
    reading: &Reading,
    ingestion_time: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    // ---
    let result = sqlx::query(
        r#"
        INSERT INTO raw_sensor_data (
            sensor_id, sensor_set_id, timestamp, ingestion_time,
            light_intensity, status, battery_voltage, battery_percent, wifi_dbm,
            chip_temp_c, chip_temp_f, commit_sha, commit_timestamp
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (sensor_id, timestamp) DO NOTHING
        "#,
    )
    .bind(&reading.sensor_id)
    .bind(&reading.sensor_set_id)
    .bind(reading.timestamp)
    .bind(ingestion_time)
    .bind(reading.light_intensity)
    .bind(&reading.status)
    .bind(reading.battery_voltage)
    .bind(reading.battery_percent)
    .bind(reading.wifi_dbm)
    .bind(reading.chip_temp_c)
    .bind(reading.chip_temp_f)
    .bind(&reading.commit_sha)
    .bind(reading.commit_timestamp)
    .execute(pool)
    .await?;

    let inserted = result.rows_affected() > 0;
    if !inserted {
        tracing::debug!(
            sensor_id = %reading.sensor_id,
            timestamp = %reading.timestamp,
            "duplicate raw reading ignored"
        );
    }
    Ok(inserted)
}
