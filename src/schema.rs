//! Database schema management for `sunlight-pipeline`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates the append-only `raw_sensor_data` log, the `sensor_latest_reading`
/// cache, the `downsampled_sunlight` series and the `pipeline_watermark`
/// checkpoint table. Safe to call on every startup; no-op if objects already
/// exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Every reading, appended once per (sensor_id, timestamp)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_sensor_data (
            sensor_id         TEXT             NOT NULL,
            sensor_set_id     TEXT,
            timestamp         TIMESTAMPTZ      NOT NULL,
            ingestion_time    TIMESTAMPTZ      NOT NULL,
            light_intensity   DOUBLE PRECISION,
            status            TEXT,
            battery_voltage   DOUBLE PRECISION,
            battery_percent   DOUBLE PRECISION,
            wifi_dbm          INTEGER,
            chip_temp_c       DOUBLE PRECISION,
            chip_temp_f       DOUBLE PRECISION,
            commit_sha        TEXT,
            commit_timestamp  TIMESTAMPTZ,
            PRIMARY KEY (sensor_id, timestamp)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Sparse "current state" per sensor; each metric carries its own timestamp
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_latest_reading (
            sensor_id                   TEXT PRIMARY KEY,
            sensor_set_id               TEXT,
            last_seen                   TIMESTAMPTZ,
            timestamp                   TIMESTAMPTZ,
            light_intensity             DOUBLE PRECISION,
            light_intensity_timestamp   TIMESTAMPTZ,
            status                      TEXT,
            status_timestamp            TIMESTAMPTZ,
            battery_voltage             DOUBLE PRECISION,
            battery_voltage_timestamp   TIMESTAMPTZ,
            battery_percent             DOUBLE PRECISION,
            battery_percent_timestamp   TIMESTAMPTZ,
            wifi_dbm                    INTEGER,
            wifi_dbm_timestamp          TIMESTAMPTZ,
            chip_temp_c                 DOUBLE PRECISION,
            chip_temp_c_timestamp       TIMESTAMPTZ,
            chip_temp_f                 DOUBLE PRECISION,
            chip_temp_f_timestamp       TIMESTAMPTZ,
            commit_sha                  TEXT,
            commit_sha_timestamp        TIMESTAMPTZ,
            commit_timestamp            TIMESTAMPTZ,
            commit_timestamp_timestamp  TIMESTAMPTZ
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Smoothed series written by the downsample engine
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS downsampled_sunlight (
            observation_minute        TIMESTAMPTZ      NOT NULL,
            sensor_id                 TEXT             NOT NULL,
            sensor_set_id             TEXT,
            smoothed_light_intensity  DOUBLE PRECISION NOT NULL,
            is_filled                 BOOLEAN          NOT NULL DEFAULT FALSE,
            last_updated              TIMESTAMPTZ      NOT NULL,
            PRIMARY KEY (sensor_id, observation_minute)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_watermark (
            pipeline_id                 TEXT PRIMARY KEY,
            last_processed_timestamp    TEXT        NOT NULL,
            rows_processed_in_last_run  BIGINT      NOT NULL,
            last_run_id                 UUID,
            updated_at                  TIMESTAMPTZ NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Watermark scans, one per supported source column
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_raw_sensor_data_ingestion_time
            ON raw_sensor_data (ingestion_time);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_raw_sensor_data_timestamp
            ON raw_sensor_data (timestamp);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sensor_latest_reading_set
            ON sensor_latest_reading (sensor_set_id);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
