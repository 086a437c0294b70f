//! PostgreSQL implementation of [`DownsampleStore`].

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{BucketKey, DownsampleStore, RawRow};
use crate::config::WatermarkSource;
use crate::models::{parse_timestamp, DownsampledPoint};

// ---

/// Downsample storage over the shared connection pool.
#[derive(Debug, Clone)]
pub struct PgDownsampleStore {
    pool: PgPool,
}

impl PgDownsampleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// A carried-forward value only replaces another carried-forward value.
const MERGE_POINT_SQL: &str = r#"
    INSERT INTO downsampled_sunlight (
        observation_minute, sensor_id, sensor_set_id,
        smoothed_light_intensity, is_filled, last_updated
    ) VALUES ($1, $2, $3, $4, $5, now())
    ON CONFLICT (sensor_id, observation_minute) DO UPDATE SET
        sensor_set_id = EXCLUDED.sensor_set_id,
        smoothed_light_intensity = EXCLUDED.smoothed_light_intensity,
        is_filled = EXCLUDED.is_filled,
        last_updated = EXCLUDED.last_updated
    WHERE downsampled_sunlight.is_filled OR NOT EXCLUDED.is_filled
"#;

/// Refuses to move the watermark backwards when runs overlap.
const ADVANCE_WATERMARK_SQL: &str = r#"
    INSERT INTO pipeline_watermark (
        pipeline_id, last_processed_timestamp, rows_processed_in_last_run,
        last_run_id, updated_at
    ) VALUES ($1, $2, $3, $4, now())
    ON CONFLICT (pipeline_id) DO UPDATE SET
        last_processed_timestamp = EXCLUDED.last_processed_timestamp,
        rows_processed_in_last_run = EXCLUDED.rows_processed_in_last_run,
        last_run_id = EXCLUDED.last_run_id,
        updated_at = EXCLUDED.updated_at
    WHERE pipeline_watermark.last_processed_timestamp::timestamptz
          <= EXCLUDED.last_processed_timestamp::timestamptz
"#;

/// Format a watermark for the `last_processed_timestamp` text column.
/// Microseconds match the precision of `TIMESTAMPTZ`.
pub fn format_watermark(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl DownsampleStore for PgDownsampleStore {
    async fn read_watermark(&self, pipeline_id: &str) -> Result<Option<DateTime<Utc>>> {
        // ---
        let stored: Option<String> = sqlx::query_scalar(
            r#"
            SELECT last_processed_timestamp
            FROM pipeline_watermark
            WHERE pipeline_id = $1
            "#,
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await
        .context("reading watermark")?;

        stored
            .map(|raw| {
                parse_timestamp(&raw)
                    .ok_or_else(|| anyhow!("stored watermark '{}' is not an ISO-8601 instant", raw))
            })
            .transpose()
    }

    async fn fetch_new_rows(
        &self,
        source: WatermarkSource,
        after: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<RawRow>> {
        // ---
        // Column name comes from a fixed enum, never from input.
        let sql = format!(
            r#"
            SELECT sensor_id, sensor_set_id, timestamp, ingestion_time, light_intensity
            FROM raw_sensor_data
            WHERE {col} > $1
              AND ($2::TIMESTAMPTZ IS NULL OR {col} <= $2)
            ORDER BY {col} ASC, sensor_id ASC, timestamp ASC
            LIMIT $3
            "#,
            col = source.column()
        );

        let rows = sqlx::query_as::<_, RawRow>(&sql)
            .bind(after)
            .bind(until)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .context("querying new raw rows")?;
        Ok(rows)
    }

    async fn fetch_rows_at(&self, source: WatermarkSource, at: DateTime<Utc>) -> Result<Vec<RawRow>> {
        // ---
        let sql = format!(
            r#"
            SELECT sensor_id, sensor_set_id, timestamp, ingestion_time, light_intensity
            FROM raw_sensor_data
            WHERE {col} = $1
            ORDER BY sensor_id ASC, timestamp ASC
            "#,
            col = source.column()
        );

        let rows = sqlx::query_as::<_, RawRow>(&sql)
            .bind(at)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("reading raw rows tied at {}", at))?;
        Ok(rows)
    }

    async fn fetch_light_readings(
        &self,
        keys: &[BucketKey],
        width: Duration,
    ) -> Result<Vec<RawRow>> {
        // ---
        let sensor_ids: Vec<String> = keys.iter().map(|k| k.sensor_id.clone()).collect();
        let starts: Vec<DateTime<Utc>> = keys.iter().map(|k| k.bucket).collect();
        let ends: Vec<DateTime<Utc>> = keys.iter().map(|k| k.bucket + width).collect();

        let rows = sqlx::query_as::<_, RawRow>(
            r#"
            SELECT r.sensor_id, r.sensor_set_id, r.timestamp, r.ingestion_time, r.light_intensity
            FROM UNNEST($1::TEXT[], $2::TIMESTAMPTZ[], $3::TIMESTAMPTZ[])
                AS k(sensor_id, bucket_start, bucket_end)
            JOIN raw_sensor_data r
              ON r.sensor_id = k.sensor_id
             AND r.timestamp >= k.bucket_start
             AND r.timestamp < k.bucket_end
            WHERE r.light_intensity IS NOT NULL
            "#,
        )
        .bind(sensor_ids)
        .bind(starts)
        .bind(ends)
        .fetch_all(&self.pool)
        .await
        .context("reading bucket contributions")?;
        Ok(rows)
    }

    async fn fetch_real_neighbours(&self, keys: &[BucketKey]) -> Result<Vec<DownsampledPoint>> {
        // ---
        let sensor_ids: Vec<String> = keys.iter().map(|k| k.sensor_id.clone()).collect();
        let buckets: Vec<DateTime<Utc>> = keys.iter().map(|k| k.bucket).collect();

        let points = sqlx::query_as::<_, DownsampledPoint>(
            r#"
            SELECT p.observation_minute, p.sensor_id, p.sensor_set_id,
                   p.smoothed_light_intensity, p.is_filled
            FROM UNNEST($1::TEXT[], $2::TIMESTAMPTZ[]) AS k(sensor_id, bucket)
            CROSS JOIN LATERAL (
                (SELECT d.observation_minute, d.sensor_id, d.sensor_set_id,
                        d.smoothed_light_intensity, d.is_filled
                 FROM downsampled_sunlight d
                 WHERE d.sensor_id = k.sensor_id
                   AND d.observation_minute < k.bucket
                   AND NOT d.is_filled
                 ORDER BY d.observation_minute DESC
                 LIMIT 1)
                UNION ALL
                (SELECT d.observation_minute, d.sensor_id, d.sensor_set_id,
                        d.smoothed_light_intensity, d.is_filled
                 FROM downsampled_sunlight d
                 WHERE d.sensor_id = k.sensor_id
                   AND d.observation_minute > k.bucket
                   AND NOT d.is_filled
                 ORDER BY d.observation_minute ASC
                 LIMIT 1)
            ) p
            "#,
        )
        .bind(sensor_ids)
        .bind(buckets)
        .fetch_all(&self.pool)
        .await
        .context("reading neighbouring real points")?;
        Ok(points)
    }

    async fn merge_points(&self, points: &[DownsampledPoint]) -> Result<u64> {
        // ---
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for p in points {
            let result = sqlx::query(MERGE_POINT_SQL)
                .bind(p.observation_minute)
                .bind(&p.sensor_id)
                .bind(&p.sensor_set_id)
                .bind(p.smoothed_light_intensity)
                .bind(p.is_filled)
                .execute(&mut *tx)
                .await
                .with_context(|| {
                    format!("merging point ({}, {})", p.sensor_id, p.observation_minute)
                })?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn advance_watermark(
        &self,
        pipeline_id: &str,
        watermark: DateTime<Utc>,
        rows_processed: u64,
        run_id: Uuid,
    ) -> Result<()> {
        // ---
        sqlx::query(ADVANCE_WATERMARK_SQL)
            .bind(pipeline_id)
            .bind(format_watermark(watermark))
            .bind(i64::try_from(rows_processed).unwrap_or(i64::MAX))
            .bind(run_id)
            .execute(&self.pool)
            .await
            .context("advancing watermark")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::config::DownsampleConfig;
    use crate::downsample::{run, RunStatus};
    use crate::models::Reading;
    use crate::raw_store;
    use crate::test_support::test_pool;
    use chrono::TimeZone;

    fn at(m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 10, m, s).unwrap()
    }

    fn reading(sensor: &str, observed: DateTime<Utc>, light: f64) -> Reading {
        // ---
        Reading {
            sensor_id: sensor.to_string(),
            sensor_set_id: Some("set-1".to_string()),
            timestamp: observed,
            light_intensity: Some(light),
            status: None,
            battery_voltage: None,
            battery_percent: None,
            wifi_dbm: None,
            chip_temp_c: None,
            chip_temp_f: None,
            commit_sha: None,
            commit_timestamp: None,
        }
    }

    fn point(m: u32, value: f64, is_filled: bool) -> DownsampledPoint {
        // ---
        DownsampledPoint {
            observation_minute: at(m, 0),
            sensor_id: "A".to_string(),
            sensor_set_id: Some("set-1".to_string()),
            smoothed_light_intensity: value,
            is_filled,
        }
    }

    #[test]
    fn test_watermark_text_round_trips_through_parser() {
        // ---
        let ts = at(3, 30) + chrono::Duration::microseconds(123_456);
        let text = format_watermark(ts);

        assert_eq!(text, "2025-01-15T10:03:30.123456Z");
        assert_eq!(parse_timestamp(&text), Some(ts));
    }

    #[test]
    fn test_upserts_carry_their_guards() {
        // ---
        assert!(MERGE_POINT_SQL.contains("ON CONFLICT (sensor_id, observation_minute) DO UPDATE"));
        assert!(MERGE_POINT_SQL.contains("WHERE downsampled_sunlight.is_filled OR NOT EXCLUDED.is_filled"));
        assert!(ADVANCE_WATERMARK_SQL.contains("WHERE pipeline_watermark.last_processed_timestamp::timestamptz"));
        assert!(ADVANCE_WATERMARK_SQL.contains("<= EXCLUDED.last_processed_timestamp::timestamptz"));
    }

    #[tokio::test]
    async fn test_engine_against_postgres() -> Result<()> {
        // ---
        let Some(pool) = test_pool("downsample").await? else {
            return Ok(());
        };
        let store = PgDownsampleStore::new(pool.clone());

        for (observed, light) in [(at(0, 10), 10.0), (at(3, 10), 30.0)] {
            raw_store::append(&pool, &reading("A", observed, light), observed + chrono::Duration::seconds(1))
                .await?;
        }
        store.merge_points(&[point(2, 77.0, false)]).await?;

        let config = DownsampleConfig {
            bucket_minutes: 1,
            gap_fill: true,
            ..DownsampleConfig::default()
        };
        let outcome = run(&store, &config).await?;
        assert_eq!(outcome.status, RunStatus::Merged);
        assert_eq!(outcome.watermark_after, at(3, 11));

        // a carried-forward value never lands on a real average
        assert_eq!(store.merge_points(&[point(2, 5.0, true)]).await?, 0);
        assert_eq!(store.merge_points(&[point(1, 11.0, true)]).await?, 1);

        let table: Vec<(DateTime<Utc>, f64, bool)> = sqlx::query_as(
            r#"
            SELECT observation_minute, smoothed_light_intensity, is_filled
            FROM downsampled_sunlight
            WHERE sensor_id = 'A'
            ORDER BY observation_minute
            "#,
        )
        .fetch_all(&pool)
        .await?;
        assert_eq!(
            table,
            vec![
                (at(0, 0), 10.0, false),
                (at(1, 0), 11.0, true),
                (at(2, 0), 77.0, false),
                (at(3, 0), 30.0, false),
            ]
        );

        store.advance_watermark(&config.pipeline_id, at(0, 0), 0, Uuid::new_v4()).await?;
        assert_eq!(store.read_watermark(&config.pipeline_id).await?, Some(at(3, 11)));

        let tied = store.fetch_rows_at(WatermarkSource::Ingestion, at(0, 11)).await?;
        assert_eq!(tied.len(), 1);
        assert_eq!(tied[0].timestamp, at(0, 10));
        Ok(())
    }
}
