//! Downsample/merge engine.
//!
//! One run reads raw rows newer than the stored watermark, re-averages every
//! bucket those rows touch, optionally carries values forward into empty
//! buckets, upserts the result into `downsampled_sunlight`, and only then
//! advances the watermark to the largest source timestamp it read.
//!
//! Runs are triggered externally and are safe to repeat or overlap: a bucket's
//! value depends only on the raw rows in it, so every merge is idempotent and
//! an unadvanced watermark simply causes the same window to be redone.

use std::future::Future;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{DownsampleConfig, WatermarkSource};
use crate::models::DownsampledPoint;

mod aggregate;
mod gap_fill;
mod store;

pub use aggregate::BucketKey;
pub use store::PgDownsampleStore;

// ---

/// The slice of a raw row the engine needs.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct RawRow {
    // ---
    pub sensor_id: String,
    pub sensor_set_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub ingestion_time: DateTime<Utc>,
    pub light_intensity: Option<f64>,
}

impl RawRow {
    pub fn source_timestamp(&self, source: WatermarkSource) -> DateTime<Utc> {
        // ---
        match source {
            WatermarkSource::Ingestion => self.ingestion_time,
            WatermarkSource::Observation => self.timestamp,
        }
    }
}

/// Storage seen by the engine. Implemented over Postgres by
/// [`PgDownsampleStore`].
pub trait DownsampleStore {
    /// Stored watermark for `pipeline_id`, if one was ever written.
    fn read_watermark(
        &self,
        pipeline_id: &str,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send;

    /// Raw rows whose `source` timestamp is strictly after `after` and, when
    /// given, no later than `until`. Ascending by that timestamp, at most
    /// `limit`.
    fn fetch_new_rows(
        &self,
        source: WatermarkSource,
        after: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<RawRow>>> + Send;

    /// Every raw row whose `source` timestamp equals `at`, without a limit.
    fn fetch_rows_at(
        &self,
        source: WatermarkSource,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<RawRow>>> + Send;

    /// Raw rows with a light value observed inside one of `keys`, each key
    /// spanning `[bucket, bucket + width)`.
    fn fetch_light_readings(
        &self,
        keys: &[BucketKey],
        width: chrono::Duration,
    ) -> impl Future<Output = Result<Vec<RawRow>>> + Send;

    /// For each key, the sensor's nearest stored real point strictly before
    /// and strictly after the key's bucket.
    fn fetch_real_neighbours(
        &self,
        keys: &[BucketKey],
    ) -> impl Future<Output = Result<Vec<DownsampledPoint>>> + Send;

    /// Upsert points keyed by (sensor_id, observation_minute). A filled point
    /// never replaces a real one. Returns the number of rows written.
    fn merge_points(&self, points: &[DownsampledPoint]) -> impl Future<Output = Result<u64>> + Send;

    /// Record a completed run. Must not move the watermark backwards.
    fn advance_watermark(
        &self,
        pipeline_id: &str,
        watermark: DateTime<Utc>,
        rows_processed: u64,
        run_id: Uuid,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NoData,
    Merged,
}

/// Summary of one run, logged and returned to the trigger.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    // ---
    pub run_id: Uuid,
    pub status: RunStatus,
    pub rows_read: usize,
    pub points_merged: u64,
    pub points_filled: usize,
    pub watermark_before: DateTime<Utc>,
    pub watermark_after: DateTime<Utc>,
}

/// Execute one downsample run.
///
/// Errors before the merge leave every table untouched. A merge error leaves
/// the watermark where it was so the next run redoes the window.
pub async fn run<S: DownsampleStore>(store: &S, config: &DownsampleConfig) -> Result<RunOutcome> {
    run_at(store, config, Utc::now()).await
}

/// [`run`] with an explicit clock for the settle window.
pub async fn run_at<S: DownsampleStore>(
    store: &S,
    config: &DownsampleConfig,
    now: DateTime<Utc>,
) -> Result<RunOutcome> {
    // ---
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("downsample", %run_id, pipeline = %config.pipeline_id);
    run_inner(store, config, run_id, now).instrument(span).await
}

async fn run_inner<S: DownsampleStore>(
    store: &S,
    config: &DownsampleConfig,
    run_id: Uuid,
    now: DateTime<Utc>,
) -> Result<RunOutcome> {
    // ---
    let width = config.bucket_width();
    let source = config.watermark_source;
    let limit = config.row_limit as usize;

    // Only this service stamps ingestion time, and it may commit late.
    let until = match source {
        WatermarkSource::Ingestion => Some(now - config.settle()),
        WatermarkSource::Observation => None,
    };

    // READ_WATERMARK
    let before = store
        .read_watermark(&config.pipeline_id)
        .await?
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    tracing::debug!(watermark = %before, until = ?until, "read watermark");

    // QUERY_NEW_DATA
    let rows = store.fetch_new_rows(source, before, until, config.row_limit).await?;
    if rows.is_empty() {
        tracing::info!("no new raw rows since {}", before);
        return Ok(RunOutcome {
            run_id,
            status: RunStatus::NoData,
            rows_read: 0,
            points_merged: 0,
            points_filled: 0,
            watermark_before: before,
            watermark_after: before,
        });
    }
    let rows = match aggregate::single_timestamp_batch(&rows, source, limit) {
        Some(at) => {
            let tie = store.fetch_rows_at(source, at).await?;
            tracing::debug!(rows = tie.len(), boundary = %at, "reading whole tie set past the row limit");
            tie
        }
        None => aggregate::defer_boundary_ties(rows, source, limit),
    };
    let batch_max = rows
        .iter()
        .map(|r| r.source_timestamp(source))
        .max()
        .unwrap_or(before);

    // AGGREGATE
    let keys = aggregate::affected_keys(&rows, width);
    let mut points = Vec::new();
    let mut points_filled = 0;

    if keys.is_empty() {
        tracing::debug!("batch carries no light readings");
    } else {
        let key_list: Vec<BucketKey> = keys.iter().cloned().collect();
        let contributions = store.fetch_light_readings(&key_list, width).await?;
        points = aggregate::aggregate(&contributions, &keys, width);

        if config.gap_fill {
            let neighbours = store.fetch_real_neighbours(&key_list).await?;
            let filled = gap_fill::fill(&points, &neighbours, width);
            points_filled = filled.len();
            points.extend(filled);
        }
    }

    // MERGE
    let points_merged = if points.is_empty() {
        0
    } else {
        store.merge_points(&points).await?
    };

    // ADVANCE_WATERMARK
    let after = batch_max.max(before);
    store
        .advance_watermark(&config.pipeline_id, after, rows.len() as u64, run_id)
        .await?;

    tracing::info!(
        rows_read = rows.len(),
        points_merged,
        points_filled,
        watermark_before = %before,
        watermark_after = %after,
        "downsample run complete"
    );

    Ok(RunOutcome {
        run_id,
        status: RunStatus::Merged,
        rows_read: rows.len(),
        points_merged,
        points_filled,
        watermark_before: before,
        watermark_after: after,
    })
}
