//! Bucketing and averaging of raw light readings.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};

use super::RawRow;
use crate::config::WatermarkSource;
use crate::models::DownsampledPoint;

// ---

/// (sensor_id, bucket start): the key of a downsampled row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    pub sensor_id: String,
    pub bucket: DateTime<Utc>,
}

/// Floor `ts` to a multiple of `width` since the Unix epoch.
pub fn bucket_start(ts: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    // ---
    let width_secs = width.num_seconds().max(1);
    let offset = ts.timestamp().rem_euclid(width_secs);
    ts - Duration::seconds(offset) - Duration::nanoseconds(i64::from(ts.timestamp_subsec_nanos()))
}

/// Buckets touched by light readings in `rows`. Status-only rows touch none.
pub fn affected_keys(rows: &[RawRow], width: Duration) -> BTreeSet<BucketKey> {
    // ---
    rows.iter()
        .filter(|r| r.light_intensity.is_some())
        .map(|r| BucketKey {
            sensor_id: r.sensor_id.clone(),
            bucket: bucket_start(r.timestamp, width),
        })
        .collect()
}

#[derive(Default)]
struct Accumulator {
    sum: f64,
    count: u32,
    latest: Option<DateTime<Utc>>,
    sensor_set_id: Option<String>,
}

/// Average every light reading that falls in one of `keys`.
///
/// `sensor_set_id` is taken from the most recent contributing reading.
/// Keys with no contributing reading produce no point.
pub fn aggregate(
    readings: &[RawRow],
    keys: &BTreeSet<BucketKey>,
    width: Duration,
) -> Vec<DownsampledPoint> {
    // ---
    let mut groups: BTreeMap<BucketKey, Accumulator> = BTreeMap::new();

    for r in readings {
        let Some(value) = r.light_intensity else {
            continue;
        };
        let key = BucketKey {
            sensor_id: r.sensor_id.clone(),
            bucket: bucket_start(r.timestamp, width),
        };
        if !keys.contains(&key) {
            continue;
        }

        let acc = groups.entry(key).or_default();
        acc.sum += value;
        acc.count += 1;
        if acc.latest.map_or(true, |t| r.timestamp >= t) {
            acc.latest = Some(r.timestamp);
            if r.sensor_set_id.is_some() {
                acc.sensor_set_id = r.sensor_set_id.clone();
            }
        }
    }

    groups
        .into_iter()
        .map(|(key, acc)| DownsampledPoint {
            observation_minute: key.bucket,
            sensor_id: key.sensor_id,
            sensor_set_id: acc.sensor_set_id,
            smoothed_light_intensity: acc.sum / f64::from(acc.count),
            is_filled: false,
        })
        .collect()
}

/// Drop a trailing run of rows that share the batch's maximum source
/// timestamp when the batch hit `limit`, so rows with that same timestamp
/// still waiting beyond the limit are not skipped by a strict `>` watermark.
///
/// Rows must be in ascending source-timestamp order. A batch made up entirely
/// of one timestamp is returned unchanged; see [`single_timestamp_batch`].
pub fn defer_boundary_ties(mut rows: Vec<RawRow>, source: WatermarkSource, limit: usize) -> Vec<RawRow> {
    // ---
    if rows.len() < limit {
        return rows;
    }
    let Some(max) = rows.last().map(|r| r.source_timestamp(source)) else {
        return rows;
    };
    let cut = rows
        .iter()
        .position(|r| r.source_timestamp(source) == max)
        .unwrap_or(rows.len());
    if cut > 0 {
        tracing::debug!(
            deferred = rows.len() - cut,
            boundary = %max,
            "deferring rows that share the batch boundary timestamp"
        );
        rows.truncate(cut);
    }
    rows
}

/// The shared timestamp of a batch that hit `limit` with every row carrying
/// the same source timestamp. More rows with that timestamp may exist past
/// the limit, so the caller must read the whole tie set before advancing.
pub fn single_timestamp_batch(
    rows: &[RawRow],
    source: WatermarkSource,
    limit: usize,
) -> Option<DateTime<Utc>> {
    // ---
    if rows.len() < limit {
        return None;
    }
    let first = rows.first()?.source_timestamp(source);
    rows.iter()
        .all(|r| r.source_timestamp(source) == first)
        .then_some(first)
}
