//! Data models for the sunlight sensor pipeline.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

// ---

/// One reading exactly as a device posted it.
///
/// Every field is optional here; absent fields mean "no new information".
/// Validation into [`Reading`] enforces the required keys.
#[derive(Debug, Default, Deserialize)]
pub struct IncomingReading {
    // ---
    pub sensor_id: Option<String>,
    pub sensor_set_id: Option<String>,
    pub timestamp: Option<String>,
    pub light_intensity: Option<f64>,
    pub status: Option<String>,
    pub battery_voltage: Option<f64>,
    pub battery_percent: Option<f64>,
    pub wifi_dbm: Option<i32>,
    pub chip_temp_c: Option<f64>,
    pub chip_temp_f: Option<f64>,
    pub commit_sha: Option<String>,
    pub commit_timestamp: Option<String>,
}

/// A validated reading: `sensor_id` and `timestamp` are guaranteed present.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    // ---
    pub sensor_id: String,
    pub sensor_set_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub light_intensity: Option<f64>,
    pub status: Option<String>,
    pub battery_voltage: Option<f64>,
    pub battery_percent: Option<f64>,
    pub wifi_dbm: Option<i32>,
    pub chip_temp_c: Option<f64>,
    pub chip_temp_f: Option<f64>,
    pub commit_sha: Option<String>,
    pub commit_timestamp: Option<DateTime<Utc>>,
}

/// Parse an ISO-8601 instant. Accepts `Z`, numeric offsets such as `+00:00`,
/// and offset-less values (interpreted as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    // ---
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl TryFrom<IncomingReading> for Reading {
    type Error = PipelineError;

    fn try_from(raw: IncomingReading) -> Result<Self, Self::Error> {
        // ---
        let sensor_id = non_empty(raw.sensor_id).ok_or(PipelineError::MissingKey("sensor_id"))?;
        let raw_ts = non_empty(raw.timestamp).ok_or(PipelineError::MissingKey("timestamp"))?;
        let timestamp = parse_timestamp(&raw_ts).ok_or_else(|| PipelineError::InvalidField {
            field: "timestamp",
            reason: format!("'{}' is not an ISO-8601 instant", raw_ts),
        })?;

        let commit_timestamp = match non_empty(raw.commit_timestamp) {
            Some(v) => Some(parse_timestamp(&v).ok_or_else(|| PipelineError::InvalidField {
                field: "commit_timestamp",
                reason: format!("'{}' is not an ISO-8601 instant", v),
            })?),
            None => None,
        };

        // Older firmware only reports Celsius.
        let chip_temp_f = raw
            .chip_temp_f
            .or_else(|| raw.chip_temp_c.map(|c| (c * 9.0 / 5.0) + 32.0));

        Ok(Reading {
            sensor_id,
            sensor_set_id: non_empty(raw.sensor_set_id),
            timestamp,
            light_intensity: raw.light_intensity,
            status: raw.status,
            battery_voltage: raw.battery_voltage,
            battery_percent: raw.battery_percent,
            wifi_dbm: raw.wifi_dbm,
            chip_temp_c: raw.chip_temp_c,
            chip_temp_f,
            commit_sha: non_empty(raw.commit_sha),
            commit_timestamp,
        })
    }
}

/// Cached current state of one sensor, as served by `GET /latest-readings`.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct LatestReading {
    // ---
    pub sensor_id: String,
    pub sensor_set_id: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub timestamp: Option<DateTime<Utc>>,
    pub light_intensity: Option<f64>,
    pub light_intensity_timestamp: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub status_timestamp: Option<DateTime<Utc>>,
    pub battery_voltage: Option<f64>,
    pub battery_voltage_timestamp: Option<DateTime<Utc>>,
    pub battery_percent: Option<f64>,
    pub battery_percent_timestamp: Option<DateTime<Utc>>,
    pub wifi_dbm: Option<i32>,
    pub wifi_dbm_timestamp: Option<DateTime<Utc>>,
    pub chip_temp_c: Option<f64>,
    pub chip_temp_c_timestamp: Option<DateTime<Utc>>,
    pub chip_temp_f: Option<f64>,
    pub chip_temp_f_timestamp: Option<DateTime<Utc>>,
    pub commit_sha: Option<String>,
    pub commit_sha_timestamp: Option<DateTime<Utc>>,
    pub commit_timestamp: Option<DateTime<Utc>>,
    pub commit_timestamp_timestamp: Option<DateTime<Utc>>,
}

/// One smoothed row of the downsampled time series.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DownsampledPoint {
    // ---
    /// Bucket start, aligned to the bucket width.
    pub observation_minute: DateTime<Utc>,
    pub sensor_id: String,
    pub sensor_set_id: Option<String>,
    pub smoothed_light_intensity: f64,

    /// Carried forward from an earlier bucket rather than averaged from raw data.
    pub is_filled: bool,
}
