//! Configuration loader for the `sunlight-pipeline` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). Nothing outside this module reads `env::var`
//! directly; the rest of the crate receives an immutable [`Config`] snapshot.
use std::{env, net::SocketAddr, str::FromStr};

use anyhow::{anyhow, Result};

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional boolean environment variable with a default value.
///
/// Accepts `1|true|yes|on` and `0|false|no|off` (case-insensitive).
macro_rules! parse_env_bool {
    ($var_name:expr, $default:expr) => {
        match env::var($var_name) {
            Ok(v) => parse_bool(&v).ok_or_else(|| anyhow!("Invalid {}: '{}'", $var_name, v))?,
            Err(_) => $default,
        }
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Read an optional string environment variable, treating blank values as unset.
fn optional_env(var_name: &str) -> Option<String> {
    // ---
    env::var(var_name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(raw: &str) -> Option<bool> {
    // ---
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Which raw-row timestamp the downsample watermark tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkSource {
    /// `ingestion_time`, stamped by this service. Tolerates out-of-order devices.
    Ingestion,
    /// The device-supplied observation `timestamp`.
    Observation,
}

impl WatermarkSource {
    /// Column of `raw_sensor_data` holding this timestamp.
    pub fn column(self) -> &'static str {
        // ---
        match self {
            WatermarkSource::Ingestion => "ingestion_time",
            WatermarkSource::Observation => "timestamp",
        }
    }
}

impl FromStr for WatermarkSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        match s.trim().to_ascii_lowercase().as_str() {
            "ingestion" | "ingestion_time" | "last_updated" => Ok(WatermarkSource::Ingestion),
            "observation" | "timestamp" => Ok(WatermarkSource::Observation),
            other => Err(anyhow!(
                "unknown watermark source '{}' (expected 'ingestion' or 'observation')",
                other
            )),
        }
    }
}

/// Settings for the downsample/merge engine.
#[derive(Debug, Clone)]
pub struct DownsampleConfig {
    // ---
    /// Key of the watermark row for this pipeline instance.
    pub pipeline_id: String,

    /// Bucket width in minutes.
    pub bucket_minutes: u32,

    /// Maximum raw rows read per run.
    pub row_limit: u32,

    /// Enable bounded last-observation-carried-forward gap filling.
    pub gap_fill: bool,

    pub watermark_source: WatermarkSource,

    /// With the ingestion source, rows stamped within this many seconds of
    /// now are left for a later run. Must exceed the pool acquire timeout so
    /// an insert stamped before waiting on the pool has committed by then.
    pub settle_secs: u32,
}

impl DownsampleConfig {
    pub fn bucket_width(&self) -> chrono::Duration {
        // ---
        chrono::Duration::minutes(i64::from(self.bucket_minutes))
    }

    pub fn settle(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.settle_secs))
    }
}

impl Default for DownsampleConfig {
    fn default() -> Self {
        // ---
        Self {
            pipeline_id: "downsample_sunlight".to_string(),
            bucket_minutes: 15,
            row_limit: 500,
            gap_fill: false,
            watermark_source: WatermarkSource::Ingestion,
            settle_secs: 60,
        }
    }
}

/// Pushover credentials and switches for status notifications.
#[derive(Debug, Clone, Default)]
pub struct PushoverConfig {
    // ---
    pub enabled: bool,
    pub app_token: Option<String>,

    /// Separate app for battery notices; falls back to `app_token`.
    pub battery_app_token: Option<String>,
    pub user_key: Option<String>,
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Seconds to wait for a pooled connection before failing.
    pub db_acquire_timeout_secs: u32,

    /// Address the HTTP server binds to.
    pub bind_addr: SocketAddr,

    /// Bearer token required on `POST /readings`; unset disables the check.
    pub ingest_token: Option<String>,

    pub downsample: DownsampleConfig,

    pub pushover: PushoverConfig,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `DB_ACQUIRE_TIMEOUT_SECS` – pool acquire timeout (default: 10)
/// - `BIND_ADDR` – listen address (default: `0.0.0.0:8080`)
/// - `INGEST_BEARER_TOKEN` – shared secret for device uploads
/// - `DOWNSAMPLE_PIPELINE_ID` – watermark key (default: `downsample_sunlight`)
/// - `DOWNSAMPLE_BUCKET_MINUTES` – bucket width (default: 15)
/// - `DOWNSAMPLE_ROW_LIMIT` – raw rows per run (default: 500)
/// - `DOWNSAMPLE_GAP_FILL` – bounded LOCF on/off (default: off)
/// - `DOWNSAMPLE_WATERMARK_SOURCE` – `ingestion` or `observation` (default: `ingestion`)
/// - `DOWNSAMPLE_SETTLE_SECS` – age a row must reach before an ingestion-time
///   run reads it (default: 60, must exceed `DB_ACQUIRE_TIMEOUT_SECS`)
/// - `ENABLE_PUSHOVER`, `PUSHOVER_APP_TOKEN`, `PUSHOVER_BATTERY_APP_TOKEN`, `PUSHOVER_USER_KEY`
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let db_acquire_timeout_secs = parse_env_u32!("DB_ACQUIRE_TIMEOUT_SECS", 10);

    let bind_addr = optional_env("BIND_ADDR")
        .unwrap_or_else(|| "0.0.0.0:8080".to_string())
        .parse::<SocketAddr>()
        .map_err(|e| anyhow!("Invalid BIND_ADDR: {}", e))?;

    let bucket_minutes = parse_env_u32!("DOWNSAMPLE_BUCKET_MINUTES", 15);
    if bucket_minutes == 0 {
        return Err(anyhow!("DOWNSAMPLE_BUCKET_MINUTES must be at least 1"));
    }
    let row_limit = parse_env_u32!("DOWNSAMPLE_ROW_LIMIT", 500);
    if row_limit == 0 {
        return Err(anyhow!("DOWNSAMPLE_ROW_LIMIT must be at least 1"));
    }

    let watermark_source = match optional_env("DOWNSAMPLE_WATERMARK_SOURCE") {
        Some(raw) => raw.parse::<WatermarkSource>()?,
        None => WatermarkSource::Ingestion,
    };

    let settle_secs = parse_env_u32!("DOWNSAMPLE_SETTLE_SECS", 60);
    validate_settle(watermark_source, settle_secs, db_acquire_timeout_secs)?;

    let downsample = DownsampleConfig {
        pipeline_id: optional_env("DOWNSAMPLE_PIPELINE_ID")
            .unwrap_or_else(|| "downsample_sunlight".to_string()),
        bucket_minutes,
        row_limit,
        gap_fill: parse_env_bool!("DOWNSAMPLE_GAP_FILL", false),
        watermark_source,
        settle_secs,
    };

    let pushover = PushoverConfig {
        enabled: parse_env_bool!("ENABLE_PUSHOVER", true),
        app_token: optional_env("PUSHOVER_APP_TOKEN"),
        battery_app_token: optional_env("PUSHOVER_BATTERY_APP_TOKEN"),
        user_key: optional_env("PUSHOVER_USER_KEY"),
    };

    Ok(Config {
        db_url,
        db_pool_max,
        db_acquire_timeout_secs,
        bind_addr,
        ingest_token: optional_env("INGEST_BEARER_TOKEN"),
        downsample,
        pushover,
    })
}

/// An ingestion-time watermark is only safe if every insert stamped before it
/// has committed, and an insert may first wait the full acquire timeout.
fn validate_settle(source: WatermarkSource, settle_secs: u32, acquire_secs: u32) -> Result<()> {
    // ---
    if source == WatermarkSource::Ingestion && settle_secs <= acquire_secs {
        return Err(anyhow!(
            "DOWNSAMPLE_SETTLE_SECS ({}) must exceed DB_ACQUIRE_TIMEOUT_SECS ({})",
            settle_secs,
            acquire_secs
        ));
    }
    Ok(())
}

/// Mask the password portion of a connection URL (`user:pass@host` → `user:****@host`).
fn mask_db_url(db_url: &str) -> String {
    // ---
    if let Some(at_pos) = db_url.rfind('@') {
        if let Some(colon_pos) = db_url[..at_pos].rfind(':') {
            return format!("{}:****{}", &db_url[..colon_pos], &db_url[at_pos..]);
        }
    }
    db_url.to_string()
}

fn presence(value: &Option<String>) -> &'static str {
    if value.is_some() {
        "set"
    } else {
        "unset"
    }
}

impl Config {
    /// Log the loaded configuration for debugging purposes.
    ///
    /// Secrets are never printed; tokens are reported only as set/unset.
    pub fn log_config(&self) {
        // ---
        let ds = &self.downsample;
        let po = &self.pushover;

        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL                : {}", mask_db_url(&self.db_url));
        tracing::info!("  DB_POOL_MAX                 : {}", self.db_pool_max);
        tracing::info!("  DB_ACQUIRE_TIMEOUT_SECS     : {}", self.db_acquire_timeout_secs);
        tracing::info!("  BIND_ADDR                   : {}", self.bind_addr);
        tracing::info!("  INGEST_BEARER_TOKEN         : {}", presence(&self.ingest_token));
        tracing::info!("  DOWNSAMPLE_PIPELINE_ID      : {}", ds.pipeline_id);
        tracing::info!("  DOWNSAMPLE_BUCKET_MINUTES   : {}", ds.bucket_minutes);
        tracing::info!("  DOWNSAMPLE_ROW_LIMIT        : {}", ds.row_limit);
        tracing::info!("  DOWNSAMPLE_GAP_FILL         : {}", ds.gap_fill);
        tracing::info!("  DOWNSAMPLE_WATERMARK_SOURCE : {:?}", ds.watermark_source);
        tracing::info!("  DOWNSAMPLE_SETTLE_SECS      : {}", ds.settle_secs);
        tracing::info!("  ENABLE_PUSHOVER             : {}", po.enabled);
        tracing::info!("  PUSHOVER_APP_TOKEN          : {}", presence(&po.app_token));
        tracing::info!("  PUSHOVER_BATTERY_APP_TOKEN  : {}", presence(&po.battery_app_token));
        tracing::info!("  PUSHOVER_USER_KEY           : {}", presence(&po.user_key));
    }
}
