//! Status notifications for device events (boot, battery).
//!
//! Runs after the storage phase and independently of its outcome. Readings
//! carrying a `status` are classified and, when relevant, pushed through the
//! Pushover API; readings without one are pings and only produce a summary
//! log line per sensor.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::config::PushoverConfig;
use crate::models::Reading;

const PUSHOVER_URL: &str = "https://api.pushover.net/1/messages.json";

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Battery,
    Boot,
    Other,
}

/// Classify a device status string.
///
/// Battery reports arrive as `battery`, `[boot] battery ...` or
/// `[wake] battery ...`; any other `[boot]` message is a boot notice.
pub fn classify(status: &str) -> StatusKind {
    // ---
    if status == "battery"
        || status.starts_with("[boot] battery")
        || status.starts_with("[wake] battery")
    {
        StatusKind::Battery
    } else if status.starts_with("[boot]") {
        StatusKind::Boot
    } else {
        StatusKind::Other
    }
}

/// A push message ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    // ---
    pub sensor_id: String,
    pub kind: StatusKind,
    pub title: String,
    pub message: String,
    pub sound: &'static str,
}

fn or_na<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "N/A".to_string())
}

/// Build the notice for a status reading, or `None` when the status is not
/// one we notify on.
pub fn notice_for(reading: &Reading, status: &str) -> Option<Notice> {
    // ---
    let set_id = reading.sensor_set_id.as_deref().unwrap_or("Unknown Sensor Set");
    let kind = classify(status);

    let (title, message, sound) = match kind {
        StatusKind::Battery => {
            let volts = or_na(reading.battery_voltage);
            let percent = or_na(reading.battery_percent);
            let wifi = or_na(reading.wifi_dbm);
            (
                format!("Battery {}: {}% ({}V)", reading.sensor_id, percent, volts),
                format!(
                    "Sensor: {}\nBattery: {}V ({}%)\nWiFi: {}dBm\nSensor Set: {}",
                    reading.sensor_id, volts, percent, wifi, set_id
                ),
                "intermission",
            )
        }
        StatusKind::Boot => (
            format!("Sensor {}", reading.sensor_id),
            format!("{}\n\nSensor Set: {}", status, set_id),
            "pushover",
        ),
        StatusKind::Other => return None,
    };

    Some(Notice {
        sensor_id: reading.sensor_id.clone(),
        kind,
        title,
        message,
        sound,
    })
}

/// Notices to send plus per-(sensor_set_id, sensor_id) ping counts.
#[derive(Debug, Default)]
pub struct NotificationPlan {
    // ---
    pub notices: Vec<Notice>,
    pub skipped: usize,
    pub pings: BTreeMap<(String, String), usize>,
}

pub fn plan(readings: &[Reading]) -> NotificationPlan {
    // ---
    let mut plan = NotificationPlan::default();

    for reading in readings {
        match reading.status.as_deref() {
            Some(status) => match notice_for(reading, status) {
                Some(notice) => plan.notices.push(notice),
                None => {
                    tracing::info!(
                        sensor_id = %reading.sensor_id,
                        status = %status,
                        "non-boot status message skipped"
                    );
                    plan.skipped += 1;
                }
            },
            None => {
                let set_id = reading
                    .sensor_set_id
                    .clone()
                    .unwrap_or_else(|| "Unknown Sensor Set".to_string());
                *plan
                    .pings
                    .entry((set_id, reading.sensor_id.clone()))
                    .or_default() += 1;
            }
        }
    }

    plan
}

#[derive(Debug, Deserialize)]
struct PushoverResponse {
    status: i64,
    #[serde(default)]
    errors: Vec<String>,
}

/// Pushover delivery. Cheap to clone; holds one shared HTTP client.
#[derive(Debug, Clone)]
pub struct Notifier {
    // ---
    client: reqwest::Client,
    config: PushoverConfig,
}

impl Notifier {
    pub fn new(config: PushoverConfig) -> Self {
        // ---
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Token for a notice: battery notices prefer the battery app.
    fn token_for(&self, kind: StatusKind) -> Option<&str> {
        // ---
        let general = self.config.app_token.as_deref();
        match kind {
            StatusKind::Battery => self.config.battery_app_token.as_deref().or(general),
            _ => general,
        }
    }

    /// Send one notice. Returns `Ok(false)` when delivery is disabled or not
    /// configured.
    pub async fn send(&self, notice: &Notice) -> Result<bool> {
        // ---
        if !self.config.enabled {
            tracing::info!("Pushover notifications disabled via ENABLE_PUSHOVER");
            return Ok(false);
        }
        let (Some(token), Some(user)) = (self.token_for(notice.kind), self.config.user_key.as_deref())
        else {
            tracing::warn!("Pushover not configured, skipping notification");
            return Ok(false);
        };

        let form = [
            ("token", token),
            ("user", user),
            ("title", notice.title.as_str()),
            ("message", notice.message.as_str()),
            ("priority", "0"),
            ("sound", notice.sound),
        ];

        let response: PushoverResponse = self
            .client
            .post(PUSHOVER_URL)
            .form(&form)
            .send()
            .await?
            .json()
            .await?;

        if response.status != 1 {
            return Err(anyhow!("Pushover rejected message: {:?}", response.errors));
        }
        Ok(true)
    }

    /// Send every notice for a batch and log ping summaries.
    /// Delivery failures are logged and never propagate.
    pub async fn process_batch(&self, readings: &[Reading]) {
        // ---
        let plan = plan(readings);

        for notice in &plan.notices {
            match self.send(notice).await {
                Ok(true) => tracing::info!(
                    sensor_id = %notice.sensor_id,
                    kind = ?notice.kind,
                    "status notification sent"
                ),
                Ok(false) => {}
                Err(e) => tracing::error!(
                    sensor_id = %notice.sensor_id,
                    kind = ?notice.kind,
                    "failed to send status notification: {}",
                    e
                ),
            }
        }

        for ((set_id, sensor_id), count) in &plan.pings {
            tracing::info!(
                sensor_id = %sensor_id,
                sensor_set_id = %set_id,
                data_point_count = count,
                "{} data points received from {}",
                count,
                sensor_id
            );
        }
    }
}
