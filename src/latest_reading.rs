//! Latest-reading cache: one sparse row per sensor.
//!
//! Each incoming reading becomes a [`LatestUpdate`] naming only the metrics it
//! actually carries. [`LatestUpdate::statement`] turns that into a single
//! parameterized `INSERT .. ON CONFLICT DO UPDATE` touching just those
//! columns, so metrics absent from the message keep their cached value and
//! timestamp. Column names come from [`TrackedField`], never from input.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::PipelineError;
use crate::models::{LatestReading, Reading};

// ---

/// Metrics cached per sensor. Each has a value column and a
/// `<column>_timestamp` column recording the event time that set it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedField {
    LightIntensity,
    Status,
    BatteryVoltage,
    BatteryPercent,
    WifiDbm,
    ChipTempC,
    ChipTempF,
    CommitSha,
    /// The firmware build time reported by the device. Its event-time column
    /// follows the same `<column>_timestamp` rule, hence
    /// `commit_timestamp_timestamp`.
    CommitTimestamp,
}

impl TrackedField {
    pub fn column(self) -> &'static str {
        // ---
        match self {
            TrackedField::LightIntensity => "light_intensity",
            TrackedField::Status => "status",
            TrackedField::BatteryVoltage => "battery_voltage",
            TrackedField::BatteryPercent => "battery_percent",
            TrackedField::WifiDbm => "wifi_dbm",
            TrackedField::ChipTempC => "chip_temp_c",
            TrackedField::ChipTempF => "chip_temp_f",
            TrackedField::CommitSha => "commit_sha",
            TrackedField::CommitTimestamp => "commit_timestamp",
        }
    }

    pub fn timestamp_column(self) -> &'static str {
        // ---
        match self {
            TrackedField::LightIntensity => "light_intensity_timestamp",
            TrackedField::Status => "status_timestamp",
            TrackedField::BatteryVoltage => "battery_voltage_timestamp",
            TrackedField::BatteryPercent => "battery_percent_timestamp",
            TrackedField::WifiDbm => "wifi_dbm_timestamp",
            TrackedField::ChipTempC => "chip_temp_c_timestamp",
            TrackedField::ChipTempF => "chip_temp_f_timestamp",
            TrackedField::CommitSha => "commit_sha_timestamp",
            TrackedField::CommitTimestamp => "commit_timestamp_timestamp",
        }
    }
}

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i32),
    Text(String),
    Time(DateTime<Utc>),
}

/// Partial update for one sensor's cache row.
#[derive(Debug, Clone)]
pub struct LatestUpdate {
    // ---
    sensor_id: String,
    sensor_set_id: Option<String>,
    event_timestamp: DateTime<Utc>,
    ingestion_time: DateTime<Utc>,
    fields: Vec<(TrackedField, FieldValue)>,
}

/// SQL text plus the values for its `$n` placeholders, in order.
/// `columns[i]` is the column bound to `values[i]`.
#[derive(Debug)]
pub struct UpsertStatement {
    // ---
    pub sql: String,
    pub columns: Vec<&'static str>,
    pub values: Vec<FieldValue>,
}

impl LatestUpdate {
    /// Start an update with no metrics. Fails when `sensor_id` is empty.
    pub fn new(
        sensor_id: &str,
        event_timestamp: DateTime<Utc>,
        ingestion_time: DateTime<Utc>,
    ) -> Result<Self, PipelineError> {
        // ---
        if sensor_id.trim().is_empty() {
            return Err(PipelineError::MissingKey("sensor_id"));
        }
        Ok(Self {
            sensor_id: sensor_id.to_string(),
            sensor_set_id: None,
            event_timestamp,
            ingestion_time,
            fields: Vec::new(),
        })
    }

    pub fn sensor_set(mut self, sensor_set_id: Option<&str>) -> Self {
        // ---
        self.sensor_set_id = sensor_set_id
            .filter(|s| !s.trim().is_empty())
            .map(String::from);
        self
    }

    /// Record a metric. Setting the same metric twice keeps the later value.
    pub fn set(mut self, field: TrackedField, value: FieldValue) -> Self {
        // ---
        self.fields.retain(|(f, _)| *f != field);
        self.fields.push((field, value));
        self
    }

    fn set_opt(self, field: TrackedField, value: Option<FieldValue>) -> Self {
        match value {
            Some(v) => self.set(field, v),
            None => self,
        }
    }

    /// Collect every non-null metric carried by `reading`.
    pub fn from_reading(
        reading: &Reading,
        ingestion_time: DateTime<Utc>,
    ) -> Result<Self, PipelineError> {
        // ---
        use TrackedField::*;

        Ok(Self::new(&reading.sensor_id, reading.timestamp, ingestion_time)?
            .sensor_set(reading.sensor_set_id.as_deref())
            .set_opt(LightIntensity, reading.light_intensity.map(FieldValue::Float))
            .set_opt(Status, reading.status.clone().map(FieldValue::Text))
            .set_opt(BatteryVoltage, reading.battery_voltage.map(FieldValue::Float))
            .set_opt(BatteryPercent, reading.battery_percent.map(FieldValue::Float))
            .set_opt(WifiDbm, reading.wifi_dbm.map(FieldValue::Int))
            .set_opt(ChipTempC, reading.chip_temp_c.map(FieldValue::Float))
            .set_opt(ChipTempF, reading.chip_temp_f.map(FieldValue::Float))
            .set_opt(CommitSha, reading.commit_sha.clone().map(FieldValue::Text))
            .set_opt(CommitTimestamp, reading.commit_timestamp.map(FieldValue::Time)))
    }

    pub fn fields(&self) -> impl Iterator<Item = TrackedField> + '_ {
        self.fields.iter().map(|(f, _)| *f)
    }

    /// Build the upsert for this update.
    ///
    /// `last_seen` and `timestamp` are always written; `sensor_set_id` when
    /// supplied. A metric only replaces the cached one when its event time is
    /// not older than the cached `<field>_timestamp`, so per-field timestamps
    /// never move backwards; equal timestamps resolve to the later write.
    pub fn statement(&self) -> Result<UpsertStatement, PipelineError> {
        // ---
        let mut columns: Vec<&'static str> = vec!["sensor_id", "last_seen", "timestamp"];
        let mut values = vec![
            FieldValue::Text(self.sensor_id.clone()),
            FieldValue::Time(self.ingestion_time),
            FieldValue::Time(self.event_timestamp),
        ];
        let mut set_clauses = vec![
            "last_seen = EXCLUDED.last_seen".to_string(),
            "timestamp = EXCLUDED.timestamp".to_string(),
        ];

        if let Some(set_id) = &self.sensor_set_id {
            columns.push("sensor_set_id");
            values.push(FieldValue::Text(set_id.clone()));
            set_clauses.push("sensor_set_id = EXCLUDED.sensor_set_id".to_string());
        }

        for (field, value) in &self.fields {
            let col = field.column();
            let ts_col = field.timestamp_column();
            columns.push(col);
            values.push(value.clone());
            columns.push(ts_col);
            values.push(FieldValue::Time(self.event_timestamp));

            let newer = format!(
                "sensor_latest_reading.{ts} IS NULL OR EXCLUDED.{ts} >= sensor_latest_reading.{ts}",
                ts = ts_col
            );
            set_clauses.push(format!(
                "{col} = CASE WHEN {newer} THEN EXCLUDED.{col} ELSE sensor_latest_reading.{col} END",
            ));
            set_clauses.push(format!(
                "{ts_col} = CASE WHEN {newer} THEN EXCLUDED.{ts_col} ELSE sensor_latest_reading.{ts_col} END",
            ));
        }

        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
        let sql = format!(
            "INSERT INTO sensor_latest_reading ({}) VALUES ({}) ON CONFLICT (sensor_id) DO UPDATE SET {}",
            columns.join(", "),
            placeholders.join(", "),
            set_clauses.join(", ")
        );

        let statement = UpsertStatement {
            sql,
            columns,
            values,
        };
        statement.check()?;
        Ok(statement)
    }
}

/// Count distinct `$n` placeholders in `sql`.
fn count_placeholders(sql: &str) -> usize {
    // ---
    let bytes = sql.as_bytes();
    let mut seen = std::collections::BTreeSet::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > start {
                seen.insert(&sql[start..end]);
            }
            i = end.max(start);
        } else {
            i += 1;
        }
    }
    seen.len()
}

impl UpsertStatement {
    /// Verify placeholders, columns and values line up.
    pub fn check(&self) -> Result<(), PipelineError> {
        // ---
        let placeholders = count_placeholders(&self.sql);
        if placeholders != self.values.len() || self.columns.len() != self.values.len() {
            return Err(PipelineError::StatementMismatch {
                placeholders,
                values: self.values.len(),
            });
        }
        Ok(())
    }
}

/// Apply one partial update to the cache with a single statement.
///
/// A [`PipelineError::StatementMismatch`] is returned before anything is
/// executed; callers must treat it as fatal.
pub async fn apply(pool: &PgPool, update: &LatestUpdate) -> Result<(), PipelineError> {
    // ---
    let statement = update.statement()?;

    let mut query = sqlx::query(&statement.sql);
    for value in statement.values {
        query = match value {
            FieldValue::Float(v) => query.bind(v),
            FieldValue::Int(v) => query.bind(v),
            FieldValue::Text(v) => query.bind(v),
            FieldValue::Time(v) => query.bind(v),
        };
    }
    query.execute(pool).await?;

    tracing::debug!(
        sensor_id = %update.sensor_id,
        fields = ?update.fields().map(TrackedField::column).collect::<Vec<_>>(),
        "latest reading updated"
    );
    Ok(())
}

/// List cached rows, optionally restricted to one sensor set.
pub async fn fetch_latest(
    pool: &PgPool,
    sensor_set_id: Option<&str>,
) -> Result<Vec<LatestReading>, sqlx::Error> {
    // ---
    sqlx::query_as::<_, LatestReading>(
        r#"
        SELECT *
        FROM sensor_latest_reading
        WHERE $1::TEXT IS NULL OR sensor_set_id = $1
        ORDER BY sensor_set_id, sensor_id
        "#,
    )
    .bind(sensor_set_id)
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 10, min, 0).unwrap()
    }

    /// Column-level model of the cache row, applying a statement the way the
    /// `ON CONFLICT` clause does. `test_set_clause_guards_every_field` pins
    /// the SQL this model stands in for.
    #[derive(Default)]
    struct CacheRow(HashMap<&'static str, FieldValue>);

    impl CacheRow {
        fn apply(&mut self, update: &LatestUpdate) {
            // ---
            let stmt = update.statement().unwrap();
            let bound: HashMap<_, _> = stmt.columns.iter().copied().zip(stmt.values).collect();

            for col in ["last_seen", "timestamp", "sensor_set_id"] {
                if let Some(v) = bound.get(col) {
                    self.0.insert(col, v.clone());
                }
            }
            for field in update.fields() {
                let incoming_ts = &bound[field.timestamp_column()];
                let newer = match (self.0.get(field.timestamp_column()), incoming_ts) {
                    (Some(FieldValue::Time(old)), FieldValue::Time(new)) => new >= old,
                    _ => true,
                };
                if newer {
                    self.0.insert(field.column(), bound[field.column()].clone());
                    self.0.insert(field.timestamp_column(), incoming_ts.clone());
                }
            }
        }

        fn get(&self, col: &str) -> Option<&FieldValue> {
            self.0.get(col)
        }
    }

    #[test]
    fn test_rejects_missing_sensor_id() {
        // ---
        let err = LatestUpdate::new("", at(0), at(0)).unwrap_err();
        assert!(matches!(err, PipelineError::MissingKey("sensor_id")));
    }

    #[test]
    fn test_statement_names_only_present_fields() {
        // ---
        let update = LatestUpdate::new("x", at(1), at(2))
            .unwrap()
            .set(TrackedField::BatteryPercent, FieldValue::Float(80.0));
        let stmt = update.statement().unwrap();

        assert_eq!(
            stmt.columns,
            vec![
                "sensor_id",
                "last_seen",
                "timestamp",
                "battery_percent",
                "battery_percent_timestamp"
            ]
        );
        assert_eq!(stmt.values.len(), 5);
        assert!(stmt.sql.contains("VALUES ($1, $2, $3, $4, $5)"));
        assert!(!stmt.sql.contains("light_intensity"));
        assert!(!stmt.sql.contains("sensor_set_id"));
    }

    #[test]
    fn test_statement_without_metrics_still_touches_last_seen() {
        // ---
        let stmt = LatestUpdate::new("x", at(1), at(2))
            .unwrap()
            .sensor_set(Some("set-1"))
            .statement()
            .unwrap();

        assert_eq!(
            stmt.columns,
            vec!["sensor_id", "last_seen", "timestamp", "sensor_set_id"]
        );
        assert_eq!(stmt.values[1], FieldValue::Time(at(2)));
        assert_eq!(stmt.values[2], FieldValue::Time(at(1)));
    }

    #[test]
    fn test_from_reading_skips_null_fields() {
        // ---
        let reading = Reading {
            sensor_id: "x".to_string(),
            sensor_set_id: None,
            timestamp: at(5),
            light_intensity: Some(50.0),
            status: None,
            battery_voltage: None,
            battery_percent: None,
            wifi_dbm: Some(-70),
            chip_temp_c: None,
            chip_temp_f: None,
            commit_sha: None,
            commit_timestamp: None,
        };
        let update = LatestUpdate::from_reading(&reading, at(6)).unwrap();
        let fields: Vec<_> = update.fields().collect();

        assert_eq!(
            fields,
            vec![TrackedField::LightIntensity, TrackedField::WifiDbm]
        );
    }

    #[test]
    fn test_mismatched_statement_is_fatal() {
        // ---
        let stmt = UpsertStatement {
            sql: "INSERT INTO sensor_latest_reading (sensor_id, last_seen) VALUES ($1, $2)".into(),
            columns: vec!["sensor_id", "last_seen"],
            values: vec![FieldValue::Text("x".into())],
        };
        let err = stmt.check().unwrap_err();

        assert!(err.is_fatal());
        assert!(matches!(
            err,
            PipelineError::StatementMismatch {
                placeholders: 2,
                values: 1
            }
        ));
    }

    #[test]
    fn test_counts_multi_digit_placeholders() {
        // ---
        assert_eq!(count_placeholders("($1, $2, $10, $1)"), 3);
        assert_eq!(count_placeholders("no params"), 0);
    }

    #[test]
    fn test_merge_preserves_untouched_fields() {
        // ---
        let mut row = CacheRow::default();
        row.apply(
            &LatestUpdate::new("s", at(1), at(1))
                .unwrap()
                .set(TrackedField::LightIntensity, FieldValue::Float(1.0)),
        );
        row.apply(
            &LatestUpdate::new("s", at(2), at(2))
                .unwrap()
                .set(TrackedField::BatteryVoltage, FieldValue::Float(2.0)),
        );
        row.apply(
            &LatestUpdate::new("s", at(3), at(3))
                .unwrap()
                .set(TrackedField::LightIntensity, FieldValue::Float(5.0)),
        );

        assert_eq!(row.get("light_intensity"), Some(&FieldValue::Float(5.0)));
        assert_eq!(row.get("light_intensity_timestamp"), Some(&FieldValue::Time(at(3))));
        assert_eq!(row.get("battery_voltage"), Some(&FieldValue::Float(2.0)));
        assert_eq!(row.get("battery_voltage_timestamp"), Some(&FieldValue::Time(at(2))));
    }

    #[test]
    fn test_battery_then_light_both_survive() {
        // ---
        let mut row = CacheRow::default();
        row.apply(
            &LatestUpdate::new("x", at(1), at(1))
                .unwrap()
                .set(TrackedField::BatteryPercent, FieldValue::Float(80.0)),
        );
        row.apply(
            &LatestUpdate::new("x", at(2), at(2))
                .unwrap()
                .set(TrackedField::LightIntensity, FieldValue::Float(50.0)),
        );

        assert_eq!(row.get("battery_percent"), Some(&FieldValue::Float(80.0)));
        assert_eq!(row.get("battery_percent_timestamp"), Some(&FieldValue::Time(at(1))));
        assert_eq!(row.get("light_intensity"), Some(&FieldValue::Float(50.0)));
        assert_eq!(row.get("light_intensity_timestamp"), Some(&FieldValue::Time(at(2))));
    }

    #[test]
    fn test_same_timestamp_disjoint_fields_and_replay() {
        // ---
        let a = LatestUpdate::new("x", at(4), at(4))
            .unwrap()
            .set(TrackedField::Status, FieldValue::Text("[boot] ok".into()));
        let b = LatestUpdate::new("x", at(4), at(5))
            .unwrap()
            .set(TrackedField::WifiDbm, FieldValue::Int(-60));

        let mut row = CacheRow::default();
        row.apply(&a);
        row.apply(&b);
        row.apply(&a);

        assert_eq!(row.get("status"), Some(&FieldValue::Text("[boot] ok".into())));
        assert_eq!(row.get("wifi_dbm"), Some(&FieldValue::Int(-60)));
    }

    #[test]
    fn test_older_event_does_not_regress_field() {
        // ---
        let mut row = CacheRow::default();
        row.apply(
            &LatestUpdate::new("x", at(9), at(9))
                .unwrap()
                .set(TrackedField::LightIntensity, FieldValue::Float(300.0)),
        );
        row.apply(
            &LatestUpdate::new("x", at(3), at(10))
                .unwrap()
                .set(TrackedField::LightIntensity, FieldValue::Float(10.0)),
        );

        assert_eq!(row.get("light_intensity"), Some(&FieldValue::Float(300.0)));
        assert_eq!(row.get("light_intensity_timestamp"), Some(&FieldValue::Time(at(9))));
        assert_eq!(row.get("last_seen"), Some(&FieldValue::Time(at(10))));
    }

    const ALL_FIELDS: [TrackedField; 9] = [
        TrackedField::LightIntensity,
        TrackedField::Status,
        TrackedField::BatteryVoltage,
        TrackedField::BatteryPercent,
        TrackedField::WifiDbm,
        TrackedField::ChipTempC,
        TrackedField::ChipTempF,
        TrackedField::CommitSha,
        TrackedField::CommitTimestamp,
    ];

    #[test]
    fn test_timestamp_columns_follow_naming_rule() {
        // ---
        for field in ALL_FIELDS {
            assert_eq!(
                field.timestamp_column(),
                format!("{}_timestamp", field.column())
            );
        }
    }

    #[test]
    fn test_set_clause_guards_every_field() {
        // ---
        let update = ALL_FIELDS.iter().fold(
            LatestUpdate::new("x", at(1), at(2)).unwrap(),
            |u, f| u.set(*f, FieldValue::Text("v".into())),
        );
        let sql = update.statement().unwrap().sql;

        for field in ALL_FIELDS {
            let (col, ts) = (field.column(), field.timestamp_column());
            let newer = format!(
                "sensor_latest_reading.{ts} IS NULL OR EXCLUDED.{ts} >= sensor_latest_reading.{ts}"
            );
            assert!(sql.contains(&format!(
                "{col} = CASE WHEN {newer} THEN EXCLUDED.{col} ELSE sensor_latest_reading.{col} END"
            )));
            assert!(sql.contains(&format!(
                "{ts} = CASE WHEN {newer} THEN EXCLUDED.{ts} ELSE sensor_latest_reading.{ts} END"
            )));
        }
        assert!(sql.contains("last_seen = EXCLUDED.last_seen"));
        assert!(sql.contains("ON CONFLICT (sensor_id) DO UPDATE SET"));
    }

    #[tokio::test]
    async fn test_older_event_does_not_regress_in_postgres() -> anyhow::Result<()> {
        // ---
        let Some(pool) = crate::test_support::test_pool("latest").await? else {
            return Ok(());
        };

        let newer = LatestUpdate::new("sensor-A", at(10), at(11))?
            .sensor_set(Some("set-1"))
            .set(TrackedField::BatteryPercent, FieldValue::Float(80.0));
        let older = LatestUpdate::new("sensor-A", at(5), at(12))?
            .set(TrackedField::BatteryPercent, FieldValue::Float(20.0))
            .set(TrackedField::LightIntensity, FieldValue::Float(50.0));
        apply(&pool, &newer).await?;
        apply(&pool, &older).await?;
        apply(&pool, &older).await?;

        let rows = fetch_latest(&pool, Some("set-1")).await?;
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.battery_percent, Some(80.0));
        assert_eq!(row.battery_percent_timestamp, Some(at(10)));
        assert_eq!(row.light_intensity, Some(50.0));
        assert_eq!(row.light_intensity_timestamp, Some(at(5)));
        assert_eq!(row.last_seen, Some(at(12)));
        Ok(())
    }
}
