//! Bounded last-observation-carried-forward.
//!
//! A gap is a run of empty buckets strictly between two consecutive real
//! buckets of one sensor, and is filled with the earlier bucket's value. A run
//! refills every gap that touches a bucket it aggregated, so nothing is ever
//! produced before a sensor's first or after its last real bucket, and the
//! table ends up the same however raw rows were split across runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::models::DownsampledPoint;

// ---

struct Anchor {
    value: f64,
    sensor_set_id: Option<String>,

    /// Aggregated by this run rather than read back from the table.
    fresh: bool,
}

/// Produce carried-forward points around the buckets aggregated this run.
///
/// - `computed`: real averages produced by this run.
/// - `neighbours`: for each computed bucket, the nearest stored real point
///   before and after it. Filled points are ignored.
///
/// Only sensors present in `computed` are filled.
pub fn fill(
    computed: &[DownsampledPoint],
    neighbours: &[DownsampledPoint],
    width: Duration,
) -> Vec<DownsampledPoint> {
    // ---
    let mut series: BTreeMap<&str, BTreeMap<DateTime<Utc>, Anchor>> = BTreeMap::new();

    for p in computed {
        series.entry(p.sensor_id.as_str()).or_default().insert(
            p.observation_minute,
            Anchor {
                value: p.smoothed_light_intensity,
                sensor_set_id: p.sensor_set_id.clone(),
                fresh: true,
            },
        );
    }

    for p in neighbours.iter().filter(|p| !p.is_filled) {
        if let Some(anchors) = series.get_mut(p.sensor_id.as_str()) {
            anchors.entry(p.observation_minute).or_insert_with(|| Anchor {
                value: p.smoothed_light_intensity,
                sensor_set_id: p.sensor_set_id.clone(),
                fresh: false,
            });
        }
    }

    let mut filled = Vec::new();
    for (sensor_id, anchors) in &series {
        let mut prev: Option<(DateTime<Utc>, &Anchor)> = None;

        for (&bucket, anchor) in anchors {
            if let Some((start, earlier)) = prev {
                if earlier.fresh || anchor.fresh {
                    let mut gap = start + width;
                    while gap < bucket {
                        filled.push(DownsampledPoint {
                            observation_minute: gap,
                            sensor_id: sensor_id.to_string(),
                            sensor_set_id: earlier.sensor_set_id.clone(),
                            smoothed_light_intensity: earlier.value,
                            is_filled: true,
                        });
                        gap += width;
                    }
                }
            }
            prev = Some((bucket, anchor));
        }
    }

    filled
}
