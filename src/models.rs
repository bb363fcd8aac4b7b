//! Data models shared by the telemetry client, the planner and the store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

// ---

/// A weather station as reported by the telemetry API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Station {
    // ---
    pub id: String,
    pub name: String,
    pub label: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Sensor keys the station advertises.
    pub sensors: Vec<String>,
}

/// A raw sensor value. Only [`SensorValue::Numeric`] is ever persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Numeric(f64),
    Text(String),
}

impl SensorValue {
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            SensorValue::Numeric(v) if v.is_finite() => Some(*v),
            _ => None,
        }
    }
}

/// One point of a sensor time series, value not yet validated.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryPoint {
    pub ts: i64,
    pub value: SensorValue,
}

/// Fetched telemetry keyed by sensor key, each series ordered by timestamp.
pub type Telemetry = BTreeMap<String, Vec<TelemetryPoint>>;

/// A numeric reading ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub ts_ms: i64,
    pub date_value: DateTime<Utc>,
    pub value: f64,
}

/// Storable readings keyed by sensor key.
pub type Readings = BTreeMap<String, Vec<Reading>>;

/// Count the points of every series in a map.
pub fn point_count<T>(series: &BTreeMap<String, Vec<T>>) -> usize {
    series.values().map(Vec::len).sum()
}

/// Keep only storable points of fetched telemetry.
///
/// Non-numeric values and timestamps outside the representable range are
/// dropped. Repeated timestamps within a series collapse to the last value,
/// so every (sensor, timestamp) pair appears at most once.
pub fn numeric_readings(telemetry: Telemetry) -> Readings {
    // ---
    let mut readings = Readings::new();

    for (key, points) in telemetry {
        let mut by_ts: BTreeMap<i64, Reading> = BTreeMap::new();
        for point in points {
            let Some(value) = point.value.as_numeric() else {
                continue;
            };
            let Some(date_value) = DateTime::from_timestamp_millis(point.ts) else {
                continue;
            };
            by_ts.insert(
                point.ts,
                Reading {
                    ts_ms: point.ts,
                    date_value,
                    value,
                },
            );
        }

        if !by_ts.is_empty() {
            readings.insert(key, by_ts.into_values().collect());
        }
    }

    readings
}

/// Half-open interval `[from, to)` in epoch milliseconds. Never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    from: i64,
    to: i64,
}

impl TimeWindow {
    /// Returns `None` unless `from < to`.
    pub fn new(from: i64, to: i64) -> Option<Self> {
        (from < to).then_some(Self { from, to })
    }

    pub fn from(&self) -> i64 {
        self.from
    }

    pub fn to(&self) -> i64 {
        self.to
    }

    pub fn span_ms(&self) -> i64 {
        self.to - self.from
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let show = |ms: i64| match DateTime::from_timestamp_millis(ms) {
            Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            None => ms.to_string(),
        };
        write!(f, "[{} .. {})", show(self.from), show(self.to))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn point(ts: i64, value: SensorValue) -> TelemetryPoint {
        TelemetryPoint { ts, value }
    }

    #[test]
    fn test_text_values_are_dropped() {
        // ---
        let mut telemetry = Telemetry::new();
        telemetry.insert(
            "airtemp".to_string(),
            vec![
                point(1_000, SensorValue::Numeric(12.5)),
                point(2_000, SensorValue::Text("N/A".to_string())),
                point(3_000, SensorValue::Numeric(0.0)),
            ],
        );

        let readings = numeric_readings(telemetry);
        let airtemp = &readings["airtemp"];
        assert_eq!(point_count(&readings), 2);
        assert_eq!(airtemp[0].value, 12.5);
        assert_eq!(airtemp[1].ts_ms, 3_000);
        assert_eq!(airtemp[1].value, 0.0);
    }

    #[test]
    fn test_non_finite_values_are_dropped() {
        // ---
        let mut telemetry = Telemetry::new();
        telemetry.insert(
            "rainfall".to_string(),
            vec![
                point(1_000, SensorValue::Numeric(f64::NAN)),
                point(2_000, SensorValue::Numeric(f64::INFINITY)),
            ],
        );

        let readings = numeric_readings(telemetry);
        assert!(readings.is_empty());
    }

    #[test]
    fn test_duplicate_timestamps_collapse_to_last() {
        // ---
        let mut telemetry = Telemetry::new();
        telemetry.insert(
            "windspeed".to_string(),
            vec![
                point(5_000, SensorValue::Numeric(3.0)),
                point(1_000, SensorValue::Numeric(1.0)),
                point(5_000, SensorValue::Numeric(4.0)),
            ],
        );

        let readings = numeric_readings(telemetry);
        let windspeed = &readings["windspeed"];
        assert_eq!(windspeed.len(), 2);
        assert_eq!(windspeed[0].ts_ms, 1_000);
        assert_eq!(windspeed[1].value, 4.0);
    }

    #[test]
    fn test_date_value_derived_from_millis() {
        // ---
        let mut telemetry = Telemetry::new();
        telemetry.insert(
            "airtemp".to_string(),
            vec![point(1_710_460_800_000, SensorValue::Numeric(1.0))],
        );

        let readings = numeric_readings(telemetry);
        let reading = &readings["airtemp"][0];
        assert_eq!(reading.date_value.to_rfc3339(), "2024-03-15T00:00:00+00:00");
    }

    #[test]
    fn test_time_window_rejects_empty() {
        // ---
        assert!(TimeWindow::new(10, 10).is_none());
        assert!(TimeWindow::new(11, 10).is_none());

        let window = TimeWindow::new(10, 20).unwrap();
        assert_eq!(window.span_ms(), 10);
    }
}
