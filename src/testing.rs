//! In-memory fakes of the telemetry API and the store for unit tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::client::{ApiError, Credentials, Session, TelemetryApi};
use crate::models::{point_count, Readings, SensorValue, Station, Telemetry, TelemetryPoint, TimeWindow};
use crate::store::{IngestionSink, WatermarkStore};

// ---

pub fn sample_station(id: &str) -> Station {
    Station {
        id: id.to_string(),
        name: format!("Station {id}"),
        label: id.to_lowercase(),
        latitude: Some(51.5),
        longitude: Some(39.2),
        sensors: vec!["airtemp".to_string(), "rainfall".to_string()],
    }
}

/// A recorded `query_telemetry` call.
#[derive(Debug, Clone)]
pub struct TelemetryCall {
    pub token: String,
    pub station_id: String,
    pub keys: Vec<String>,
    pub window: TimeWindow,
}

/// Scriptable remote API holding its own telemetry history.
#[derive(Default)]
pub struct FakeApi {
    pub stations: Mutex<Vec<Station>>,
    /// Remote history: station -> sensor -> points.
    pub history: Mutex<BTreeMap<String, Telemetry>>,
    pub logins: AtomicUsize,
    pub device_calls: AtomicUsize,
    pub telemetry_calls: Mutex<Vec<TelemetryCall>>,
    /// Number of upcoming data calls answered with a rejection.
    pub reject_next: AtomicUsize,
    pub fail_login: AtomicBool,
    pub fail_devices: AtomicBool,
    /// Windows starting at these instants fail with a non-rejection error.
    pub fail_windows_from: Mutex<HashSet<i64>>,
}

impl FakeApi {
    pub fn with_stations(stations: Vec<Station>) -> Self {
        Self {
            stations: Mutex::new(stations),
            ..Default::default()
        }
    }

    pub fn add_point(&self, station_id: &str, key: &str, ts: i64, value: SensorValue) {
        let mut history = self.history.lock().unwrap();
        history
            .entry(station_id.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .push(TelemetryPoint { ts, value });
    }

    fn take_rejection(&self) -> bool {
        self.reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn rejection() -> ApiError {
        ApiError::Rejected {
            status: "error".to_string(),
            message: "session expired".to_string(),
        }
    }
}

#[async_trait]
impl TelemetryApi for FakeApi {
    async fn login(&self, _credentials: &Credentials) -> Result<String, ApiError> {
        // ---
        if self.fail_login.load(Ordering::SeqCst) {
            return Err(ApiError::Rejected {
                status: "error".to_string(),
                message: "bad credentials".to_string(),
            });
        }
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("sid-{n}"))
    }

    async fn list_devices(&self, _session: &Session) -> Result<Vec<Station>, ApiError> {
        // ---
        self.device_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_rejection() {
            return Err(Self::rejection());
        }
        if self.fail_devices.load(Ordering::SeqCst) {
            return Err(ApiError::Decode("devices: unexpected end of input".to_string()));
        }
        Ok(self.stations.lock().unwrap().clone())
    }

    async fn query_telemetry(
        &self,
        session: &Session,
        station_id: &str,
        sensor_keys: &[String],
        window: TimeWindow,
    ) -> Result<Telemetry, ApiError> {
        // ---
        self.telemetry_calls.lock().unwrap().push(TelemetryCall {
            token: session.token().to_string(),
            station_id: station_id.to_string(),
            keys: sensor_keys.to_vec(),
            window,
        });
        if self.take_rejection() {
            return Err(Self::rejection());
        }
        if self.fail_windows_from.lock().unwrap().contains(&window.from()) {
            return Err(ApiError::Decode("telemetry: truncated body".to_string()));
        }

        let history = self.history.lock().unwrap();
        let mut telemetry = Telemetry::new();
        if let Some(series) = history.get(station_id) {
            for key in sensor_keys {
                let mut points: Vec<TelemetryPoint> = series
                    .get(key)
                    .into_iter()
                    .flatten()
                    .filter(|p| p.ts >= window.from() && p.ts < window.to())
                    .cloned()
                    .collect();
                if !points.is_empty() {
                    points.sort_by_key(|p| p.ts);
                    telemetry.insert(key.clone(), points);
                }
            }
        }
        Ok(telemetry)
    }
}

/// In-memory store keyed like the `readings` uniqueness constraint.
#[derive(Default)]
pub struct MemoryStore {
    pub stations: Mutex<BTreeMap<String, Station>>,
    pub readings: Mutex<BTreeMap<(String, String, i64), f64>>,
    /// Sensor keys whose watermark read fails.
    pub failing_reads: Mutex<HashSet<String>>,
    pub fail_writes: AtomicBool,
    pub fail_station_writes: AtomicBool,
    /// Watermark reads and reading writes never complete.
    pub stall_reads: AtomicBool,
    pub stall_writes: AtomicBool,
    /// Cancelled right after the first successful readings write.
    pub cancel_on_write: Mutex<Option<CancellationToken>>,
}

impl MemoryStore {
    pub fn row_count(&self) -> usize {
        self.readings.lock().unwrap().len()
    }

    pub fn insert(&self, station_id: &str, key: &str, ts: i64, value: f64) {
        self.readings
            .lock()
            .unwrap()
            .insert((station_id.to_string(), key.to_string(), ts), value);
    }
}

#[async_trait]
impl WatermarkStore for MemoryStore {
    async fn latest(&self, station_id: &str, sensor_key: &str) -> Result<Option<i64>> {
        // ---
        if self.stall_reads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing_reads.lock().unwrap().contains(sensor_key) {
            bail!("connection reset while reading {station_id}/{sensor_key}");
        }
        let readings = self.readings.lock().unwrap();
        Ok(readings
            .keys()
            .filter(|(s, k, _)| s == station_id && k == sensor_key)
            .map(|(_, _, ts)| *ts)
            .max())
    }
}

#[async_trait]
impl IngestionSink for MemoryStore {
    async fn upsert_stations(&self, stations: &[Station]) -> Result<()> {
        // ---
        if self.fail_station_writes.load(Ordering::SeqCst) {
            bail!("stations table locked");
        }
        let mut stored = self.stations.lock().unwrap();
        for station in stations {
            stored.insert(station.id.clone(), station.clone());
        }
        Ok(())
    }

    async fn upsert_readings(&self, station_id: &str, readings: &Readings) -> Result<usize> {
        // ---
        if self.stall_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        {
            let mut stored = self.readings.lock().unwrap();
            for (key, series) in readings {
                for reading in series {
                    stored.insert(
                        (station_id.to_string(), key.clone(), reading.ts_ms),
                        reading.value,
                    );
                }
            }
        }
        if let Some(cancel) = self.cancel_on_write.lock().unwrap().take() {
            cancel.cancel();
        }
        Ok(point_count(readings))
    }
}
