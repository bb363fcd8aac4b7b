//! Incremental synchronization of station telemetry.
//!
//! One sync cycle lists the stations, stores their metadata, then walks the
//! stations one at a time. For each station the configured sensors are
//! split by watermark state:
//!
//! - **new** sensors (no stored readings) share one backfill plan;
//! - **existing** sensors share one catch-up plan starting at the *oldest*
//!   of their watermarks, so no sensor is under-fetched.
//!
//! Windows are fetched and stored strictly in order. Every step reports an
//! [`Outcome`]; a [`Tally`] turns it into continue-or-stop and keeps counts.
//! A failed window is skipped and so is a failed station. Only losing the
//! station list or a shutdown request ends the cycle early. Every store call
//! runs under a deadline; one that overruns counts as a failed call.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::client::{TelemetryApi, TelemetryClient};
use crate::models::{numeric_readings, point_count, Station, TimeWindow};
use crate::planner;
use crate::store::{IngestionSink, WatermarkStore};

// ---

/// Result of processing one item of a sequence.
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    /// Log the failure and carry on with the next item.
    Skip(anyhow::Error),
    /// Stop the whole sequence.
    Abort(anyhow::Error),
}

/// Running counts of a processed sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub succeeded: usize,
    pub skipped: usize,
    pub aborted: Option<String>,
}

impl Tally {
    /// Account for one outcome and decide whether the sequence continues.
    ///
    /// Continues with the value on success and with `None` on a skip; breaks
    /// with the reason on an abort.
    pub fn record<T>(&mut self, item: &str, outcome: Outcome<T>) -> ControlFlow<String, Option<T>> {
        // ---
        match outcome {
            Outcome::Success(value) => {
                self.succeeded += 1;
                ControlFlow::Continue(Some(value))
            }
            Outcome::Skip(err) => {
                self.skipped += 1;
                warn!("Skipping {}: {:#}", item, err);
                ControlFlow::Continue(None)
            }
            Outcome::Abort(err) => {
                let reason = format!("{err:#}");
                error!("Aborting at {}: {}", item, reason);
                self.aborted = Some(reason.clone());
                ControlFlow::Break(reason)
            }
        }
    }
}

/// Summary of one sync cycle, exposed on `/sync/status`.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub devices: usize,
    pub devices_synced: usize,
    pub devices_skipped: usize,
    pub windows_fetched: usize,
    pub windows_skipped: usize,
    pub rows_stored: usize,
    pub aborted: Option<String>,
}

impl CycleReport {
    fn start() -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            devices: 0,
            devices_synced: 0,
            devices_skipped: 0,
            windows_fetched: 0,
            windows_skipped: 0,
            rows_stored: 0,
            aborted: None,
        }
    }

    fn absorb(&mut self, device: &DeviceSummary) {
        self.windows_fetched += device.windows.succeeded;
        self.windows_skipped += device.windows.skipped;
        self.rows_stored += device.rows_stored;
    }
}

/// Store call deadline used unless [`Synchronizer::with_store_timeout`] says otherwise.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-station result of a cycle.
#[derive(Debug, Default)]
struct DeviceSummary {
    windows: Tally,
    rows_stored: usize,
}

/// Sensors of one station split by watermark state.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SensorGroups {
    pub new: Vec<String>,
    pub existing: Vec<String>,
    /// Oldest watermark among `existing`.
    pub oldest_watermark: Option<i64>,
}

impl SensorGroups {
    /// Partition sensors by the outcome of their watermark reads.
    ///
    /// A failed read counts as "new": the sensor is backfilled again, which
    /// storage absorbs. Fails only when every read failed.
    pub fn partition<I>(station_id: &str, reads: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Result<Option<i64>>)>,
    {
        // ---
        let mut groups = SensorGroups::default();
        let mut reads_total = 0;
        let mut reads_failed = 0;

        for (key, read) in reads {
            reads_total += 1;
            match read {
                Ok(Some(ts)) => {
                    groups.oldest_watermark = Some(groups.oldest_watermark.map_or(ts, |w| w.min(ts)));
                    groups.existing.push(key);
                }
                Ok(None) => groups.new.push(key),
                Err(e) => {
                    warn!(
                        "Watermark read failed for {}/{}, treating sensor as new: {:#}",
                        station_id, key, e
                    );
                    reads_failed += 1;
                    groups.new.push(key);
                }
            }
        }

        if reads_total > 0 && reads_failed == reads_total {
            bail!("no watermark of station {station_id} could be read");
        }
        Ok(groups)
    }
}

/// Await a store call, failing it once `limit` elapses.
async fn with_deadline<T, F>(limit: Duration, op: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    // ---
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => bail!("{op} timed out after {limit:?}"),
    }
}

/// Source of the current time in epoch milliseconds.
pub type Clock = Box<dyn Fn() -> i64 + Send + Sync>;

/// Drives the planner, the telemetry client and the store for every station.
pub struct Synchronizer<A, S> {
    client: TelemetryClient<A>,
    store: S,
    sensor_keys: Vec<String>,
    store_timeout: Duration,
    clock: Clock,
}

impl<A, S> Synchronizer<A, S>
where
    A: TelemetryApi,
    S: WatermarkStore + IngestionSink,
{
    // ---
    pub fn new(client: TelemetryClient<A>, store: S, sensor_keys: Vec<String>) -> Self {
        Self {
            client,
            store,
            sensor_keys,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            clock: Box::new(|| Utc::now().timestamp_millis()),
        }
    }

    /// Replace the wall clock, e.g. to pin `now` in tests.
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Bound every watermark read and every write by `limit`.
    pub fn with_store_timeout(mut self, limit: Duration) -> Self {
        self.store_timeout = limit;
        self
    }

    /// Run one full sync cycle.
    ///
    /// Never fails: every error is logged and reflected in the report.
    /// `cancel` is checked between stations and between windows.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleReport {
        // ---
        let mut report = CycleReport::start();
        let span = info_span!("sync_cycle", cycle_id = %report.cycle_id);

        self.cycle(&mut report, cancel).instrument(span).await;

        report.finished_at = Some(Utc::now());
        report
    }

    async fn cycle(&mut self, report: &mut CycleReport, cancel: &CancellationToken) {
        // ---
        info!("Starting sync cycle");
        if !self.client.has_session() {
            info!("No telemetry API session, logging in");
        }

        let stations = match self.client.devices().await {
            Ok(stations) => stations,
            Err(e) => {
                error!("Cannot list devices, ending cycle: {}", e);
                report.aborted = Some(format!("device list unavailable: {e}"));
                return;
            }
        };
        report.devices = stations.len();
        info!("Found {} devices", stations.len());

        let upserted = with_deadline(
            self.store_timeout,
            "station upsert",
            self.store.upsert_stations(&stations),
        )
        .await;
        if let Err(e) = upserted {
            error!("Failed to store station metadata: {:#}", e);
        }

        let mut devices = Tally::default();
        for station in &stations {
            let mut summary = DeviceSummary::default();
            let outcome = if cancel.is_cancelled() {
                Outcome::Abort(anyhow!("shutdown requested"))
            } else {
                let span = info_span!("device", id = %station.id);
                self.sync_device(station, cancel, &mut summary)
                    .instrument(span)
                    .await
            };
            // rows of an abandoned device were still stored
            report.absorb(&summary);

            match devices.record(&format!("device {}", station.id), outcome) {
                ControlFlow::Continue(_) => {}
                ControlFlow::Break(reason) => {
                    report.aborted = Some(reason);
                    break;
                }
            }
        }

        if report.aborted.is_none() && cancel.is_cancelled() {
            report.aborted = Some("shutdown requested".to_string());
        }
        report.devices_synced = devices.succeeded;
        report.devices_skipped = devices.skipped;

        info!(
            "Sync cycle finished: {}/{} devices, {} windows ({} skipped), {} rows stored",
            report.devices_synced,
            report.devices,
            report.windows_fetched,
            report.windows_skipped,
            report.rows_stored
        );
    }

    /// Sync both sensor groups of one station.
    ///
    /// A shutdown observed between windows abandons the station with
    /// [`Outcome::Abort`]; whatever was stored so far stays in `summary`.
    async fn sync_device(
        &mut self,
        station: &Station,
        cancel: &CancellationToken,
        summary: &mut DeviceSummary,
    ) -> Outcome<()> {
        // ---
        info!("Processing device {} ({})", station.label, station.id);
        let now = (self.clock)();

        let groups = match self.classify(&station.id).await {
            Ok(groups) => groups,
            Err(e) => return Outcome::Skip(e),
        };

        if !groups.new.is_empty() {
            info!(
                "Backfilling {} new sensors of {}: {:?}",
                groups.new.len(),
                station.id,
                groups.new
            );
            let windows = planner::plan(now, None);
            let flow = self
                .sync_windows(&station.id, &groups.new, &windows, cancel, summary)
                .await;
            if let ControlFlow::Break(reason) = flow {
                return Outcome::Abort(anyhow!(reason));
            }
        }

        if let Some(watermark) = groups.oldest_watermark {
            let windows = planner::plan(now, Some(watermark));
            info!(
                "Updating {} existing sensors of {} from {} in {} windows",
                groups.existing.len(),
                station.id,
                DateTime::<Utc>::from_timestamp_millis(watermark)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| watermark.to_string()),
                windows.len()
            );
            let flow = self
                .sync_windows(&station.id, &groups.existing, &windows, cancel, summary)
                .await;
            if let ControlFlow::Break(reason) = flow {
                return Outcome::Abort(anyhow!(reason));
            }
        }

        if summary.rows_stored > 0 {
            info!(
                "Device {} done: {} rows stored",
                station.id, summary.rows_stored
            );
        } else {
            info!("Device {} done: no new data", station.id);
        }
        Outcome::Success(())
    }

    async fn classify(&self, station_id: &str) -> Result<SensorGroups> {
        // ---
        let mut reads = Vec::with_capacity(self.sensor_keys.len());
        for key in &self.sensor_keys {
            let read = with_deadline(
                self.store_timeout,
                "watermark read",
                self.store.latest(station_id, key),
            )
            .await;
            reads.push((key.clone(), read));
        }
        SensorGroups::partition(station_id, reads)
    }

    /// Fetch and store `windows` in order for one sensor group.
    async fn sync_windows(
        &mut self,
        station_id: &str,
        keys: &[String],
        windows: &[TimeWindow],
        cancel: &CancellationToken,
        summary: &mut DeviceSummary,
    ) -> ControlFlow<String> {
        // ---
        for window in windows {
            let outcome = if cancel.is_cancelled() {
                Outcome::Abort(anyhow!("shutdown requested"))
            } else {
                self.sync_window(station_id, keys, *window).await
            };

            let item = format!("{station_id} window {window}");
            match summary.windows.record(&item, outcome) {
                ControlFlow::Continue(stored) => summary.rows_stored += stored.unwrap_or(0),
                ControlFlow::Break(reason) => return ControlFlow::Break(reason),
            }
        }
        ControlFlow::Continue(())
    }

    /// Fetch one window and store its numeric points.
    async fn sync_window(
        &mut self,
        station_id: &str,
        keys: &[String],
        window: TimeWindow,
    ) -> Outcome<usize> {
        // ---
        debug!(
            "Fetching {} for {} ({:.1} days)",
            window,
            station_id,
            window.span_ms() as f64 / planner::DAY_MS as f64
        );
        let telemetry = match self.client.telemetry(station_id, keys, window).await {
            Ok(telemetry) => telemetry,
            Err(e) => return Outcome::Skip(anyhow::Error::new(e).context("fetch failed")),
        };

        let fetched = point_count(&telemetry);
        let readings = numeric_readings(telemetry);
        let storable = point_count(&readings);
        if storable < fetched {
            debug!(
                "Dropped {} non-numeric points of {} in {}",
                fetched - storable,
                station_id,
                window
            );
        }
        if storable == 0 {
            debug!("No new data for {} in {}", station_id, window);
            return Outcome::Success(0);
        }

        let stored = with_deadline(
            self.store_timeout,
            "readings upsert",
            self.store.upsert_readings(station_id, &readings),
        )
        .await;
        match stored {
            Ok(stored) => Outcome::Success(stored),
            Err(e) => Outcome::Skip(e.context("store failed")),
        }
    }
}
