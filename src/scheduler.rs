//! Periodic execution of sync cycles.
//!
//! The first cycle runs immediately, later ones every `every`. A cycle that
//! overruns the period delays the next tick instead of bursting to catch up,
//! so cycles never overlap. Shutdown is observed between ticks and, inside a
//! cycle, between stations and windows.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::TelemetryApi;
use crate::store::{IngestionSink, WatermarkStore};
use crate::sync::{CycleReport, Synchronizer};

// ---

/// Report of the most recent finished cycle, shared with the HTTP layer.
pub type SharedStatus = Arc<RwLock<Option<CycleReport>>>;

/// Run sync cycles until `cancel` fires.
pub async fn run<A, S>(
    mut sync: Synchronizer<A, S>,
    every: Duration,
    cancel: CancellationToken,
    status: SharedStatus,
) where
    A: TelemetryApi,
    S: WatermarkStore + IngestionSink,
{
    // ---
    info!("Scheduler started, collecting every {:?}", every);

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let report = sync.run_cycle(&cancel).await;
        *status.write().await = Some(report);
    }

    info!("Scheduler stopped");
}
