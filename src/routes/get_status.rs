// src/routes/get_status.rs
//! Sync status endpoint.
//!
//! `GET /sync/status` returns the report of the most recent finished sync
//! cycle as JSON, or `null` before the first cycle completes.

use axum::{extract::State, routing::get, Json, Router};

use crate::scheduler::SharedStatus;
use crate::sync::CycleReport;

// ---

async fn sync_status(State(status): State<SharedStatus>) -> Json<Option<CycleReport>> {
    // ---
    let report = status.read().await.clone();
    Json(report)
}

pub fn router() -> Router<SharedStatus> {
    Router::new().route("/sync/status", get(sync_status))
}
