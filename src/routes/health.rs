// src/routes/health.rs
//! Liveness endpoint.
//!
//! `GET /health` answers as long as the process serves HTTP and says how long
//! ago the last sync cycle finished. It reads only the in-memory status, never
//! the database or the remote API.

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scheduler::SharedStatus;

// ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    /// `None` until the first cycle finishes.
    last_cycle_finished_at: Option<DateTime<Utc>>,
    last_cycle_age_secs: Option<i64>,
}

async fn health(State(status): State<SharedStatus>) -> Json<HealthResponse> {
    // ---
    let finished_at = status
        .read()
        .await
        .as_ref()
        .and_then(|report| report.finished_at);

    Json(HealthResponse {
        status: "ok",
        last_cycle_finished_at: finished_at,
        last_cycle_age_secs: finished_at.map(|at| (Utc::now() - at).num_seconds().max(0)),
    })
}

pub fn router() -> Router<SharedStatus> {
    Router::new().route("/health", get(health))
}
