//! Period planning: which time windows still need to be fetched.
//!
//! Pure functions only. Given the current time and the watermark of a sensor
//! group (or its absence), [`plan`] produces the ordered, contiguous,
//! non-overlapping windows to request from the telemetry API.
//!
//! - No watermark: the trailing [`BACKFILL_DAYS`] split at calendar-month
//!   boundaries (UTC), so no request covers more than one month.
//! - Watermark: `[watermark + 1ms, now)` split into [`CHUNK_DAYS`]-day
//!   windows, which is a single window when the watermark is recent.

use chrono::{DateTime, Datelike, NaiveDate};

use crate::models::TimeWindow;

// ---

/// History requested for a sensor with no stored readings.
pub const BACKFILL_DAYS: i64 = 365;

/// Longest window requested when catching up from a watermark.
pub const CHUNK_DAYS: i64 = 30;

pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Plan the windows to fetch at `now` for the given watermark.
///
/// Never fails: a watermark at or after `now` yields no windows.
pub fn plan(now: i64, watermark: Option<i64>) -> Vec<TimeWindow> {
    // ---
    match watermark {
        None => monthly_windows(now.saturating_sub(BACKFILL_DAYS * DAY_MS), now),
        // The row at the watermark is already stored.
        Some(watermark) => fixed_windows(watermark.saturating_add(1), now, CHUNK_DAYS * DAY_MS),
    }
}

/// Split `[from, to)` at the first instant of every calendar month.
fn monthly_windows(from: i64, to: i64) -> Vec<TimeWindow> {
    // ---
    let mut windows = Vec::new();
    let mut cursor = from;

    while cursor < to {
        let end = next_month_start(cursor).map_or(to, |boundary| boundary.min(to));
        windows.extend(TimeWindow::new(cursor, end));
        cursor = end;
    }

    windows
}

/// Split `[from, to)` into windows of `chunk_ms`, the last one clipped at `to`.
fn fixed_windows(from: i64, to: i64, chunk_ms: i64) -> Vec<TimeWindow> {
    // ---
    let mut windows = Vec::new();
    let mut cursor = from;

    while cursor < to {
        let end = cursor.saturating_add(chunk_ms).min(to);
        windows.extend(TimeWindow::new(cursor, end));
        cursor = end;
    }

    windows
}

/// Epoch millis of 00:00 UTC on the 1st of the month following `ms`.
fn next_month_start(ms: i64) -> Option<i64> {
    // ---
    let dt = DateTime::from_timestamp_millis(ms)?;
    let (year, month) = match dt.month() {
        12 => (dt.year() + 1, 1),
        m => (dt.year(), m + 1),
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
    Some(first.and_utc().timestamp_millis())
}
