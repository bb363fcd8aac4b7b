//! Database schema management for `fieldsync`.
//!
//! Ensures required tables and indexes exist before the first sync cycle.
//! Applied once on startup from `main.rs`.

use anyhow::{Context, Result};
use sqlx::PgPool;

// ---

/// Create the database schema if absent (idempotent).
///
/// `stations` holds station metadata keyed by the remote id. `readings`
/// holds one row per (station, sensor, timestamp); its uniqueness constraint
/// is what makes every write an upsert and what the watermark is derived from.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stations (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            label       TEXT,
            latitude    DOUBLE PRECISION,
            longitude   DOUBLE PRECISION,
            sensor_keys TEXT[]      NOT NULL DEFAULT '{}',
            last_update TIMESTAMPTZ NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await
    .context("Failed to create table stations")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS readings (
            id          BIGSERIAL PRIMARY KEY,
            station_id  TEXT             NOT NULL REFERENCES stations (id),
            sensor_key  TEXT             NOT NULL,
            ts_ms       BIGINT           NOT NULL,
            date_value  TIMESTAMPTZ      NOT NULL,
            value       DOUBLE PRECISION NOT NULL,
            CONSTRAINT uq_readings_station_sensor_ts UNIQUE (station_id, sensor_key, ts_ms)
        );
        "#,
    )
    .execute(&mut *tx)
    .await
    .context("Failed to create table readings")?;

    // Watermark lookups and per-sensor range scans
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_readings_station_sensor_ts
            ON readings (station_id, sensor_key, ts_ms);
        "#,
    )
    .execute(&mut *tx)
    .await
    .context("Failed to create index idx_readings_station_sensor_ts")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_readings_date_value
            ON readings (date_value);
        "#,
    )
    .execute(&mut *tx)
    .await
    .context("Failed to create index idx_readings_date_value")?;

    tx.commit().await?;
    Ok(())
}
