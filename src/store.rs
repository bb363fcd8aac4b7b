//! Persistence of stations and readings.
//!
//! The watermark of a (station, sensor) pair is never stored on its own: it
//! is `MAX(ts_ms)` over the readings already committed for that pair. A lost
//! write therefore loses its watermark advance too, and the next cycle
//! fetches the same range again.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use crate::models::{point_count, Reading, Readings, Station};

// ---

/// Rows per `INSERT` statement; five binds each keeps well under the
/// Postgres bind parameter limit.
const UPSERT_BATCH_ROWS: usize = 1000;

/// Read access to per-sensor high-water marks.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Timestamp of the newest stored reading, or `None` if there is none.
    async fn latest(&self, station_id: &str, sensor_key: &str) -> Result<Option<i64>>;
}

/// Idempotent writes of stations and readings.
///
/// Each call is atomic: either every row is written or none is.
#[async_trait]
pub trait IngestionSink: Send + Sync {
    async fn upsert_stations(&self, stations: &[Station]) -> Result<()>;

    /// Upsert readings of one station, returning the number of rows written.
    async fn upsert_readings(&self, station_id: &str, readings: &Readings) -> Result<usize>;
}

#[async_trait]
impl<T: WatermarkStore + ?Sized> WatermarkStore for Arc<T> {
    async fn latest(&self, station_id: &str, sensor_key: &str) -> Result<Option<i64>> {
        (**self).latest(station_id, sensor_key).await
    }
}

#[async_trait]
impl<T: IngestionSink + ?Sized> IngestionSink for Arc<T> {
    async fn upsert_stations(&self, stations: &[Station]) -> Result<()> {
        (**self).upsert_stations(stations).await
    }

    async fn upsert_readings(&self, station_id: &str, readings: &Readings) -> Result<usize> {
        (**self).upsert_readings(station_id, readings).await
    }
}

/// PostgreSQL-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatermarkStore for PgStore {
    async fn latest(&self, station_id: &str, sensor_key: &str) -> Result<Option<i64>> {
        // ---
        let latest = sqlx::query_scalar::<_, Option<i64>>(
            r#"
            SELECT MAX(ts_ms)
              FROM readings
             WHERE station_id = $1 AND sensor_key = $2
            "#,
        )
        .bind(station_id)
        .bind(sensor_key)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to read watermark of {station_id}/{sensor_key}"))?;

        Ok(latest)
    }
}

#[async_trait]
impl IngestionSink for PgStore {
    async fn upsert_stations(&self, stations: &[Station]) -> Result<()> {
        // ---
        let mut tx = self.pool.begin().await?;

        for station in stations {
            sqlx::query(
                r#"
                INSERT INTO stations (id, name, label, latitude, longitude, sensor_keys, last_update)
                VALUES ($1, $2, $3, $4, $5, $6, NOW())
                ON CONFLICT (id) DO UPDATE SET
                    name        = EXCLUDED.name,
                    label       = EXCLUDED.label,
                    latitude    = EXCLUDED.latitude,
                    longitude   = EXCLUDED.longitude,
                    sensor_keys = EXCLUDED.sensor_keys,
                    last_update = EXCLUDED.last_update
                "#,
            )
            .bind(&station.id)
            .bind(&station.name)
            .bind(&station.label)
            .bind(station.latitude)
            .bind(station.longitude)
            .bind(&station.sensors)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to upsert station {}", station.id))?;
        }

        tx.commit().await?;
        debug!("Upserted {} stations", stations.len());
        Ok(())
    }

    async fn upsert_readings(&self, station_id: &str, readings: &Readings) -> Result<usize> {
        // ---
        let rows: Vec<(&str, &Reading)> = readings
            .iter()
            .flat_map(|(key, series)| series.iter().map(move |r| (key.as_str(), r)))
            .collect();
        if rows.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        for batch in rows.chunks(UPSERT_BATCH_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO readings (station_id, sensor_key, ts_ms, date_value, value) ",
            );
            qb.push_values(batch, |mut row, (key, reading)| {
                row.push_bind(station_id)
                    .push_bind(*key)
                    .push_bind(reading.ts_ms)
                    .push_bind(reading.date_value)
                    .push_bind(reading.value);
            });
            qb.push(
                " ON CONFLICT (station_id, sensor_key, ts_ms) DO UPDATE SET \
                 value = EXCLUDED.value, date_value = EXCLUDED.date_value",
            );

            qb.build()
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to upsert readings of {station_id}"))?;
        }

        tx.commit().await?;

        let written = point_count(readings);
        let elapsed = started.elapsed().as_secs_f64();
        info!(
            "Stored {} readings for {} in {:.2}s ({:.1} rows/s)",
            written,
            station_id,
            elapsed,
            written as f64 / elapsed.max(f64::EPSILON)
        );
        Ok(written)
    }
}
