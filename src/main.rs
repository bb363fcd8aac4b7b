//! Application entry point for the `fieldsync` telemetry sync service.
//!
//! Startup sequence:
//! - Load configuration from environment variables or `.env`
//! - Initialize structured logging/tracing
//! - Log in to the telemetry API (fatal on failure)
//! - Establish a PostgreSQL connection pool and create the schema
//! - Spawn the sync scheduler
//! - Serve `/health` and `/sync/status` until SIGINT/SIGTERM
//!
//! # Environment Variables
//! - `DATABASE_URL`, `API_LOGIN`, `API_PASSWORD` (**required**)
//! - `API_BASE_URL`, `API_TIMEOUT_SECS`, `COLLECTION_INTERVAL`, `SENSOR_KEYS`,
//!   `DB_POOL_MAX`, `DB_ACQUIRE_TIMEOUT_SECS`, `DB_CALL_TIMEOUT_SECS`,
//!   `HTTP_PORT` (optional)
//! - `LOG_LEVEL` (optional) – log verbosity (default: `info`)
//! - `LOG_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! Each concern lives in its own module: settings in `config`, the remote API
//! in `client`, persistence in `store` and `schema`, the cycle in `sync`, its
//! timing in `scheduler` and the HTTP surface in `routes`.
use std::{env, net::SocketAddr, str::FromStr};

use anyhow::{Context, Result};
use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

mod client;
mod config;
mod models;
mod planner;
mod routes;
mod scheduler;
mod schema;
mod store;
mod sync;

#[cfg(test)]
mod testing;

use client::{HttpApi, TelemetryClient};
use scheduler::SharedStatus;
use store::PgStore;
use sync::Synchronizer;

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let api = HttpApi::new(&cfg.api_url, cfg.api_timeout)
        .context("Failed to build telemetry API client")?;
    let mut client = TelemetryClient::new(api, cfg.credentials());
    client
        .login()
        .await
        .context("Initial login to the telemetry API failed")?;
    tracing::info!("Logged in to {}", cfg.api_url);

    // Server side limit per statement; the sync worker also bounds each call.
    let connect_options = PgConnectOptions::from_str(&cfg.db_url)
        .context("Invalid DATABASE_URL")?
        .options([(
            "statement_timeout",
            format!("{}ms", cfg.db_call_timeout.as_millis()),
        )]);

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .acquire_timeout(cfg.db_acquire_timeout)
        .connect_with(connect_options)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    let cancel = CancellationToken::new();
    let status = SharedStatus::default();

    let sync = Synchronizer::new(client, PgStore::new(pool), cfg.sensor_keys.clone())
        .with_store_timeout(cfg.db_call_timeout);
    let worker = tokio::spawn(scheduler::run(
        sync,
        cfg.collection_interval(),
        cancel.clone(),
        status.clone(),
    ));

    tokio::spawn(watch_shutdown(cancel.clone()));

    // Build app from routes gateway
    let app: Router = routes::router(status);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await?;

    worker.await.context("Sync worker panicked")?;
    tracing::info!("Shutdown complete");

    Ok(())
}

// ---

/// Cancel `cancel` on SIGINT or, on unix, SIGTERM.
async fn watch_shutdown(cancel: CancellationToken) {
    // ---
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown requested, finishing current window");
    cancel.cancel();
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `LOG_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by `RUST_LOG`, or else the `LOG_LEVEL` env var
///
/// Call once at startup, before any logging macro runs.
fn init_tracing() {
    // ---
    let span_events = match env::var("LOG_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn,hyper=info,reqwest=info"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
