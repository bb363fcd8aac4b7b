//! HTTP gateway: merges the per-endpoint subrouters into one [`Router`].

use axum::Router;

use crate::scheduler::SharedStatus;

mod get_status;
mod health;

// ---

pub fn router(status: SharedStatus) -> Router {
    // ---
    Router::new()
        .merge(get_status::router())
        .merge(health::router())
        .with_state(status)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::client::{Credentials, TelemetryClient};
    use crate::sync::{CycleReport, Synchronizer};
    use crate::testing::{sample_station, FakeApi, MemoryStore};
    use serde_json::Value;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn serve(status: SharedStatus) -> String {
        // ---
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(status)).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn finished_cycle() -> CycleReport {
        // ---
        let api = Arc::new(FakeApi::with_stations(vec![sample_station("S1")]));
        let client = TelemetryClient::new(
            api,
            Credentials {
                login: "user".to_string(),
                password: "secret".to_string(),
            },
        );
        let mut sync = Synchronizer::new(
            client,
            Arc::new(MemoryStore::default()),
            vec!["airtemp".to_string()],
        );
        sync.run_cycle(&CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_health_ok_before_first_cycle() {
        // ---
        let base = serve(SharedStatus::default()).await;
        let body: Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "status": "ok",
                "last_cycle_finished_at": null,
                "last_cycle_age_secs": null
            })
        );
    }

    #[tokio::test]
    async fn test_health_reports_last_cycle_age() {
        // ---
        let status = SharedStatus::default();
        let mut report = finished_cycle().await;
        report.finished_at = Some(chrono::Utc::now() - chrono::Duration::seconds(120));
        *status.write().await = Some(report);

        let base = serve(status).await;
        let body: Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["status"], "ok");
        assert!(body["last_cycle_finished_at"].is_string());
        let age = body["last_cycle_age_secs"].as_i64().unwrap();
        assert!((120..130).contains(&age), "age was {age}");
    }

    #[tokio::test]
    async fn test_status_null_before_first_cycle() {
        // ---
        let base = serve(SharedStatus::default()).await;
        let resp = reqwest::get(format!("{base}/sync/status")).await.unwrap();
        assert!(resp.status().is_success());
        let body: Value = resp.json().await.unwrap();
        assert!(body.is_null());
    }

    #[tokio::test]
    async fn test_status_reports_last_cycle() {
        // ---
        let status = SharedStatus::default();
        let report = finished_cycle().await;
        let cycle_id = report.cycle_id.to_string();
        *status.write().await = Some(report);

        let base = serve(Arc::clone(&status)).await;
        let body: Value = reqwest::get(format!("{base}/sync/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["cycle_id"], Value::String(cycle_id));
        assert_eq!(body["devices"], 1);
        assert_eq!(body["devices_synced"], 1);
        assert!(body["aborted"].is_null());
    }
}
