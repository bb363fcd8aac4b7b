//! HTTP/JSON transport for the telemetry API.
//!
//! Every endpoint is a `POST` with a JSON body. Responses share one envelope:
//! `{"status": "OK", "data": ...}` on success, any other status otherwise.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ApiError, Credentials, Session, TelemetryApi};
use crate::models::{SensorValue, Station, Telemetry, TelemetryPoint, TimeWindow};

// ---

/// Longest response excerpt kept in a [`ApiError::Rejected`] message.
const MAX_ERROR_BODY: usize = 256;

#[derive(Serialize)]
struct LoginRequest<'a> {
    login: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct DevicesRequest<'a> {
    sid: &'a str,
}

#[derive(Serialize)]
struct TelemetryRequest<'a> {
    sid: &'a str,
    devices: [&'a str; 1],
    keys: &'a [String],
    ts_from: i64,
    ts_to: i64,
}

/// Response envelope; `data` is decoded only once the status is known.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    #[serde(default)]
    sid: String,
}

#[derive(Debug, Deserialize)]
struct DeviceRecord {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    sensors: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct TelemetryRecord {
    key: String,
    ts: i64,
    #[serde(default)]
    dbl_v: Option<f64>,
    #[serde(default)]
    str_v: Option<Value>,
}

impl From<DeviceRecord> for Station {
    fn from(record: DeviceRecord) -> Self {
        Station {
            id: record.id,
            name: record.name,
            label: record.label,
            latitude: record.latitude,
            longitude: record.longitude,
            sensors: record.sensors.into_keys().collect(),
        }
    }
}

/// Interpret the `dbl_v`/`str_v` pair of a telemetry record.
///
/// A non-zero `dbl_v` wins. Otherwise `str_v` decides when present; a JSON
/// number there is numeric, anything else is text. A zero `dbl_v` with no
/// `str_v` is a genuine zero reading.
fn decode_value(dbl_v: Option<f64>, str_v: Option<Value>) -> SensorValue {
    // ---
    match (dbl_v, str_v) {
        (Some(v), _) if v != 0.0 => SensorValue::Numeric(v),
        (_, Some(Value::Number(n))) => match n.as_f64() {
            Some(v) => SensorValue::Numeric(v),
            None => SensorValue::Text(n.to_string()),
        },
        (_, Some(Value::String(s))) => SensorValue::Text(s),
        (Some(v), None) | (Some(v), Some(Value::Null)) => SensorValue::Numeric(v),
        (None, None) | (None, Some(Value::Null)) => SensorValue::Text(String::new()),
        (_, Some(other)) => SensorValue::Text(other.to_string()),
    }
}

/// Group records by sensor key, each series sorted by timestamp.
fn group_records(records: Vec<TelemetryRecord>) -> Telemetry {
    // ---
    let mut telemetry = Telemetry::new();
    for record in records {
        telemetry
            .entry(record.key)
            .or_default()
            .push(TelemetryPoint {
                ts: record.ts,
                value: decode_value(record.dbl_v, record.str_v),
            });
    }
    for points in telemetry.values_mut() {
        points.sort_by_key(|p| p.ts);
    }
    telemetry
}

fn excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    text.chars().take(MAX_ERROR_BODY).collect()
}

/// [`TelemetryApi`] over HTTP using `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    /// Build a transport whose every request is bounded by `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        // ---
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(30)))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B>(&self, path: &str, body: &B) -> Result<Envelope, ApiError>
    where
        B: Serialize + ?Sized,
    {
        // ---
        let url = format!("{}/{}", self.base_url, path);
        tracing::debug!("POST {}", url);

        let response = self.http.post(&url).json(body).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            return Err(ApiError::Rejected {
                status: status.as_u16().to_string(),
                message: excerpt(&bytes),
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(format!("{path}: {e}")))
    }

    /// Unwrap a list envelope, treating any status but `OK` as a rejection.
    /// A missing or null `data` is an empty list.
    fn accepted<T: DeserializeOwned>(envelope: Envelope, path: &str) -> Result<Vec<T>, ApiError> {
        // ---
        if !envelope.status.eq_ignore_ascii_case("ok") {
            return Err(ApiError::Rejected {
                status: envelope.status,
                message: envelope.error.unwrap_or_default(),
            });
        }
        match envelope.data {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(data) => {
                serde_json::from_value(data).map_err(|e| ApiError::Decode(format!("{path}: {e}")))
            }
        }
    }
}

#[async_trait]
impl TelemetryApi for HttpApi {
    async fn login(&self, credentials: &Credentials) -> Result<String, ApiError> {
        // ---
        let request = LoginRequest {
            login: &credentials.login,
            password: &credentials.password,
        };
        let envelope = self.post("login", &request).await?;

        if envelope.status.eq_ignore_ascii_case("error") {
            return Err(ApiError::Rejected {
                status: envelope.status,
                message: envelope.error.unwrap_or_else(|| "authentication failed".into()),
            });
        }

        let data = envelope
            .data
            .and_then(|data| serde_json::from_value::<LoginData>(data).ok());
        match data {
            Some(data) if !data.sid.is_empty() => Ok(data.sid),
            _ => Err(ApiError::MissingSession),
        }
    }

    async fn list_devices(&self, session: &Session) -> Result<Vec<Station>, ApiError> {
        // ---
        let request = DevicesRequest {
            sid: session.token(),
        };
        let envelope = self.post("devices", &request).await?;
        let records: Vec<DeviceRecord> = Self::accepted(envelope, "devices")?;

        Ok(records.into_iter().map(Station::from).collect())
    }

    async fn query_telemetry(
        &self,
        session: &Session,
        station_id: &str,
        sensor_keys: &[String],
        window: TimeWindow,
    ) -> Result<Telemetry, ApiError> {
        // ---
        let request = TelemetryRequest {
            sid: session.token(),
            devices: [station_id],
            keys: sensor_keys,
            ts_from: window.from(),
            ts_to: window.to(),
        };
        let envelope = self.post("telemetry", &request).await?;
        let records: Vec<TelemetryRecord> = Self::accepted(envelope, "telemetry")?;

        Ok(group_records(records))
    }
}
