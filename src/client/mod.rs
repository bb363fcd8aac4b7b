//! Telemetry API client.
//!
//! [`TelemetryClient`] owns the API session. The transport behind it is a
//! [`TelemetryApi`] implementation ([`HttpApi`] in production) that receives
//! the current [`Session`] by reference on every call and never stores it.
//!
//! Any data call rejected by the remote side is treated as an expired
//! session: the client logs in again and repeats that exact call once. A
//! second rejection is returned to the caller, so a remote side failing for
//! unrelated reasons cannot keep the client in a login loop.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::models::{Station, Telemetry, TimeWindow};

mod http;

pub use http::HttpApi;

// ---

/// Errors reported by a [`TelemetryApi`] transport.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote side answered with a non-success status.
    #[error("remote rejected request (status {status}): {message}")]
    Rejected { status: String, message: String },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("login response carried no session token")]
    MissingSession,
}

impl ApiError {
    /// Whether the failure should be answered with a fresh login.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ApiError::Rejected { .. })
    }
}

/// Errors surfaced by [`TelemetryClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("login failed: {0}")]
    Login(#[source] ApiError),

    #[error("{op} failed: {source}")]
    Request {
        op: &'static str,
        #[source]
        source: ApiError,
    },

    #[error("{op} failed again after re-authentication: {source}")]
    RetryFailed {
        op: &'static str,
        #[source]
        source: ApiError,
    },
}

/// API account credentials.
#[derive(Clone)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"****")
            .finish()
    }
}

/// An authenticated API session.
#[derive(Debug, Clone)]
pub struct Session {
    token: String,
    opened_at: DateTime<Utc>,
}

impl Session {
    pub fn new(token: String) -> Self {
        Self {
            token,
            opened_at: Utc::now(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }
}

/// Raw access to the remote telemetry API.
#[async_trait]
pub trait TelemetryApi: Send + Sync {
    /// Authenticate and return a session token.
    async fn login(&self, credentials: &Credentials) -> Result<String, ApiError>;

    /// List every station visible to the session.
    async fn list_devices(&self, session: &Session) -> Result<Vec<Station>, ApiError>;

    /// Fetch the given sensors of one station within `window`.
    async fn query_telemetry(
        &self,
        session: &Session,
        station_id: &str,
        sensor_keys: &[String],
        window: TimeWindow,
    ) -> Result<Telemetry, ApiError>;
}

#[async_trait]
impl<T: TelemetryApi + ?Sized> TelemetryApi for Arc<T> {
    async fn login(&self, credentials: &Credentials) -> Result<String, ApiError> {
        (**self).login(credentials).await
    }

    async fn list_devices(&self, session: &Session) -> Result<Vec<Station>, ApiError> {
        (**self).list_devices(session).await
    }

    async fn query_telemetry(
        &self,
        session: &Session,
        station_id: &str,
        sensor_keys: &[String],
        window: TimeWindow,
    ) -> Result<Telemetry, ApiError> {
        (**self)
            .query_telemetry(session, station_id, sensor_keys, window)
            .await
    }
}

/// Session-managing client over a [`TelemetryApi`] transport.
pub struct TelemetryClient<A> {
    api: A,
    credentials: Credentials,
    session: Option<Session>,
}

impl<A: TelemetryApi> TelemetryClient<A> {
    // ---
    pub fn new(api: A, credentials: Credentials) -> Self {
        Self {
            api,
            credentials,
            session: None,
        }
    }

    /// Open a new session, replacing any existing one.
    pub async fn login(&mut self) -> Result<(), ClientError> {
        // ---
        self.open_session().await.map(|_| ())
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// List all stations.
    pub async fn devices(&mut self) -> Result<Vec<Station>, ClientError> {
        // ---
        const OP: &str = "list_devices";

        let session = self.current_session().await?;
        let first = self.api.list_devices(&session).await;
        match first {
            Ok(stations) => Ok(stations),
            Err(e) if e.is_session_expired() => {
                let session = self.reauthenticate(OP, &e).await?;
                self.api
                    .list_devices(&session)
                    .await
                    .map_err(|source| ClientError::RetryFailed { op: OP, source })
            }
            Err(source) => Err(ClientError::Request { op: OP, source }),
        }
    }

    /// Fetch telemetry of `sensor_keys` for one station within `window`.
    pub async fn telemetry(
        &mut self,
        station_id: &str,
        sensor_keys: &[String],
        window: TimeWindow,
    ) -> Result<Telemetry, ClientError> {
        // ---
        const OP: &str = "query_telemetry";

        let session = self.current_session().await?;
        let first = self
            .api
            .query_telemetry(&session, station_id, sensor_keys, window)
            .await;
        match first {
            Ok(telemetry) => Ok(telemetry),
            Err(e) if e.is_session_expired() => {
                let session = self.reauthenticate(OP, &e).await?;
                self.api
                    .query_telemetry(&session, station_id, sensor_keys, window)
                    .await
                    .map_err(|source| ClientError::RetryFailed { op: OP, source })
            }
            Err(source) => Err(ClientError::Request { op: OP, source }),
        }
    }

    async fn current_session(&mut self) -> Result<Session, ClientError> {
        // ---
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }
        self.open_session().await
    }

    async fn reauthenticate(
        &mut self,
        op: &'static str,
        cause: &ApiError,
    ) -> Result<Session, ClientError> {
        // ---
        warn!("{} rejected, treating session as expired: {}", op, cause);
        self.session = None;
        self.open_session().await
    }

    async fn open_session(&mut self) -> Result<Session, ClientError> {
        // ---
        debug!("Logging in to telemetry API as {}", self.credentials.login);
        let token = self
            .api
            .login(&self.credentials)
            .await
            .map_err(ClientError::Login)?;

        let session = Session::new(token);
        info!("Telemetry API session opened at {}", session.opened_at());
        self.session = Some(session.clone());
        Ok(session)
    }
}
