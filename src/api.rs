//! Authenticated access to the control API

use log::{debug, warn};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

use crate::auth::SessionManager;
use crate::config::ApiConfig;
use crate::error::Error;

/// Synthetic status for 2xx responses whose body does not parse
pub const PARSE_FAILURE_STATUS: u16 = 599;

/// The fixed allow-list of control API endpoints
///
/// Each endpoint carries its verb, so an endpoint/method mismatch is
/// unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Status,
    Start,
    Stop,
    Delete,
}

impl Endpoint {
    /// The HTTP verb this endpoint is called with
    pub fn method(&self) -> Method {
        match self {
            Endpoint::Status => Method::GET,
            Endpoint::Start | Endpoint::Stop => Method::POST,
            Endpoint::Delete => Method::DELETE,
        }
    }

    fn path<'a>(&self, config: &'a ApiConfig) -> &'a str {
        match self {
            Endpoint::Status => &config.status_path,
            Endpoint::Start => &config.start_path,
            Endpoint::Stop => &config.stop_path,
            Endpoint::Delete => &config.delete_path,
        }
    }
}

/// Observed server state
///
/// `Running` and `Stopped` come off the wire; `Unknown` is what the panel
/// shows before the first poll resolves. An unrecognized wire value is a
/// schema mismatch, not `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    Running,
    Stopped,
    #[serde(skip)]
    Unknown,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Running => write!(f, "RUNNING"),
            ServerStatus::Stopped => write!(f, "STOPPED"),
            ServerStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Body of the status endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    /// Authoritative server state
    pub status: ServerStatus,

    /// Network address, present only while running
    pub ip_address: Option<String>,
}

/// Uniform authenticated HTTP access to the control API
///
/// Every call obtains a valid credential first, attaches exactly one bearer
/// authorization header, and maps failures onto the panel error taxonomy.
/// Side effects are confined to network I/O and, on 401, session teardown.
pub struct ApiClient {
    /// Control API settings
    config: ApiConfig,

    /// HTTP client used for requests
    http_client: Client,

    /// Source of the bearer credential
    session: Arc<SessionManager>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(config: ApiConfig, http_client: Client, session: Arc<SessionManager>) -> Self {
        Self {
            config,
            http_client,
            session,
        }
    }

    /// Issue an authenticated call and return the parsed JSON body
    ///
    /// Transport failures surface as [`Error::Network`] and are never
    /// retried. A 401 is retried exactly once after a refresh exchange when
    /// a refresh token exists; otherwise the session is torn down and the
    /// call fails with [`Error::AuthExpired`]. Any other non-2xx is an
    /// [`Error::Api`]; a 2xx body that fails to parse is an [`Error::Api`]
    /// with a synthetic status.
    pub async fn call(&self, endpoint: Endpoint) -> Result<serde_json::Value, Error> {
        let credential = self.session.ensure_valid().await?;

        let response = self.dispatch(endpoint, &credential.id_token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            if credential.refresh_token.is_none() {
                warn!("control api rejected the token, tearing down the session");
                self.session.clear_session();
                return Err(Error::AuthExpired);
            }

            // one refresh-and-retry, then give up
            let fresh = self.session.refresh_current().await?;
            debug!("retrying {:?} after refresh", endpoint);
            let retry = self.dispatch(endpoint, &fresh.id_token).await?;
            if retry.status() == StatusCode::UNAUTHORIZED {
                self.session.clear_session();
                return Err(Error::AuthExpired);
            }
            return Self::parse_body(retry).await;
        }

        Self::parse_body(response).await
    }

    /// Fetch and validate the current server status
    pub async fn server_status(&self) -> Result<StatusResponse, Error> {
        let body = self.call(Endpoint::Status).await?;

        // validate the shape at the boundary; a mismatch is an API error
        serde_json::from_value(body)
            .map_err(|err| Error::api(PARSE_FAILURE_STATUS, err.to_string()))
    }

    /// Request a server start
    pub async fn start_server(&self) -> Result<(), Error> {
        self.call(Endpoint::Start).await.map(|_| ())
    }

    /// Request a server stop
    pub async fn stop_server(&self) -> Result<(), Error> {
        self.call(Endpoint::Stop).await.map(|_| ())
    }

    /// Request a server deletion
    pub async fn delete_server(&self) -> Result<(), Error> {
        self.call(Endpoint::Delete).await.map(|_| ())
    }

    async fn dispatch(&self, endpoint: Endpoint, token: &str) -> Result<Response, Error> {
        let url = format!("{}{}", self.config.base_url, endpoint.path(&self.config));

        let response = self
            .http_client
            .request(endpoint.method(), &url)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .send()
            .await?;

        Ok(response)
    }

    async fn parse_body(response: Response) -> Result<serde_json::Value, Error> {
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::api(status.as_u16(), body));
        }

        let text = response.text().await?;
        if text.is_empty() {
            // 2xx with no body, common for the command endpoints
            return Ok(serde_json::Value::Null);
        }

        serde_json::from_str(&text).map_err(|err| Error::api(PARSE_FAILURE_STATUS, err.to_string()))
    }
}
