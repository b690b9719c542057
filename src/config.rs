//! Configuration for the panel core

use std::time::Duration;

/// Identity provider settings (Cognito-style hosted UI)
///
/// All three endpoints hang off a single `auth_base_url`:
/// `{base}/login`, `{base}/oauth2/token` and `{base}/logout`.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Origin of the hosted login UI, without a trailing slash
    pub auth_base_url: String,

    /// OAuth client id
    pub client_id: String,

    /// Where the provider redirects back to after login and logout
    pub redirect_uri: String,

    /// OAuth response type requested on login
    pub response_type: String,

    /// OAuth scope requested on login
    pub scope: String,
}

impl IdentityConfig {
    pub fn new(auth_base_url: &str, client_id: &str, redirect_uri: &str) -> Self {
        Self {
            auth_base_url: auth_base_url.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            redirect_uri: redirect_uri.to_string(),
            response_type: "token".to_string(),
            scope: "openid".to_string(),
        }
    }

    /// Set the OAuth response type
    pub fn with_response_type(mut self, value: &str) -> Self {
        self.response_type = value.to_string();
        self
    }

    /// Set the OAuth scope
    pub fn with_scope(mut self, value: &str) -> Self {
        self.scope = value.to_string();
        self
    }
}

/// Control API settings
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL of the control API, without a trailing slash
    pub base_url: String,

    /// Path of the status endpoint
    pub status_path: String,

    /// Path of the start endpoint
    pub start_path: String,

    /// Path of the stop endpoint
    pub stop_path: String,

    /// Path of the delete endpoint
    pub delete_path: String,
}

impl ApiConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            status_path: "/server-status".to_string(),
            start_path: "/start-server".to_string(),
            stop_path: "/stop-server".to_string(),
            delete_path: "/delete-server".to_string(),
        }
    }

    /// Set the status endpoint path
    pub fn with_status_path(mut self, value: &str) -> Self {
        self.status_path = value.to_string();
        self
    }

    /// Set the start endpoint path
    pub fn with_start_path(mut self, value: &str) -> Self {
        self.start_path = value.to_string();
        self
    }

    /// Set the stop endpoint path
    pub fn with_stop_path(mut self, value: &str) -> Self {
        self.stop_path = value.to_string();
        self
    }

    /// Set the delete endpoint path
    pub fn with_delete_path(mut self, value: &str) -> Self {
        self.delete_path = value.to_string();
        self
    }
}

/// Configuration for the whole panel
#[derive(Debug, Clone)]
pub struct PanelConfig {
    /// Identity provider settings
    pub identity: IdentityConfig,

    /// Control API settings
    pub api: ApiConfig,

    /// Cadence of the periodic status poll
    pub poll_interval: Duration,

    /// Port appended to the server address shown to the user
    pub game_port: u16,
}

impl PanelConfig {
    pub fn new(identity: IdentityConfig, api: ApiConfig) -> Self {
        Self {
            identity,
            api,
            poll_interval: Duration::from_secs(30),
            game_port: 25565,
        }
    }

    /// Set the periodic poll cadence
    pub fn with_poll_interval(mut self, value: Duration) -> Self {
        self.poll_interval = value;
        self
    }

    /// Set the game port shown next to the server address
    pub fn with_game_port(mut self, value: u16) -> Self {
        self.game_port = value;
        self
    }
}
