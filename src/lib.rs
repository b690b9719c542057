//! Control panel core for a hosted Minecraft server
//!
//! This crate is the session lifecycle and server-lifecycle state machine
//! behind a browser-resident control panel: it obtains and refreshes the
//! login credential, issues authenticated calls against the control API,
//! polls the server status and derives which actions the UI may offer.
//! Rendering, button wiring and the confirmation dialog belong to the host.

pub mod api;
pub mod auth;
pub mod config;
pub mod controller;
pub mod error;

use reqwest::Client;
use std::sync::Arc;

use crate::api::ApiClient;
use crate::auth::{MemoryTokenStore, SessionManager, TokenStore};
use crate::config::PanelConfig;
use crate::controller::LifecycleController;
use crate::error::Error;

/// Outcome of loading the panel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// No usable credential; show the login view, no API call was made
    LoginRequired,

    /// A session is active and polling has started
    Authenticated {
        /// The redirect fragment was consumed and must be stripped from the
        /// visible address so a reload does not re-consume it
        clear_fragment: bool,
    },
}

/// The main entry point for the panel core
///
/// Wires one [`SessionManager`], [`ApiClient`] and [`LifecycleController`]
/// around a shared HTTP client, and exposes the surface the UI adapter
/// talks to.
///
/// # Example
///
/// ```
/// use mc_server_panel::Panel;
/// use mc_server_panel::config::{ApiConfig, IdentityConfig, PanelConfig};
///
/// let config = PanelConfig::new(
///     IdentityConfig::new(
///         "https://login.auth.eu-west-1.amazoncognito.com",
///         "client-id",
///         "https://panel.example.com",
///     ),
///     ApiConfig::new("https://api.example.com/prod"),
/// );
/// let panel = Panel::new(config);
/// let _states = panel.subscribe();
/// ```
pub struct Panel {
    session: Arc<SessionManager>,
    controller: Arc<LifecycleController>,
}

impl Panel {
    /// Create a panel with the default in-memory token store
    pub fn new(config: PanelConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryTokenStore::new()))
    }

    /// Create a panel with a caller-supplied token store
    ///
    /// Hosts that can reach session-scoped browser storage plug it in here
    /// so the session survives a page reload.
    pub fn with_store(config: PanelConfig, store: Arc<dyn TokenStore>) -> Self {
        let http_client = Client::new();

        let session = Arc::new(SessionManager::new(
            config.identity.clone(),
            http_client.clone(),
            store,
        ));
        let api = Arc::new(ApiClient::new(
            config.api.clone(),
            http_client,
            session.clone(),
        ));
        let controller = Arc::new(LifecycleController::new(
            api,
            session.clone(),
            config.poll_interval,
            config.game_port,
        ));

        Self {
            session,
            controller,
        }
    }

    /// Load the panel, consuming a redirect fragment when one is present
    ///
    /// With a usable credential (fresh, or refreshable) the periodic poll
    /// starts and the first poll fires immediately. Without one the
    /// signed-out state is published and nothing touches the network.
    pub fn init(&self, fragment: Option<&str>) -> InitOutcome {
        let consumed = fragment
            .and_then(|f| self.session.extract_from_redirect(f))
            .is_some();

        let usable = match self.session.available_credential() {
            Some(credential) => !credential.is_expired() || credential.refresh_token.is_some(),
            None => false,
        };

        if usable {
            self.controller.start_polling();
            InitOutcome::Authenticated {
                clear_fragment: consumed,
            }
        } else {
            self.controller.reset_to_signed_out();
            InitOutcome::LoginRequired
        }
    }

    /// Compose the login redirect URL; the host performs the redirect
    pub fn login_url(&self) -> Result<String, Error> {
        self.session.login_url()
    }

    /// Log out: stop polling, clear the session, return the logout URL
    pub fn logout(&self) -> Result<String, Error> {
        self.controller.reset_to_signed_out();
        self.session.logout()
    }

    /// Start the server (see [`LifecycleController::start`])
    pub async fn start(&self) -> Result<(), Error> {
        self.controller.start().await
    }

    /// Stop the server (see [`LifecycleController::stop`])
    pub async fn stop(&self) -> Result<(), Error> {
        self.controller.stop().await
    }

    /// Delete the server after UI-side confirmation
    /// (see [`LifecycleController::confirmed_delete`])
    pub async fn confirmed_delete(&self) -> Result<(), Error> {
        self.controller.confirmed_delete().await
    }

    /// Trigger an immediate status poll
    pub async fn poll(&self) -> Result<(), Error> {
        self.controller.poll().await
    }

    /// Subscribe to published panel state changes
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<controller::PanelState> {
        self.controller.subscribe()
    }

    /// The most recently published panel state
    pub fn state(&self) -> controller::PanelState {
        self.controller.current_state()
    }

    /// The session manager, for hosts that need direct access
    pub fn session(&self) -> &SessionManager {
        &self.session
    }
}

/// A convenience module for common imports
pub mod prelude {
    pub use crate::api::ServerStatus;
    pub use crate::config::{ApiConfig, IdentityConfig, PanelConfig};
    pub use crate::controller::PanelState;
    pub use crate::error::Error;
    pub use crate::{InitOutcome, Panel};
}
