//! Session and credential management for the panel

mod store;
mod token;

use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use url::Url;

use crate::config::IdentityConfig;
use crate::error::Error;

pub use store::{MemoryTokenStore, StoredTokens, TokenStore, ID_TOKEN_KEY, REFRESH_TOKEN_KEY};
pub use token::Credential;

/// Authentication state of the panel
///
/// There is exactly one instance per panel, owned and mutated only by
/// [`SessionManager`].
#[derive(Debug, Clone)]
pub enum SessionState {
    Unauthenticated,
    Authenticated(Credential),
}

/// Shape of the token endpoint's refresh response
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
}

/// Obtains, refreshes and tears down the session credential
///
/// The manager produces a currently valid [`Credential`] or transitions to
/// [`SessionState::Unauthenticated`]; it never hands out an expired token.
pub struct SessionManager {
    /// Identity provider settings
    config: IdentityConfig,

    /// HTTP client used for the refresh exchange
    http_client: Client,

    /// Persistence backend for the raw token strings
    store: Arc<dyn TokenStore>,

    /// The single session state
    state: RwLock<SessionState>,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(config: IdentityConfig, http_client: Client, store: Arc<dyn TokenStore>) -> Self {
        Self {
            config,
            http_client,
            store,
            state: RwLock::new(SessionState::Unauthenticated),
        }
    }

    /// Get the current session state
    pub fn state(&self) -> SessionState {
        let guard = self.state.read().unwrap();
        guard.clone()
    }

    /// Whether a credential is currently held
    pub fn is_authenticated(&self) -> bool {
        matches!(self.state(), SessionState::Authenticated(_))
    }

    /// Consume tokens delivered in a redirect fragment
    ///
    /// Parses `id_token` (and `refresh_token` when present) from the portion
    /// of the URL after `#`, persists them and adopts the session. When this
    /// returns `Some` the caller must strip the fragment from the visible
    /// address so a reload does not re-consume it. An undecodable token is
    /// ignored and yields `None`.
    pub fn extract_from_redirect(&self, fragment: &str) -> Option<Credential> {
        let fragment = fragment.trim_start_matches('#');

        let mut id_token = None;
        let mut refresh_token = None;
        for (key, value) in url::form_urlencoded::parse(fragment.as_bytes()) {
            match key.as_ref() {
                "id_token" => id_token = Some(value.into_owned()),
                "refresh_token" => refresh_token = Some(value.into_owned()),
                _ => {}
            }
        }

        let id_token = id_token?;
        match Credential::from_parts(&id_token, refresh_token.as_deref()) {
            Ok(credential) => {
                self.adopt(credential.clone());
                debug!("session adopted from redirect fragment");
                Some(credential)
            }
            Err(err) => {
                warn!("ignoring undecodable token from redirect: {}", err);
                None
            }
        }
    }

    /// Produce a currently valid credential
    ///
    /// Returns the held or stored credential when unexpired. An expired
    /// credential with a refresh token triggers one refresh exchange; on any
    /// refresh failure the store is cleared and the call fails with
    /// [`Error::AuthExpired`]. Expired or absent without a refresh path fails
    /// with [`Error::AuthExpired`] directly — whether to redirect to login is
    /// the caller's decision.
    pub async fn ensure_valid(&self) -> Result<Credential, Error> {
        let credential = match self.available_credential() {
            Some(credential) => credential,
            None => return Err(Error::AuthExpired),
        };

        if !credential.is_expired() {
            return Ok(credential);
        }

        match credential.refresh_token {
            Some(_) => self.refresh_current().await,
            None => Err(Error::AuthExpired),
        }
    }

    /// Exchange the current refresh token for a fresh id token
    ///
    /// Also used by the API layer for its single retry after a 401. Any
    /// failure (network, non-2xx, malformed response or token) tears the
    /// session down and surfaces as [`Error::AuthExpired`].
    pub(crate) async fn refresh_current(&self) -> Result<Credential, Error> {
        let refresh_token = match self.available_credential().and_then(|c| c.refresh_token) {
            Some(token) => token,
            None => return Err(Error::AuthExpired),
        };

        match self.refresh_exchange(&refresh_token).await {
            Ok(credential) => {
                self.adopt(credential.clone());
                debug!("session refreshed");
                Ok(credential)
            }
            Err(err) => {
                warn!("refresh exchange failed, clearing session: {}", err);
                self.clear_session();
                Err(Error::AuthExpired)
            }
        }
    }

    async fn refresh_exchange(&self, refresh_token: &str) -> Result<Credential, Error> {
        let url = format!("{}/oauth2/token", self.config.auth_base_url);

        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];

        let response = self.http_client.post(&url).form(&form).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::api(status, body));
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|err| Error::malformed_token(err.to_string()))?;

        // the provider does not rotate the refresh token on this grant
        Credential::from_parts(&refreshed.id_token, Some(refresh_token))
    }

    /// Compose the login redirect URL
    ///
    /// Pure URL composition against the authorize endpoint; no network call.
    pub fn login_url(&self) -> Result<String, Error> {
        let url = Url::parse_with_params(
            &format!("{}/login", self.config.auth_base_url),
            &[
                ("client_id", self.config.client_id.as_str()),
                ("response_type", self.config.response_type.as_str()),
                ("scope", self.config.scope.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ],
        )?;

        Ok(url.into())
    }

    /// Log out and compose the provider's logout redirect URL
    ///
    /// Clears the store and the in-memory state; calling it again is a no-op
    /// that returns the same URL.
    pub fn logout(&self) -> Result<String, Error> {
        self.clear_session();

        let url = Url::parse_with_params(
            &format!("{}/logout", self.config.auth_base_url),
            &[
                ("client_id", self.config.client_id.as_str()),
                ("logout_uri", self.config.redirect_uri.as_str()),
            ],
        )?;

        Ok(url.into())
    }

    /// Drop the credential from memory and storage
    pub(crate) fn clear_session(&self) {
        self.store.clear();
        let mut guard = self.state.write().unwrap();
        *guard = SessionState::Unauthenticated;
    }

    /// The held or stored credential, regardless of expiry
    ///
    /// A stored token that no longer decodes is treated as absent and
    /// dropped from the store, never surfaced as an error.
    pub(crate) fn available_credential(&self) -> Option<Credential> {
        if let SessionState::Authenticated(credential) = self.state() {
            return Some(credential);
        }

        let stored = self.store.load()?;
        match Credential::from_parts(&stored.id_token, stored.refresh_token.as_deref()) {
            Ok(credential) => {
                let mut guard = self.state.write().unwrap();
                *guard = SessionState::Authenticated(credential.clone());
                Some(credential)
            }
            Err(err) => {
                warn!("stored token no longer decodes, discarding: {}", err);
                self.store.clear();
                None
            }
        }
    }

    fn adopt(&self, credential: Credential) {
        self.store.save(&StoredTokens {
            id_token: credential.id_token.clone(),
            refresh_token: credential.refresh_token.clone(),
        });
        let mut guard = self.state.write().unwrap();
        *guard = SessionState::Authenticated(credential);
    }
}
