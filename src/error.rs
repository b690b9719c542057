//! Error handling for the panel core

use std::fmt;
use thiserror::Error;

/// Unified error type for the panel core
///
/// Every public entry point resolves to a success value or one of these
/// kinds; nothing here is fatal to the process. `AuthExpired` means the UI
/// must return to the login view, everything else is retryable.
#[derive(Error, Debug)]
pub enum Error {
    /// No valid credential is obtainable; the user must log in again
    #[error("authentication expired, please log in again")]
    AuthExpired,

    /// A bearer token whose claims payload could not be decoded
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// Transport or connectivity failure
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The control API rejected the request
    #[error("api error (status {status}): {body}")]
    Api { status: u16, body: String },

    /// URL composition errors from misconfiguration
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
}

impl Error {
    /// Create a new malformed-token error
    pub fn malformed_token<T: fmt::Display>(msg: T) -> Self {
        Error::MalformedToken(msg.to_string())
    }

    /// Create a new API error
    pub fn api(status: u16, body: impl Into<String>) -> Self {
        Error::Api {
            status,
            body: body.into(),
        }
    }

    /// Whether this error forces a return to the login view
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Error::AuthExpired | Error::MalformedToken(_))
    }
}
