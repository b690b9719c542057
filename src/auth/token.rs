//! Bearer credential and expiry handling

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Error;

/// The claims we read from the id token payload
///
/// The signature is not verified here; that is the backend's job. We only
/// need `exp` to decide whether the token may still be attached to requests.
#[derive(Debug, Deserialize)]
struct Claims {
    exp: i64,
}

/// An authenticated session credential
///
/// Constructed through [`Credential::from_parts`], which decodes the expiry
/// claim up front, so an instance always knows when it lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// The bearer id token
    pub id_token: String,

    /// Refresh token, when the identity provider issued one
    pub refresh_token: Option<String>,

    /// Expiry instant as Unix seconds, decoded from the token's `exp` claim
    pub expires_at: i64,
}

impl Credential {
    /// Build a credential from raw token strings
    ///
    /// Fails with [`Error::MalformedToken`] when the id token's claims
    /// payload cannot be decoded; callers treat that the same as an absent
    /// credential (fail safe, not fail open).
    pub fn from_parts(id_token: &str, refresh_token: Option<&str>) -> Result<Self, Error> {
        let expires_at = decode_expiry(id_token)?;

        Ok(Self {
            id_token: id_token.to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at,
        })
    }

    /// Check whether the credential has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_now())
    }

    /// Check expiry against an explicit clock, in Unix seconds
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// Decode the `exp` claim from a JWT without verifying its signature
///
/// Any shape problem is a [`Error::MalformedToken`]: missing payload
/// segment, invalid base64url, or claims JSON without a numeric `exp`.
pub(crate) fn decode_expiry(token: &str) -> Result<i64, Error> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::malformed_token("missing claims segment"))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(Error::malformed_token)?;

    let claims: Claims = serde_json::from_slice(&bytes).map_err(Error::malformed_token)?;

    Ok(claims.exp)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}

#[cfg(test)]
pub(crate) fn make_token(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{}}}"#, exp));
    format!("{}.{}.signature", header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_expiry_is_valid() {
        let token = make_token(unix_now() + 3600);
        let credential = Credential::from_parts(&token, None).unwrap();

        assert!(!credential.is_expired());
    }

    #[test]
    fn past_expiry_is_expired() {
        let token = make_token(unix_now() - 60);
        let credential = Credential::from_parts(&token, None).unwrap();

        assert!(credential.is_expired());
    }

    #[test]
    fn expiry_is_monotonic_in_time() {
        let credential = Credential::from_parts(&make_token(1_000), None).unwrap();

        // valid at t implies valid at every earlier t'
        assert!(!credential.is_expired_at(999));
        assert!(!credential.is_expired_at(0));
        assert!(credential.is_expired_at(1_000));
        assert!(credential.is_expired_at(2_000));
    }

    #[test]
    fn garbage_token_is_malformed() {
        assert!(matches!(
            Credential::from_parts("not-a-jwt", None),
            Err(Error::MalformedToken(_))
        ));
        assert!(matches!(
            Credential::from_parts("a.%%%.c", None),
            Err(Error::MalformedToken(_))
        ));

        // valid base64 but claims without exp
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"user"}"#);
        let token = format!("h.{}.s", payload);
        assert!(matches!(
            Credential::from_parts(&token, None),
            Err(Error::MalformedToken(_))
        ));
    }

    #[test]
    fn refresh_token_is_carried() {
        let token = make_token(unix_now() + 3600);
        let credential = Credential::from_parts(&token, Some("refresh-1")).unwrap();

        assert_eq!(credential.refresh_token.as_deref(), Some("refresh-1"));
    }
}
