//! Session-scoped token persistence

use std::sync::RwLock;

/// Storage key for the id token
pub const ID_TOKEN_KEY: &str = "idToken";

/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// The two opaque strings a session leaves behind
///
/// This is the entire persisted state of the panel; the tokens are stored
/// undecoded and interpreted again on load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTokens {
    pub id_token: String,
    pub refresh_token: Option<String>,
}

/// Persistence for the current session's tokens
///
/// Implementations span page reloads but not distinct browser profiles;
/// hosts embed their own backend (e.g. sessionStorage) by implementing this
/// trait. No network or UI side effects are allowed here.
pub trait TokenStore: Send + Sync {
    fn save(&self, tokens: &StoredTokens);

    fn load(&self) -> Option<StoredTokens>;

    fn clear(&self);
}

/// In-memory token store
///
/// The process lifetime stands in for a browser tab; useful as the default
/// backend and in tests.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    inner: RwLock<Option<StoredTokens>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn save(&self, tokens: &StoredTokens) {
        let mut guard = self.inner.write().unwrap();
        *guard = Some(tokens.clone());
    }

    fn load(&self) -> Option<StoredTokens> {
        let guard = self.inner.read().unwrap();
        guard.clone()
    }

    fn clear(&self) {
        let mut guard = self.inner.write().unwrap();
        *guard = None;
    }
}
