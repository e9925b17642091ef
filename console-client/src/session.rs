//! Session credentials: an expiring cookie-like store for the access token and
//! a tab-scoped store for the refresh token and identity.
//!
//! The access token is only ever read from the cookie store. Username, roles
//! and the refresh token are only ever read from the session store. Logout
//! clears both together.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cookie key holding `{"accessToken", "expires"}`.
pub const TOKEN_KEY: &str = "authorized-token";
/// Session key holding `{"username", "roles", "refreshToken"}`.
pub const SESSION_KEY: &str = "user-info";
/// Session key holding the id of the tenant's default dashboard.
pub const DEFAULT_DASHBOARD_KEY: &str = "defaultId";

const BEARER_PREFIX: &str = "Bearer ";
pub(crate) const DEFAULT_ACCESS_TOKEN_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Token pair returned by the login, public-login and refresh endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub token: String,
    pub refresh_token: String,
}

/// Identity persisted next to the refresh token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredToken {
    access_token: String,
    /// Unix milliseconds.
    expires: i64,
}

struct CookieEntry {
    value: String,
    expires_at_ms: i64,
}

#[derive(Default)]
struct Stores {
    cookies: HashMap<String, CookieEntry>,
    session: HashMap<String, String>,
    /// Set while the session came from a public dashboard link.
    public: bool,
}

/// Thread-safe credential store shared by the gateway and its callers.
pub struct SessionStore {
    access_token_ttl: Duration,
    stores: Mutex<Stores>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Format an access token as an `Authorization` header value.
pub fn format_token(token: &str) -> String {
    format!("{BEARER_PREFIX}{token}")
}

/// Strip a leading `Bearer ` from a header value, if present.
pub fn strip_bearer(value: &str) -> &str {
    value.strip_prefix(BEARER_PREFIX).unwrap_or(value)
}

impl SessionStore {
    pub fn new(access_token_ttl: Duration) -> Self {
        Self {
            access_token_ttl,
            stores: Mutex::new(Stores::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Stores> {
        self.stores.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a freshly issued token pair.
    ///
    /// When `identity` is `None` the previously stored username and roles are
    /// kept, so a refresh never forgets who is logged in.
    pub fn set_token(&self, pair: &TokenPair, identity: Option<(&str, &[String])>) {
        let ttl_ms = i64::try_from(self.access_token_ttl.as_millis()).unwrap_or(i64::MAX);
        let stored = StoredToken {
            access_token: pair.token.clone(),
            expires: now_ms().saturating_add(ttl_ms),
        };
        let Ok(cookie) = serde_json::to_string(&stored) else {
            return;
        };

        let mut stores = self.lock();
        let previous = read_session(&stores).unwrap_or_default();
        let (username, roles) = match identity {
            Some((username, roles)) => (username.to_string(), roles.to_vec()),
            None => (previous.username, previous.roles),
        };
        let info = SessionInfo {
            username,
            roles,
            refresh_token: pair.refresh_token.clone(),
        };
        let Ok(session) = serde_json::to_string(&info) else {
            return;
        };

        stores.cookies.insert(
            TOKEN_KEY.to_string(),
            CookieEntry {
                value: cookie,
                expires_at_ms: stored.expires,
            },
        );
        stores.session.insert(SESSION_KEY.to_string(), session);
    }

    /// Current access token, read from the cookie store only.
    pub fn access_token(&self) -> Option<String> {
        let raw = self.cookie_value(TOKEN_KEY)?;
        match serde_json::from_str::<StoredToken>(&raw) {
            Ok(stored) => Some(stored.access_token),
            Err(e) => {
                tracing::warn!("discarding malformed token cookie: {e}");
                None
            }
        }
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.session_info()
            .map(|info| info.refresh_token)
            .filter(|t| !t.is_empty())
    }

    pub fn username(&self) -> Option<String> {
        self.session_info()
            .map(|info| info.username)
            .filter(|u| !u.is_empty())
    }

    pub fn roles(&self) -> Vec<String> {
        self.session_info().map(|info| info.roles).unwrap_or_default()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        read_session(&self.lock())
    }

    /// Raw cookie value, or `None` if missing or expired. Expired entries are
    /// evicted on read.
    pub fn cookie_value(&self, key: &str) -> Option<String> {
        let mut stores = self.lock();
        let expired = stores
            .cookies
            .get(key)
            .map(|entry| entry.expires_at_ms <= now_ms())?;
        if expired {
            stores.cookies.remove(key);
            return None;
        }
        stores.cookies.get(key).map(|entry| entry.value.clone())
    }

    pub fn set_default_dashboard(&self, id: &str) {
        self.lock()
            .session
            .insert(DEFAULT_DASHBOARD_KEY.to_string(), id.to_string());
    }

    pub fn default_dashboard(&self) -> Option<String> {
        self.session_value(DEFAULT_DASHBOARD_KEY)
            .filter(|id| !id.is_empty())
    }

    pub fn set_public(&self, public: bool) {
        self.lock().public = public;
    }

    /// `true` when the current tokens were issued for a public link.
    pub fn is_public(&self) -> bool {
        self.lock().public
    }

    /// Raw session-store value.
    pub fn session_value(&self, key: &str) -> Option<String> {
        self.lock().session.get(key).cloned()
    }

    /// Remove the token cookie and clear the whole session store.
    pub fn clear(&self) {
        let mut stores = self.lock();
        stores.cookies.remove(TOKEN_KEY);
        stores.session.clear();
        stores.public = false;
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_ACCESS_TOKEN_TTL)
    }
}

fn read_session(stores: &Stores) -> Option<SessionInfo> {
    let raw = stores.session.get(SESSION_KEY)?;
    serde_json::from_str(raw)
        .map_err(|e| tracing::warn!("discarding malformed session info: {e}"))
        .ok()
}
