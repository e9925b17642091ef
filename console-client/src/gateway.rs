//! Authenticated request gateway: bearer token attachment and single-flight
//! token refresh.
//!
//! Every request that comes back 401 while the access token is stale joins one
//! shared refresh. The first such request starts the refresh on its own task;
//! later ones park a continuation in a FIFO queue. When the refresh finishes
//! the queue is drained in insertion order and each parked request is replayed
//! exactly once with the new token. A failed refresh rejects every parked
//! request instead of leaving it hanging.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::progress::LoadingIndicator;
use crate::session::{self, SessionStore, TokenPair};

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout override for large binary transfers.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
pub(crate) const REFRESH_PATH: &str = "/api/auth/token";
pub(crate) const LOGIN_PATH: &str = "/api/auth/login";
pub(crate) const PUBLIC_LOGIN_PATH: &str = "/api/auth/login/public";
pub(crate) const DEFAULT_DASHBOARD_PATH: &str = "/api/sensing/getDefaultId";
/// Role assigned on username/password login.
pub const DEFAULT_ROLE: &str = "Administrator";

/// Called after the session has been cleared by a fatal auth failure.
pub type LogoutHook = Box<dyn Fn() + Send + Sync>;

/// Configuration for [`RequestGateway::new`].
pub struct GatewayConfig {
    /// Base URL prepended to relative request paths.
    pub api_url: String,
    /// Per-request timeout unless overridden in [`RequestOptions`].
    pub timeout: Duration,
    /// URL fragments that never carry a token (substring match).
    pub allow_list: Vec<String>,
    pub refresh_path: String,
    pub login_path: String,
    pub public_login_path: String,
    /// Fetched after login; returns the tenant's default dashboard id.
    pub default_dashboard_path: String,
    /// Lifetime of the access-token cookie.
    pub access_token_ttl: Duration,
    pub on_logout: Option<LogoutHook>,
}

impl GatewayConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            timeout: DEFAULT_TIMEOUT,
            allow_list: vec![REFRESH_PATH.to_string(), "/login".to_string()],
            refresh_path: REFRESH_PATH.to_string(),
            login_path: LOGIN_PATH.to_string(),
            public_login_path: PUBLIC_LOGIN_PATH.to_string(),
            default_dashboard_path: DEFAULT_DASHBOARD_PATH.to_string(),
            access_token_ttl: session::DEFAULT_ACCESS_TOKEN_TTL,
            on_logout: None,
        }
    }
}

/// How the response body is decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseType {
    #[default]
    Json,
    Text,
    Bytes,
}

/// Decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Text(String),
    Bytes(Bytes),
}

/// A successful response. `headers` is only populated when the caller asked
/// for them with [`RequestOptions::with_headers`].
#[derive(Debug)]
pub struct Reply {
    pub data: Payload,
    pub headers: Option<HeaderMap>,
}

impl Reply {
    /// Decode a JSON payload into `T`.
    pub fn json<T: DeserializeOwned>(self) -> Result<T> {
        match self.data {
            Payload::Json(value) => Ok(serde_json::from_value(value)?),
            Payload::Text(text) => Ok(serde_json::from_str(&text)?),
            Payload::Bytes(bytes) => Ok(serde_json::from_slice(&bytes)?),
        }
    }
}

/// Per-request options.
#[derive(Default)]
pub struct RequestOptions {
    /// Query string pairs.
    pub query: Vec<(String, String)>,
    /// JSON request body.
    pub data: Option<serde_json::Value>,
    pub headers: HeaderMap,
    /// Overrides the gateway default (e.g. two minutes for large downloads).
    pub timeout: Option<Duration>,
    pub response_type: ResponseType,
    /// Return response headers alongside the body.
    pub with_headers: bool,
    /// Do not count this request in the loading indicator.
    pub no_progress: bool,
    /// Caller-side cancellation.
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn query(pairs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>) -> Self {
        Self {
            query: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn json(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }
}

/// Parked request waiting for the in-flight refresh. Receives the new access
/// token or the refresh error message.
type Continuation = oneshot::Sender<std::result::Result<String, String>>;

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    pending: VecDeque<Continuation>,
}

enum Fresh {
    Ready(String),
    Wait(oneshot::Receiver<std::result::Result<String, String>>),
}

/// Shared HTTP gateway for the console API. Clone is a cheap Arc refcount bump;
/// all clones observe the same refresh flag and pending queue.
#[derive(Clone)]
pub struct RequestGateway {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    api_url: String,
    timeout: Duration,
    allow_list: Vec<String>,
    refresh_path: String,
    login_path: String,
    public_login_path: String,
    default_dashboard_path: String,
    session: Arc<SessionStore>,
    loading: LoadingIndicator,
    refresh: Mutex<RefreshState>,
    on_logout: Option<LogoutHook>,
}

impl RequestGateway {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let session = Arc::new(SessionStore::new(config.access_token_ttl));
        Self::with_session(config, session)
    }

    /// Build a gateway over an existing session store.
    pub fn with_session(config: GatewayConfig, session: Arc<SessionStore>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            "X-Requested-With",
            HeaderValue::from_static("XMLHttpRequest"),
        );
        let client = Client::builder().default_headers(headers).build()?;

        let api_url = config.api_url.trim_end_matches('/').to_string();
        info!(api_url = %api_url, timeout = ?config.timeout, "request gateway initialized");

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                api_url,
                timeout: config.timeout,
                allow_list: config.allow_list,
                refresh_path: config.refresh_path,
                login_path: config.login_path,
                public_login_path: config.public_login_path,
                default_dashboard_path: config.default_dashboard_path,
                session,
                loading: LoadingIndicator::default(),
                refresh: Mutex::new(RefreshState::default()),
                on_logout: config.on_logout,
            }),
        })
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.inner.session
    }

    pub fn loading(&self) -> &LoadingIndicator {
        &self.inner.loading
    }

    /// `true` while a token refresh is running.
    pub fn refresh_in_flight(&self) -> bool {
        self.lock_refresh().in_flight
    }

    /// Number of requests parked behind the in-flight refresh.
    pub fn pending_requests(&self) -> usize {
        self.lock_refresh().pending.len()
    }

    fn lock_refresh(&self) -> MutexGuard<'_, RefreshState> {
        self.inner
            .refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a request. `url` is either absolute or a path appended to the
    /// configured API base URL.
    pub async fn request(&self, method: Method, url: &str, opts: RequestOptions) -> Result<Reply> {
        if url.is_empty() {
            return Err(Error::EmptyUrl);
        }
        let _progress = (!opts.no_progress).then(|| self.inner.loading.start());

        match opts.cancel.clone() {
            Some(cancel) => tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(%method, url, "request cancelled by caller");
                    Err(Error::Cancelled)
                }
                result = self.dispatch(method.clone(), url, &opts) => result,
            },
            None => self.dispatch(method, url, &opts).await,
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let opts = RequestOptions::query(query.iter().copied());
        self.request(Method::GET, url, opts).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(&self, url: &str, body: &B) -> Result<T> {
        let opts = RequestOptions::json(serde_json::to_value(body)?);
        self.request(Method::POST, url, opts).await?.json()
    }

    /// Log in with username and password, store the issued token pair and
    /// remember the tenant's default dashboard.
    ///
    /// A failed dashboard lookup is logged and does not fail the login.
    pub async fn login(&self, username: &str, password: &str) -> Result<TokenPair> {
        let body = serde_json::json!({ "username": username, "password": password });
        let login_path = self.inner.login_path.clone();
        let pair: TokenPair = self.post_json(&login_path, &body).await?;
        let roles = [DEFAULT_ROLE.to_string()];
        self.inner.session.set_token(&pair, Some((username, roles.as_slice())));
        self.inner.session.set_public(false);
        info!(username, "logged in");

        match self.fetch_default_dashboard().await {
            Ok(Some(id)) => self.inner.session.set_default_dashboard(&id),
            Ok(None) => debug!("no default dashboard"),
            Err(e) => warn!("default dashboard lookup failed: {e}"),
        }
        Ok(pair)
    }

    async fn fetch_default_dashboard(&self) -> Result<Option<String>> {
        let path = self.inner.default_dashboard_path.clone();
        let reply = self
            .request(Method::GET, &path, RequestOptions::default())
            .await?;
        Ok(match reply.data {
            Payload::Json(serde_json::Value::String(id)) => Some(id),
            Payload::Json(serde_json::Value::Null) => None,
            Payload::Json(other) => Some(other.to_string()),
            Payload::Text(text) => Some(text),
            Payload::Bytes(_) => None,
        }
        .filter(|id| !id.is_empty()))
    }

    /// Log in through a public dashboard link, keeping any stored identity.
    pub async fn login_public(&self, public_id: &str) -> Result<TokenPair> {
        let body = serde_json::json!({ "publicId": public_id });
        let path = self.inner.public_login_path.clone();
        let pair: TokenPair = self.post_json(&path, &body).await?;
        self.inner.session.set_token(&pair, None);
        self.inner.session.set_public(true);
        info!(public_id, "public session established");
        Ok(pair)
    }

    /// Force a token refresh, joining one that is already running.
    pub async fn refresh(&self) -> Result<String> {
        match self.fresh_token(None, true)? {
            Fresh::Ready(token) => Ok(token),
            Fresh::Wait(rx) => wait_for_refresh(rx).await,
        }
    }

    /// Clear the session and notify the logout hook.
    pub fn logout(&self) {
        self.inner.session.clear();
        info!("session cleared, redirecting to login");
        if let Some(hook) = &self.inner.on_logout {
            hook();
        }
    }

    fn is_allow_listed(&self, url: &str) -> bool {
        self.inner.allow_list.iter().any(|v| url.contains(v.as_str()))
    }

    fn is_refresh_url(&self, url: &str) -> bool {
        url.contains(self.inner.refresh_path.as_str())
    }

    fn full_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}{url}", self.inner.api_url)
        }
    }

    async fn dispatch(&self, method: Method, url: &str, opts: &RequestOptions) -> Result<Reply> {
        let bypass = self.is_allow_listed(url);
        if bypass {
            self.reset_stale_refresh();
        }
        let sent_token = if bypass {
            None
        } else {
            self.inner.session.access_token()
        };

        let resp = self
            .send(method.clone(), url, opts, sent_token.as_deref())
            .await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return self.finish(resp, opts).await;
        }

        if bypass {
            if self.is_refresh_url(url) {
                warn!(url, "refresh endpoint rejected the refresh token");
                self.logout();
                return Err(Error::SessionExpired);
            }
            return Err(Error::Unauthorized);
        }

        debug!(%method, url, "access token rejected, waiting for refresh");
        let token = match self.fresh_token(sent_token.as_deref(), false)? {
            Fresh::Ready(token) => token,
            Fresh::Wait(rx) => wait_for_refresh(rx).await?,
        };

        let resp = self.send(method, url, opts, Some(&token)).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized);
        }
        self.finish(resp, opts).await
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        opts: &RequestOptions,
        token: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut req = self
            .inner
            .client
            .request(method, self.full_url(url))
            .timeout(opts.timeout.unwrap_or(self.inner.timeout))
            .headers(opts.headers.clone());
        if !opts.query.is_empty() {
            req = req.query(&opts.query);
        }
        if let Some(data) = &opts.data {
            req = req.json(data);
        }
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, session::format_token(token));
        }
        Ok(req.send().await?)
    }

    async fn finish(&self, resp: reqwest::Response, opts: &RequestOptions) -> Result<Reply> {
        let status = resp.status();
        if status == StatusCode::FORBIDDEN {
            warn!(url = %resp.url(), "forbidden, ending session");
            self.logout();
            return Err(Error::Forbidden);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Status { status, body });
        }

        let headers = opts.with_headers.then(|| resp.headers().clone());
        let data = match opts.response_type {
            ResponseType::Json => {
                let bytes = resp.bytes().await?;
                if bytes.is_empty() {
                    Payload::Json(serde_json::Value::Null)
                } else {
                    Payload::Json(serde_json::from_slice(&bytes)?)
                }
            }
            ResponseType::Text => Payload::Text(resp.text().await?),
            ResponseType::Bytes => Payload::Bytes(resp.bytes().await?),
        };
        Ok(Reply { data, headers })
    }

    /// Clear an in-flight flag nobody is waiting on.
    ///
    /// Invariant: `in_flight` implies a non-empty queue. `fresh_token` sets the
    /// flag and parks the initiator under one lock, and `run_refresh` drains
    /// the queue and clears the flag under one lock. A cancelled caller leaves
    /// its sender queued. So this never splits a live flight and is a no-op
    /// unless that invariant has been broken.
    fn reset_stale_refresh(&self) {
        let mut state = self.lock_refresh();
        if state.in_flight && state.pending.is_empty() {
            debug!("clearing stale refresh flag");
            state.in_flight = false;
        }
    }

    /// Get a token newer than `sent`, joining or starting the single refresh.
    ///
    /// The check-and-set on the flag happens under one lock with no await, so
    /// two callers can never both start a refresh.
    fn fresh_token(&self, sent: Option<&str>, force: bool) -> Result<Fresh> {
        let mut state = self.lock_refresh();

        if !force
            && !state.in_flight
            && let Some(current) = self.inner.session.access_token()
            && Some(current.as_str()) != sent
        {
            // Another request already refreshed after ours was sent.
            return Ok(Fresh::Ready(current));
        }

        let (tx, rx) = oneshot::channel();
        if state.in_flight {
            state.pending.push_back(tx);
            debug!(pending = state.pending.len(), "parked behind in-flight refresh");
            return Ok(Fresh::Wait(rx));
        }

        let Some(refresh_token) = self.inner.session.refresh_token() else {
            return Err(Error::Unauthorized);
        };
        state.in_flight = true;
        state.pending.push_back(tx);
        drop(state);

        let gateway = self.clone();
        tokio::spawn(async move { gateway.run_refresh(refresh_token).await });
        Ok(Fresh::Wait(rx))
    }

    async fn run_refresh(&self, refresh_token: String) {
        info!("refreshing access token");
        let outcome = match self.call_refresh(&refresh_token).await {
            Ok(pair) => {
                self.inner.session.set_token(&pair, None);
                info!("access token refreshed");
                Ok(pair.token)
            }
            Err(e) => {
                warn!("token refresh failed: {e}");
                Err(e.to_string())
            }
        };

        let waiters = {
            let mut state = self.lock_refresh();
            let waiters = std::mem::take(&mut state.pending);
            state.in_flight = false;
            waiters
        };
        debug!(count = waiters.len(), "releasing parked requests");
        for waiter in waiters {
            // Receiver is gone if that caller was cancelled.
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn call_refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let opts = RequestOptions {
            data: Some(serde_json::json!({ "refreshToken": refresh_token })),
            ..Default::default()
        };
        let resp = self
            .send(Method::POST, &self.inner.refresh_path, &opts, None)
            .await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            self.logout();
            return Err(Error::SessionExpired);
        }
        self.finish(resp, &opts).await?.json()
    }
}

async fn wait_for_refresh(
    rx: oneshot::Receiver<std::result::Result<String, String>>,
) -> Result<String> {
    match rx.await {
        Ok(Ok(token)) => Ok(token),
        Ok(Err(message)) => Err(Error::RefreshFailed(message)),
        Err(_) => Err(Error::RefreshFailed("refresh task ended".to_string())),
    }
}
