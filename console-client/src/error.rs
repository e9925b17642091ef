//! Error type shared by the gateway and the socket channel.

use reqwest::StatusCode;
use tokio_tungstenite::tungstenite;

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request url must not be empty")]
    EmptyUrl,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request cancelled")]
    Cancelled,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("session expired, refresh token rejected")]
    SessionExpired,

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("socket connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("socket is not open")]
    NotOpen,

    #[error("socket channel closed")]
    ChannelClosed,

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// `true` when the caller cancelled the request, as opposed to a network
    /// or server failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// `true` for failures that ended the session (logout already happened).
    pub fn is_fatal_auth(&self) -> bool {
        matches!(self, Error::Forbidden | Error::SessionExpired)
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
