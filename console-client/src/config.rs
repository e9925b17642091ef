use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{self, ChannelConfig};
use crate::error::{Error, Result};
use crate::gateway::GatewayConfig;
use crate::session;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Base URL of the REST API, e.g. `https://console.example.com`.
    pub api_url: String,
    /// Page origin used to resolve socket paths. Defaults to `api_url`.
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub socket: SocketConfig,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_ms: u64,
    pub allow_list: Vec<String>,
    pub refresh_path: String,
    pub login_path: String,
    pub public_login_path: String,
    pub default_dashboard_path: String,
    pub access_token_ttl_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        let defaults = GatewayConfig::new("");
        Self {
            timeout_ms: millis(defaults.timeout),
            allow_list: defaults.allow_list,
            refresh_path: defaults.refresh_path,
            login_path: defaults.login_path,
            public_login_path: defaults.public_login_path,
            default_dashboard_path: defaults.default_dashboard_path,
            access_token_ttl_secs: session::DEFAULT_ACCESS_TOKEN_TTL.as_secs(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub heartbeat_enabled: bool,
    pub heartbeat_time_ms: u64,
    pub heartbeat_data: String,
    pub heartbeat_callback_data: String,
    pub reconnect_enabled: bool,
    pub max_reconnect: u32,
    pub reconnect_time_ms: u64,
    pub loop_reconnect: bool,
    pub connect_timeout_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_enabled: false,
            heartbeat_time_ms: millis(channel::DEFAULT_HEARTBEAT_TIME),
            heartbeat_data: channel::DEFAULT_HEARTBEAT_DATA.to_string(),
            heartbeat_callback_data: channel::DEFAULT_HEARTBEAT_CALLBACK_DATA.to_string(),
            reconnect_enabled: true,
            max_reconnect: channel::DEFAULT_MAX_RECONNECT,
            reconnect_time_ms: millis(channel::DEFAULT_RECONNECT_TIME),
            loop_reconnect: false,
            connect_timeout_ms: millis(channel::DEFAULT_CONNECT_TIMEOUT),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Load a console config from a YAML file.
pub async fn load(path: &Path) -> Result<ConsoleConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
    parse(&content).map_err(|e| match e {
        Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
        other => other,
    })
}

/// Parse and validate a YAML config document.
pub fn parse(content: &str) -> Result<ConsoleConfig> {
    let config: ConsoleConfig =
        serde_yaml_ng::from_str(content).map_err(|e| Error::Config(format!("parse: {e}")))?;
    config.validate()?;
    Ok(config)
}

impl ConsoleConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            origin: None,
            http: HttpConfig::default(),
            socket: SocketConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.api_url.is_empty() {
            return Err(Error::Config("api_url must not be empty".to_string()));
        }
        url::Url::parse(&self.api_url)
            .map_err(|e| Error::Config(format!("api_url {}: {e}", self.api_url)))?;
        if self.socket.heartbeat_enabled && self.socket.heartbeat_time_ms == 0 {
            return Err(Error::Config(
                "socket.heartbeat_time_ms must be positive".to_string(),
            ));
        }
        if self.socket.connect_timeout_ms == 0 {
            return Err(Error::Config(
                "socket.connect_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        let mut config = GatewayConfig::new(self.api_url.clone());
        config.timeout = Duration::from_millis(self.http.timeout_ms);
        config.allow_list = self.http.allow_list.clone();
        config.refresh_path = self.http.refresh_path.clone();
        config.login_path = self.http.login_path.clone();
        config.public_login_path = self.http.public_login_path.clone();
        config.default_dashboard_path = self.http.default_dashboard_path.clone();
        config.access_token_ttl = Duration::from_secs(self.http.access_token_ttl_secs);
        config
    }

    /// Channel options for `url`, resolved against the configured origin.
    pub fn channel_config(&self, url: impl Into<String>) -> ChannelConfig {
        let mut config = ChannelConfig::new(url);
        config.origin = Some(self.origin.clone().unwrap_or_else(|| self.api_url.clone()));
        config.heartbeat_enabled = self.socket.heartbeat_enabled;
        config.heartbeat_time = Duration::from_millis(self.socket.heartbeat_time_ms);
        config.heartbeat_data = self.socket.heartbeat_data.clone();
        config.heartbeat_callback_data = self.socket.heartbeat_callback_data.clone();
        config.reconnect_enabled = self.socket.reconnect_enabled;
        config.max_reconnect = self.socket.max_reconnect;
        config.reconnect_time = Duration::from_millis(self.socket.reconnect_time_ms);
        config.loop_reconnect = self.socket.loop_reconnect;
        config.connect_timeout = Duration::from_millis(self.socket.connect_timeout_ms);
        config
    }
}
