//! Resilient socket channel: one background task owns the WebSocket, runs the
//! optional heartbeat, and reconnects after a fixed delay within a bounded
//! attempt budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub(crate) const DEFAULT_HEARTBEAT_TIME: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_RECONNECT_TIME: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_MAX_RECONNECT: u32 = 3;
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_HEARTBEAT_DATA: &str = "PING";
pub(crate) const DEFAULT_HEARTBEAT_CALLBACK_DATA: &str = "pong";
const HEARTBEAT_ENABLE_SIGNAL: &str = r#"{"enable":true}"#;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Socket channel options. Unset fields keep their defaults.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Absolute `ws(s)://` / `http(s)://` URL, or a path resolved against `origin`.
    pub url: String,
    /// Origin of the hosting page, e.g. `https://console.example.com`. An
    /// `https` origin selects `wss`.
    pub origin: Option<String>,
    pub heartbeat_enabled: bool,
    pub heartbeat_time: Duration,
    /// Sent every `heartbeat_time` while open.
    pub heartbeat_data: String,
    /// Inbound payload treated as the heartbeat acknowledgment.
    pub heartbeat_callback_data: String,
    pub reconnect_enabled: bool,
    pub max_reconnect: u32,
    /// Fixed delay before each reconnect attempt.
    pub reconnect_time: Duration,
    /// Reconnect forever, ignoring `max_reconnect`.
    pub loop_reconnect: bool,
    /// Upper bound on TCP connect plus WebSocket handshake.
    pub connect_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            origin: None,
            heartbeat_enabled: false,
            heartbeat_time: DEFAULT_HEARTBEAT_TIME,
            heartbeat_data: DEFAULT_HEARTBEAT_DATA.to_string(),
            heartbeat_callback_data: DEFAULT_HEARTBEAT_CALLBACK_DATA.to_string(),
            reconnect_enabled: true,
            max_reconnect: DEFAULT_MAX_RECONNECT,
            reconnect_time: DEFAULT_RECONNECT_TIME,
            loop_reconnect: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.heartbeat_enabled && self.heartbeat_time.is_zero() {
            return Err(Error::Config(
                "heartbeat_time must be positive when heartbeat is enabled".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config("connect_timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Lifecycle callbacks. All are optional.
#[derive(Default)]
pub struct ChannelHandlers {
    pub on_open: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_message: Option<Box<dyn Fn(serde_json::Value) + Send + Sync>>,
    pub on_error: Option<Box<dyn Fn(&Error) + Send + Sync>>,
    /// Fires once, when the channel is closed for good.
    pub on_close: Option<Box<dyn Fn() + Send + Sync>>,
}

impl ChannelHandlers {
    fn open(&self) {
        if let Some(f) = &self.on_open {
            f();
        }
    }

    fn message(&self, value: serde_json::Value) {
        if let Some(f) = &self.on_message {
            f(value);
        }
    }

    fn error(&self, err: &Error) {
        if let Some(f) = &self.on_error {
            f(err);
        }
    }

    fn close(&self) {
        if let Some(f) = &self.on_close {
            f();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Resolve the configured URL to a WebSocket URL.
pub fn resolve_url(url: &str, origin: Option<&str>) -> Result<Url> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        return Ok(Url::parse(url)?);
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        let mut parsed = Url::parse(url)?;
        let scheme = ws_scheme(&parsed);
        set_scheme(&mut parsed, scheme)?;
        return Ok(parsed);
    }
    let origin = origin
        .ok_or_else(|| Error::Config(format!("relative socket url {url} needs an origin")))?;
    let mut base = Url::parse(origin)?;
    let scheme = ws_scheme(&base);
    set_scheme(&mut base, scheme)?;
    Ok(base.join(url)?)
}

fn ws_scheme(url: &Url) -> &'static str {
    match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    }
}

fn set_scheme(url: &mut Url, scheme: &str) -> Result<()> {
    url.set_scheme(scheme)
        .map_err(|()| Error::Config(format!("cannot use {scheme} for {url}")))
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to a running socket channel.
///
/// Dropping the handle closes the channel the same way [`close`](Self::close) does.
pub struct SocketChannel {
    state_rx: watch::Receiver<ChannelState>,
    send_tx: mpsc::UnboundedSender<tungstenite::Message>,
    closed: CancellationToken,
    attempts: Arc<AtomicU32>,
    handlers: Arc<ChannelHandlers>,
    task: Option<JoinHandle<()>>,
}

impl SocketChannel {
    /// Start connecting in the background and return immediately.
    pub fn open(config: ChannelConfig, handlers: ChannelHandlers) -> Result<Self> {
        config.validate()?;
        let url = resolve_url(&config.url, config.origin.as_deref())?;
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let handlers = Arc::new(handlers);

        let task = tokio::spawn(run(Worker {
            url,
            config,
            handlers: Arc::clone(&handlers),
            state_tx,
            send_rx,
            closed: closed.clone(),
            attempts: Arc::clone(&attempts),
        }));

        Ok(Self {
            state_rx,
            send_tx,
            closed,
            attempts,
            handlers,
            task: Some(task),
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Receiver for state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// Reconnect attempts made since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// `true` once [`close`](Self::close) was called.
    pub fn is_manually_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Send a text payload. Only permitted while the socket is open; otherwise
    /// the failure is reported through `on_error` as well as returned.
    pub fn send(&self, data: impl Into<String>) -> Result<()> {
        if self.state() != ChannelState::Open {
            let err = Error::NotOpen;
            tracing::warn!("send while socket not open");
            self.handlers.error(&err);
            return Err(err);
        }
        let text: String = data.into();
        self.send_tx
            .send(tungstenite::Message::Text(text.into()))
            .map_err(|_| Error::ChannelClosed)
    }

    pub fn send_json(&self, value: &serde_json::Value) -> Result<()> {
        self.send(serde_json::to_string(value)?)
    }

    /// Close the channel for good. No reconnect happens afterwards, including
    /// one already waiting on its delay.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::info!("socket channel closed by caller");
        }
        self.closed.cancel();
    }

    /// Wait for the background task to finish.
    pub async fn finished(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

// ---------------------------------------------------------------------------
// Background task
// ---------------------------------------------------------------------------

struct Worker {
    url: Url,
    config: ChannelConfig,
    handlers: Arc<ChannelHandlers>,
    state_tx: watch::Sender<ChannelState>,
    send_rx: mpsc::UnboundedReceiver<tungstenite::Message>,
    closed: CancellationToken,
    attempts: Arc<AtomicU32>,
}

enum Outcome {
    /// Closed by the caller.
    Manual,
    /// Closed by the peer or the stream ended.
    Closed(Option<String>),
    /// Connect failure, transport error, or failed write.
    Failed(Error),
}

async fn run(mut w: Worker) {
    loop {
        w.set_state(ChannelState::Connecting);
        tracing::debug!(url = %w.url, "connecting");

        let outcome = tokio::select! {
            biased;
            _ = w.closed.cancelled() => Outcome::Manual,
            result = tokio::time::timeout(
                w.config.connect_timeout,
                tokio_tungstenite::connect_async(w.url.as_str()),
            ) => match result {
                Ok(Ok((ws, _resp))) => {
                    w.attempts.store(0, Ordering::SeqCst);
                    w.run_session(ws).await
                }
                Ok(Err(e)) => Outcome::Failed(e.into()),
                Err(_) => Outcome::Failed(Error::ConnectTimeout(w.config.connect_timeout)),
            },
        };
        w.set_state(ChannelState::Disconnected);

        match outcome {
            Outcome::Manual => break,
            Outcome::Closed(reason) => {
                tracing::info!(reason = reason.as_deref().unwrap_or("-"), "socket closed");
            }
            Outcome::Failed(e) => {
                tracing::warn!("socket error: {e}");
                w.handlers.error(&e);
            }
        }
        w.fail_queued_sends();

        let attempts = w.attempts.load(Ordering::SeqCst);
        if !w.should_reconnect(attempts) {
            tracing::warn!(attempts, "reconnect budget exhausted, giving up");
            break;
        }
        let attempt = w.record_attempt();
        tracing::info!(attempt, delay = ?w.config.reconnect_time, "scheduling reconnect");

        tokio::select! {
            _ = tokio::time::sleep(w.config.reconnect_time) => {}
            _ = w.closed.cancelled() => {
                tracing::info!("close requested during reconnect delay");
                break;
            }
        }
    }

    w.set_state(ChannelState::Disconnected);
    w.handlers.close();
}

impl Worker {
    fn set_state(&self, state: ChannelState) {
        self.state_tx.send_replace(state);
    }

    fn should_reconnect(&self, attempts: u32) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.config.loop_reconnect
            || (self.config.reconnect_enabled && attempts < self.config.max_reconnect)
    }

    /// Count one more reconnect attempt and return the new total.
    fn record_attempt(&self) -> u32 {
        let next = self.attempts.load(Ordering::SeqCst).saturating_add(1);
        self.attempts.store(next, Ordering::SeqCst);
        next
    }

    /// Sends accepted while open but not written before the drop fail as
    /// delivery errors rather than leaking onto the next connection.
    fn fail_queued_sends(&mut self) {
        while self.send_rx.try_recv().is_ok() {
            self.handlers.error(&Error::NotOpen);
        }
    }

    async fn run_session(&mut self, ws: WsStream) -> Outcome {
        let (mut write, mut read) = ws.split();
        self.set_state(ChannelState::Open);
        tracing::info!(url = %self.url, "socket open");
        self.handlers.open();

        let mut heartbeat = None;
        if self.config.heartbeat_enabled {
            if let Err(e) = send_text(&mut write, HEARTBEAT_ENABLE_SIGNAL).await {
                return Outcome::Failed(e);
            }
            let period = self.config.heartbeat_time;
            heartbeat = Some(tokio::time::interval_at(Instant::now() + period, period));
        }

        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => {
                    self.set_state(ChannelState::Closing);
                    let _ = write.send(tungstenite::Message::Close(None)).await;
                    let _ = write.close().await;
                    return Outcome::Manual;
                }
                frame = read.next() => {
                    if let Some(outcome) = self.handle_frame(frame) {
                        return outcome;
                    }
                }
                _ = tick(&mut heartbeat) => {
                    tracing::trace!("heartbeat ping");
                    if let Err(e) = send_text(&mut write, &self.config.heartbeat_data).await {
                        return Outcome::Failed(e);
                    }
                }
                msg = self.send_rx.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = write.send(msg).await {
                            return Outcome::Failed(e.into());
                        }
                    }
                    None => return Outcome::Manual,
                },
            }
        }
    }

    fn handle_frame(
        &self,
        frame: Option<std::result::Result<tungstenite::Message, tungstenite::Error>>,
    ) -> Option<Outcome> {
        match frame {
            Some(Ok(tungstenite::Message::Text(text))) => self.handle_payload(text.as_str()),
            Some(Ok(tungstenite::Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => self.handle_payload(text),
                Err(_) => tracing::debug!(len = data.len(), "dropping non-utf8 binary frame"),
            },
            Some(Ok(tungstenite::Message::Close(frame))) => {
                return Some(Outcome::Closed(frame.map(|f| f.reason.as_str().to_string())));
            }
            Some(Ok(_)) => {
                // Ping/pong frames are answered by tungstenite.
            }
            Some(Err(e)) => return Some(Outcome::Failed(e.into())),
            None => return Some(Outcome::Closed(None)),
        }
        None
    }

    fn handle_payload(&self, text: &str) {
        if text == self.config.heartbeat_callback_data {
            tracing::trace!("heartbeat acknowledged");
            return;
        }
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => self.handlers.message(value),
            Err(e) => tracing::debug!("dropping unparseable payload: {e}"),
        }
    }
}

async fn send_text(write: &mut WsWrite, text: &str) -> Result<()> {
    write
        .send(tungstenite::Message::Text(text.to_string().into()))
        .await?;
    Ok(())
}

/// Wait for the next heartbeat tick, or pend forever when heartbeat is off.
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
