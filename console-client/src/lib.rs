//! Client for the IoT console REST + WebSocket API.
//!
//! Two independent pieces:
//! - [`RequestGateway`] attaches bearer tokens to outbound requests and
//!   recovers from access-token expiry with a single shared refresh. Requests
//!   that fail with 401 while the refresh runs are parked and replayed once the
//!   new token arrives.
//! - [`SocketChannel`] keeps a WebSocket open with an optional heartbeat and a
//!   bounded fixed-delay reconnect, reporting lifecycle through callbacks.
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), console_client::Error> {
//! use console_client::{GatewayConfig, RequestGateway};
//!
//! let gateway = RequestGateway::new(GatewayConfig::new("https://console.example.com"))?;
//! gateway.login("tenant@example.com", "secret").await?;
//! let devices: serde_json::Value = gateway
//!     .get_json("/api/tenant/deviceInfos", &[("pageSize", "20"), ("page", "0")])
//!     .await?;
//! println!("{devices}");
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
mod error;
pub mod gateway;
mod progress;
pub mod session;
pub mod telemetry;

pub use channel::{ChannelConfig, ChannelHandlers, ChannelState, SocketChannel};
pub use config::ConsoleConfig;
pub use error::{Error, Result};
pub use gateway::{GatewayConfig, Payload, Reply, RequestGateway, RequestOptions, ResponseType};
pub use progress::{LoadingGuard, LoadingIndicator};
pub use session::{SessionInfo, SessionStore, TokenPair};
pub use telemetry::TelemetryUpdate;
