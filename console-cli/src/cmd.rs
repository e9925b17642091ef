use std::path::PathBuf;

use clap::Args;
use console_client::telemetry::{self, TelemetryUpdate};
use console_client::{
    ChannelHandlers, ConsoleConfig, Payload, RequestGateway, RequestOptions, SocketChannel, config,
};
use reqwest::Method;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{CliError, CliResult};

/// Connection and credential flags shared by every subcommand.
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// YAML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Console API base URL (overrides the config file)
    #[arg(long, global = true, env = "CONSOLE_API_URL")]
    pub api_url: Option<String>,
    #[arg(long, global = true, env = "CONSOLE_USERNAME")]
    pub username: Option<String>,
    #[arg(long, global = true, env = "CONSOLE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    /// HTTP method, e.g. GET or POST
    pub method: String,
    /// Path under the API base URL, e.g. /api/tenant/deviceInfos
    pub path: String,
    /// Query parameter as key=value (repeatable)
    #[arg(long = "query", value_parser = parse_pair)]
    pub query: Vec<(String, String)>,
    /// JSON request body
    #[arg(long)]
    pub data: Option<String>,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {s}"))?;
    if key.is_empty() {
        return Err(format!("empty key in {s}"));
    }
    Ok((key.to_string(), value.to_string()))
}

struct Context {
    config: ConsoleConfig,
    username: String,
    password: String,
}

async fn resolve(args: GlobalArgs) -> CliResult<Context> {
    let mut config = match &args.config {
        Some(path) => config::load(path).await?,
        None => {
            let api_url = args.api_url.clone().ok_or_else(|| {
                CliError::Config("--api-url or --config is required".to_string())
            })?;
            ConsoleConfig::new(api_url)
        }
    };
    if let Some(api_url) = args.api_url {
        config.api_url = api_url;
    }
    let username = args
        .username
        .ok_or_else(|| CliError::Config("--username is required".to_string()))?;
    let password = args
        .password
        .ok_or_else(|| CliError::Config("--password is required".to_string()))?;
    Ok(Context {
        config,
        username,
        password,
    })
}

async fn login(ctx: &Context) -> CliResult<RequestGateway> {
    let mut gateway_config = ctx.config.gateway_config();
    gateway_config.on_logout = Some(Box::new(|| warn!("session ended, log in again")));
    let gateway = RequestGateway::new(gateway_config)?;
    gateway.login(&ctx.username, &ctx.password).await?;
    Ok(gateway)
}

pub async fn run_login(args: GlobalArgs) -> CliResult<()> {
    let ctx = resolve(args).await?;
    let gateway = login(&ctx).await?;
    let info = gateway
        .session()
        .session_info()
        .ok_or_else(|| CliError::Config("login returned no session".to_string()))?;
    println!("username: {}", info.username);
    println!("roles: {}", info.roles.join(", "));
    Ok(())
}

pub async fn run_request(global: GlobalArgs, args: RequestArgs) -> CliResult<()> {
    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .map_err(|e| CliError::Argument(format!("method {}: {e}", args.method)))?;
    let data = args
        .data
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()?;

    let ctx = resolve(global).await?;
    let gateway = login(&ctx).await?;
    let opts = RequestOptions {
        query: args.query,
        data,
        ..Default::default()
    };
    let reply = gateway.request(method, &args.path, opts).await?;
    match reply.data {
        Payload::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Payload::Text(text) => println!("{text}"),
        Payload::Bytes(bytes) => println!("<{} bytes>", bytes.len()),
    }
    Ok(())
}

pub async fn run_watch(args: GlobalArgs) -> CliResult<()> {
    let ctx = resolve(args).await?;
    let gateway = login(&ctx).await?;
    let token = gateway
        .session()
        .access_token()
        .ok_or_else(|| CliError::Config("login returned no access token".to_string()))?;

    let (tx, mut events) = mpsc::unbounded_channel();
    let channel_config = ctx.config.channel_config(telemetry::telemetry_url(&token));
    let mut channel = SocketChannel::open(channel_config, watch_handlers(tx))?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                info!("interrupted, closing telemetry socket");
                break;
            }
            event = events.recv() => match event {
                Some(WatchEvent::Opened) => {
                    if let Err(e) = channel.send_json(&telemetry::device_status_cmds()) {
                        warn!("subscribe failed: {e}");
                    }
                }
                Some(WatchEvent::Update(update)) => print_update(&update),
                // Channel gave up reconnecting.
                Some(WatchEvent::Closed) | None => break,
            },
        }
    }

    channel.close();
    channel.finished().await;
    Ok(())
}

#[derive(Debug)]
enum WatchEvent {
    Opened,
    Update(TelemetryUpdate),
    Closed,
}

/// Callbacks forwarding every open, update and final close to the watch loop,
/// one event per connection so no subscribe is skipped.
fn watch_handlers(tx: mpsc::UnboundedSender<WatchEvent>) -> ChannelHandlers {
    let (open_tx, message_tx, close_tx) = (tx.clone(), tx.clone(), tx);
    ChannelHandlers {
        on_open: Some(Box::new(move || {
            let _ = open_tx.send(WatchEvent::Opened);
        })),
        on_message: Some(Box::new(move |value| {
            let _ = message_tx.send(WatchEvent::Update(TelemetryUpdate::classify(value)));
        })),
        on_error: Some(Box::new(|e: &console_client::Error| {
            warn!("telemetry socket error: {e}");
        })),
        on_close: Some(Box::new(move || {
            info!("telemetry socket closed");
            let _ = close_tx.send(WatchEvent::Closed);
        })),
    }
}

fn print_update(update: &TelemetryUpdate) {
    match update {
        TelemetryUpdate::DeviceStatus { cmd_id, data } => {
            let label = match *cmd_id {
                telemetry::device_status::TOTAL => "total",
                telemetry::device_status::ACTIVE => "active",
                telemetry::device_status::INACTIVE => "inactive",
                _ => "unknown",
            };
            let count = data.get("count").cloned().unwrap_or_default();
            println!("devices {label}: {count}");
        }
        TelemetryUpdate::AlarmTable { has_next, data } => {
            println!("alarms (has_next={has_next}): {data}");
        }
        TelemetryUpdate::Other(value) => println!("{value}"),
    }
}
