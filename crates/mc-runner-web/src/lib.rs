pub mod auth;
pub mod client;
pub mod ws;

use anyhow::{Context, Result};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use libmcrunner::{ConsoleRegistry, LineRing, StdinMux};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WebConsoleSettings {
    pub password: String,
    pub allowed_origins: Vec<String>,
    pub disable_authentication: bool,
    pub disable_origin_check: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub write_timeout: Duration,
}

impl WebConsoleSettings {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            allowed_origins: Vec::new(),
            disable_authentication: false,
            disable_origin_check: false,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
        }
    }
}

/// Shared application state.
pub struct WebState {
    pub registry: Arc<ConsoleRegistry>,
    pub ring: Arc<LineRing>,
    pub stdin: StdinMux,
    pub settings: WebConsoleSettings,
    pub shutdown: CancellationToken,
}

/// Every path upgrades to the console socket.
pub fn router(state: Arc<WebState>) -> Router {
    Router::new().fallback(ws::ws_handler).with_state(state)
}

pub async fn bind_and_serve(addr: &str, state: Arc<WebState>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind websocket console on {addr}"))?;
    serve(listener, state).await
}

/// Serve on an already bound listener until the state's shutdown token fires.
pub async fn serve(listener: TcpListener, state: Arc<WebState>) -> Result<()> {
    if state.settings.disable_authentication {
        warn!("websocket console authentication is disabled");
    }
    if state.settings.disable_origin_check {
        warn!("websocket console origin check is disabled");
    } else if state.settings.allowed_origins.is_empty() {
        warn!("no websocket origins are allowed; every browser connection will be rejected");
    }

    let addr = listener.local_addr()?;
    info!(addr = %addr, "websocket console listening");

    let shutdown = state.shutdown.clone();
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("websocket console server failed")
}
