use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use futures_util::stream::SplitStream;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use libmcrunner::RemoteSession;
use mc_runner_protocol::{SessionId, WS_SUBPROTOCOL, WsClientMessage};

use crate::WebState;
use crate::auth::authorize;
use crate::client::WsClient;

/// Upgrade handler. Origin and token are checked before the upgrade so a
/// rejected client gets a plain HTTP status with a JSON reason.
pub async fn ws_handler(
    State(state): State<Arc<WebState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Err(rejection) = authorize(&headers, &state.settings) {
        warn!(addr = %peer, reason = rejection.reason(), "websocket console connection rejected");
        return rejection.into_response();
    }

    match upgrade {
        Ok(ws) => ws
            .protocols([WS_SUBPROTOCOL])
            .on_upgrade(move |socket| handle_socket(socket, state, peer)),
        Err(rejection) => rejection.into_response(),
    }
}

#[derive(Debug)]
enum Disconnect {
    Closed(Option<CloseFrame>),
    Ended,
    Error(String),
    Cancelled,
}

async fn handle_socket(socket: WebSocket, state: Arc<WebState>, peer: SocketAddr) {
    let (sink, mut stream) = socket.split();
    let cancel = state.shutdown.child_token();
    let client = Arc::new(WsClient::new(
        sink,
        peer,
        state.settings.write_timeout,
        cancel.clone(),
    ));
    let session_id = client.id();

    if let Err(err) = client.join(&state.registry, &state.ring).await {
        warn!(session_id = %session_id, addr = %peer, "failed to send welcome: {err}");
        state.registry.unregister(&session_id);
        client.close().await;
        return;
    }
    info!(session_id = %session_id, addr = %peer, "websocket console client connected");

    let pong = Arc::new(Notify::new());
    let heartbeat = tokio::spawn(heartbeat(
        client.clone(),
        pong.clone(),
        state.settings.heartbeat_interval,
        state.settings.heartbeat_timeout,
    ));

    let reason = read_loop(&mut stream, &state, session_id, &pong, &cancel).await;

    heartbeat.abort();
    state.registry.unregister(&session_id);
    cancel.cancel();
    log_disconnect(session_id, peer, reason);
}

async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    state: &WebState,
    session_id: SessionId,
    pong: &Notify,
    cancel: &CancellationToken,
) -> Disconnect {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return Disconnect::Cancelled,
            next = stream.next() => next,
        };
        match next {
            None => return Disconnect::Ended,
            Some(Err(err)) => return Disconnect::Error(err.to_string()),
            Some(Ok(Message::Close(frame))) => return Disconnect::Closed(frame),
            // A pong nobody is waiting for is dropped rather than stored.
            Some(Ok(Message::Pong(_))) => pong.notify_waiters(),
            Some(Ok(Message::Text(text))) => handle_text(state, session_id, text.as_str()).await,
            Some(Ok(Message::Binary(_) | Message::Ping(_))) => {}
        }
    }
}

async fn handle_text(state: &WebState, session_id: SessionId, text: &str) {
    let message: WsClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            error!(session_id = %session_id, "malformed websocket message: {err}");
            return;
        }
    };

    match message {
        WsClientMessage::Stdin { content } => {
            if let Err(err) = state.stdin.write_line(&content).await {
                warn!(session_id = %session_id, "failed to write console input: {err}");
            }
        }
    }
}

/// Ping every `interval`; the pong must arrive within `timeout` or the
/// connection is closed.
async fn heartbeat(client: Arc<WsClient>, pong: Arc<Notify>, interval: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        // Subscribed before the ping goes out, so only a pong that arrives
        // after it completes the round trip.
        let answered = pong.notified();
        tokio::pin!(answered);
        answered.as_mut().enable();
        let round_trip = async {
            client.ping().await?;
            answered.await;
            Ok::<_, libmcrunner::ConsoleError>(())
        };
        let failure = match tokio::time::timeout(timeout, round_trip).await {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err.to_string(),
            Err(_) => "no pong received".to_string(),
        };
        warn!(session_id = %client.id(), addr = %client.peer(), "websocket ping failed: {failure}");
        client.close().await;
        return;
    }
}

fn log_disconnect(session_id: SessionId, peer: SocketAddr, reason: Disconnect) {
    match reason {
        Disconnect::Closed(Some(frame))
            if frame.code == close_code::NORMAL || frame.code == close_code::AWAY =>
        {
            info!(session_id = %session_id, addr = %peer, code = frame.code, "websocket console client disconnected");
        }
        Disconnect::Closed(Some(frame)) => {
            error!(
                session_id = %session_id,
                addr = %peer,
                code = frame.code,
                reason = frame.reason.as_str(),
                "websocket console client closed abnormally"
            );
        }
        Disconnect::Closed(None) => {
            error!(session_id = %session_id, addr = %peer, code = close_code::STATUS, "websocket console client closed without status");
        }
        Disconnect::Ended => {
            error!(session_id = %session_id, addr = %peer, code = close_code::ABNORMAL, "websocket console connection dropped");
        }
        Disconnect::Error(err) => {
            error!(session_id = %session_id, addr = %peer, code = close_code::ABNORMAL, "websocket console read failed: {err}");
        }
        Disconnect::Cancelled => {
            debug!(session_id = %session_id, addr = %peer, "websocket console client closed by server");
        }
    }
}
