use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use bytes::Bytes;
use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use libmcrunner::{ConsoleError, ConsoleRegistry, LineRing, OutputLine, RemoteSession};
use mc_runner_protocol::{SessionId, WsServerMessage};

/// Write half of one WebSocket console connection.
///
/// All frames go through `sink` under its lock, each bounded by
/// `write_timeout`.
pub struct WsClient {
    id: SessionId,
    peer: SocketAddr,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    write_timeout: Duration,
    cancel: CancellationToken,
}

impl WsClient {
    pub fn new(
        sink: SplitSink<WebSocket, Message>,
        peer: SocketAddr,
        write_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: SessionId::new_v4(),
            peer,
            sink: Mutex::new(sink),
            write_timeout,
            cancel,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Register and send the welcome frame while holding the write lock, so
    /// no broadcast line can reach the client ahead of the replay.
    pub async fn join(
        self: &Arc<Self>,
        registry: &ConsoleRegistry,
        ring: &LineRing,
    ) -> Result<(), ConsoleError> {
        let mut sink = self.sink.lock().await;
        registry.register(self.clone());
        let welcome = WsServerMessage::Welcome {
            recent_lines: ring.snapshot(),
        };
        self.send_locked(&mut sink, encode(&welcome)?).await
    }

    pub async fn ping(&self) -> Result<(), ConsoleError> {
        let mut sink = self.sink.lock().await;
        self.send_locked(&mut sink, Message::Ping(Bytes::new())).await
    }

    async fn send(&self, message: &WsServerMessage) -> Result<(), ConsoleError> {
        let frame = encode(message)?;
        let mut sink = self.sink.lock().await;
        self.send_locked(&mut sink, frame).await
    }

    async fn send_locked(
        &self,
        sink: &mut SplitSink<WebSocket, Message>,
        frame: Message,
    ) -> Result<(), ConsoleError> {
        match tokio::time::timeout(self.write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ConsoleError::Transport(err.to_string())),
            Err(_) => Err(ConsoleError::WriteTimeout(self.id)),
        }
    }
}

#[async_trait]
impl RemoteSession for WsClient {
    fn id(&self) -> SessionId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "websocket"
    }

    async fn send_output(&self, line: &OutputLine) -> Result<(), ConsoleError> {
        self.send(&WsServerMessage::output(
            line.stream,
            line.content.clone(),
            line.time,
        ))
        .await
    }

    async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let frame = Message::Close(Some(CloseFrame {
            code: close_code::ERROR,
            reason: "closing client".into(),
        }));
        let mut sink = self.sink.lock().await;
        let _ = self.send_locked(&mut sink, frame).await;
    }
}

fn encode(message: &WsServerMessage) -> Result<Message, ConsoleError> {
    let json =
        serde_json::to_string(message).map_err(|err| ConsoleError::Transport(err.to_string()))?;
    Ok(Message::Text(json.into()))
}
