pub mod paths;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a remote console session.
pub type SessionId = uuid::Uuid;

/// Subprotocol a WebSocket client must offer; the auth token follows it.
pub const WS_SUBPROTOCOL: &str = "mc-server-runner-ws-v1";

pub const DEFAULT_SSH_PORT: u16 = 2222;
pub const DEFAULT_RCON_PORT: u16 = 25575;
pub const DEFAULT_CONSOLE_PASSWORD: &str = "minecraft";
pub const DEFAULT_WEBSOCKET_ADDRESS: &str = "0.0.0.0:80";
pub const DEFAULT_LOG_BUFFER_SIZE: usize = 50;

pub const REASON_ORIGIN_NOT_ALLOWED: &str = "origin not allowed";
pub const REASON_INVALID_PASSWORD: &str = "invalid password";

/// Which child stream a console line came from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Frames a WebSocket client may send.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    Stdin { content: String },
}

/// Frames the server sends to WebSocket clients, including the body of
/// rejected upgrade requests.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    Stdout {
        content: String,
        time: DateTime<Utc>,
    },
    Stderr {
        content: String,
        time: DateTime<Utc>,
    },
    Welcome {
        #[serde(rename = "recentLines")]
        recent_lines: Vec<String>,
    },
    AuthErr {
        reason: String,
    },
}

impl WsServerMessage {
    pub fn output(stream: OutputStream, content: String, time: DateTime<Utc>) -> Self {
        match stream {
            OutputStream::Stdout => Self::Stdout { content, time },
            OutputStream::Stderr => Self::Stderr { content, time },
        }
    }

    pub fn auth_err(reason: impl Into<String>) -> Self {
        Self::AuthErr {
            reason: reason.into(),
        }
    }
}
