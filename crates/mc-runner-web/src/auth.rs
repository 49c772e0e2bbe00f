use axum::Json;
use axum::http::header::{ORIGIN, SEC_WEBSOCKET_PROTOCOL};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use libmcrunner::auth::passwords_match;
use mc_runner_protocol::{
    REASON_INVALID_PASSWORD, REASON_ORIGIN_NOT_ALLOWED, WS_SUBPROTOCOL, WsServerMessage,
};

use crate::WebConsoleSettings;

/// Why an upgrade request was refused before the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    OriginNotAllowed,
    InvalidPassword,
}

impl Rejection {
    pub fn status(self) -> StatusCode {
        match self {
            Rejection::OriginNotAllowed => StatusCode::FORBIDDEN,
            Rejection::InvalidPassword => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Rejection::OriginNotAllowed => REASON_ORIGIN_NOT_ALLOWED,
            Rejection::InvalidPassword => REASON_INVALID_PASSWORD,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status(), Json(WsServerMessage::auth_err(self.reason()))).into_response()
    }
}

/// Origin check first, then the subprotocol token.
pub fn authorize(headers: &HeaderMap, settings: &WebConsoleSettings) -> Result<(), Rejection> {
    if !settings.disable_origin_check {
        let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
        let allowed = origin
            .is_some_and(|origin| settings.allowed_origins.iter().any(|o| o == origin));
        if !allowed {
            return Err(Rejection::OriginNotAllowed);
        }
    }

    if !settings.disable_authentication {
        let token = extract_token(headers).unwrap_or_default();
        if !passwords_match(&settings.password, &token) {
            return Err(Rejection::InvalidPassword);
        }
    }

    Ok(())
}

/// The token is the protocol entry right after [`WS_SUBPROTOCOL`] in
/// `Sec-WebSocket-Protocol`.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    let entries: Vec<&str> = headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .collect();
    let idx = entries.iter().position(|p| *p == WS_SUBPROTOCOL)?;
    entries.get(idx + 1).map(|token| token.to_string())
}
