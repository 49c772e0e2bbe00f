use mc_runner_protocol::SessionId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("child stdin is not available")]
    StdinUnavailable,

    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    #[error("write to session {0} timed out")]
    WriteTimeout(SessionId),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
