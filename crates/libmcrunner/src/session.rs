use async_trait::async_trait;
use mc_runner_protocol::SessionId;

use crate::error::ConsoleError;
use crate::output::OutputLine;

/// A connected remote console (SSH channel or WebSocket client).
///
/// Output is pushed by the relay fabric through [`RemoteSession::send_output`];
/// input flows the other way through the session's own read loop, which calls
/// into the shared stdin multiplexer.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn id(&self) -> SessionId;

    /// Short transport label used in logs ("ssh", "websocket").
    fn kind(&self) -> &'static str;

    async fn send_output(&self, line: &OutputLine) -> Result<(), ConsoleError>;

    /// Tear down the underlying connection. Must be safe to call more than once.
    async fn close(&self);
}
