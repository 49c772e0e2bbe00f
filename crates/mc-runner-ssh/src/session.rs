use async_trait::async_trait;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use std::borrow::Cow;
use tokio_util::sync::CancellationToken;

use libmcrunner::{ConsoleError, OutputLine, RemoteSession};
use mc_runner_protocol::{OutputStream, SessionId};

/// SSH extended-data stream number for stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// One authenticated SSH shell channel.
pub struct SshSession {
    id: SessionId,
    handle: Handle,
    channel: ChannelId,
    pty: bool,
    cancel: CancellationToken,
}

impl SshSession {
    pub fn new(
        id: SessionId,
        handle: Handle,
        channel: ChannelId,
        pty: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            handle,
            channel,
            pty,
            cancel,
        }
    }

    pub async fn echo(&self, bytes: &[u8]) -> Result<(), ConsoleError> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(bytes))
            .await
            .map_err(|_| ConsoleError::SessionClosed(self.id))
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "ssh"
    }

    async fn send_output(&self, line: &OutputLine) -> Result<(), ConsoleError> {
        let text = if self.pty {
            to_crlf(&line.content)
        } else {
            Cow::Borrowed(line.content.as_str())
        };
        let data = CryptoVec::from_slice(text.as_bytes());
        let sent = match line.stream {
            OutputStream::Stdout => self.handle.data(self.channel, data).await,
            OutputStream::Stderr => {
                self.handle
                    .extended_data(self.channel, SSH_EXTENDED_DATA_STDERR, data)
                    .await
            }
        };
        sent.map_err(|_| ConsoleError::SessionClosed(self.id))
    }

    async fn close(&self) {
        self.cancel.cancel();
        let _ = self.handle.close(self.channel).await;
    }
}

/// Terminals attached through a PTY expect CRLF line endings.
fn to_crlf(text: &str) -> Cow<'_, str> {
    if !text.contains('\n') {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 2);
    let mut prev = '\0';
    for ch in text.chars() {
        if ch == '\n' && prev != '\r' {
            out.push('\r');
        }
        out.push(ch);
        prev = ch;
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::to_crlf;

    #[test]
    fn bare_newlines_become_crlf() {
        assert_eq!(to_crlf("Done!\n"), "Done!\r\n");
        assert_eq!(to_crlf("a\nb\r\n"), "a\r\nb\r\n");
        assert_eq!(to_crlf("no newline"), "no newline");
    }
}
