use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use mc_runner_protocol::OutputStream;

use crate::output::{LineRing, OutputLine};
use crate::registry::ConsoleRegistry;
use crate::stdin::StdinMux;

/// Longest line buffered from the child or from a console input source.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Forwards one child output stream line by line to the local terminal, the
/// replay ring and every registered remote session.
pub struct OutputRelay {
    stream: OutputStream,
    ring: Arc<LineRing>,
    registry: Arc<ConsoleRegistry>,
    local: Option<Pin<Box<dyn AsyncWrite + Send>>>,
}

impl OutputRelay {
    pub fn new(stream: OutputStream, ring: Arc<LineRing>, registry: Arc<ConsoleRegistry>) -> Self {
        Self {
            stream,
            ring,
            registry,
            local: None,
        }
    }

    /// Also copy raw bytes to `writer` (normally the supervisor's own
    /// stdout or stderr).
    pub fn with_local<W>(mut self, writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        self.local = Some(Box::pin(writer));
        self
    }

    /// Runs until `reader` reaches EOF or fails. A final unterminated
    /// fragment is delivered as a line of its own, and lines longer than
    /// [`MAX_LINE_LEN`] are delivered in pieces.
    pub async fn run<R>(mut self, reader: R) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            let n = read_line_capped(&mut reader, &mut buf, MAX_LINE_LEN).await?;
            if n == 0 {
                debug!(stream = ?self.stream, "child stream closed");
                return Ok(());
            }
            self.forward(&buf).await;
        }
    }

    async fn forward(&mut self, raw: &[u8]) {
        if let Some(local) = self.local.as_mut() {
            let written = async {
                local.write_all(raw).await?;
                local.flush().await
            }
            .await;
            if let Err(err) = written {
                warn!(stream = ?self.stream, "failed to write to local terminal: {err}");
            }
        }

        let line = OutputLine::new(self.stream, String::from_utf8_lossy(raw).into_owned());
        self.ring.push(line.content.clone());
        self.registry.broadcast(&line);
    }
}

/// Copy newline-framed lines from `reader` into the child's stdin until EOF.
///
/// Lines are forwarded as raw bytes with `\r\n` normalised to `\n`. A line
/// longer than [`MAX_LINE_LEN`] is truncated and the rest of it discarded.
/// Read errors end the relay and are returned; a failed stdin write is
/// logged and the relay keeps going.
pub async fn relay_lines<R>(mut reader: R, stdin: &StdinMux, source: &str) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    let mut forwarded = 0;
    loop {
        buf.clear();
        if read_line_capped(&mut reader, &mut buf, MAX_LINE_LEN).await? == 0 {
            return Ok(forwarded);
        }
        if buf.last() != Some(&b'\n') && buf.len() >= MAX_LINE_LEN {
            let discarded = discard_line(&mut reader).await?;
            warn!(source, limit = MAX_LINE_LEN, discarded, "console input line too long; truncated");
        }

        let line = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        match stdin.write_line_bytes(line).await {
            Ok(()) => forwarded += 1,
            Err(err) => warn!(source, "failed to forward line to server stdin: {err}"),
        }
    }
}

/// Append bytes up to and including the next `\n` to `buf`, stopping early
/// once `buf` holds `limit` bytes. Returns the number of bytes read, 0 at EOF.
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut read = 0;
    while buf.len() < limit {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        let window = &available[..available.len().min(limit - buf.len())];
        let (used, done) = match window.iter().position(|&b| b == b'\n') {
            Some(newline) => (newline + 1, true),
            None => (window.len(), false),
        };
        buf.extend_from_slice(&window[..used]);
        reader.consume(used);
        read += used;
        if done {
            break;
        }
    }
    Ok(read)
}

/// Skip the remainder of the current line, newline included.
async fn discard_line<R>(reader: &mut R) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut discarded = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(discarded);
        }
        let (used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(newline) => (newline + 1, true),
            None => (available.len(), false),
        };
        reader.consume(used);
        discarded += used;
        if done {
            return Ok(discarded);
        }
    }
}
