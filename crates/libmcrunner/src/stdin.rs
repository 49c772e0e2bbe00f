use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::ConsoleError;

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Serialises every stdin writer (local terminal, named pipe, remote
/// sessions, stop command) onto the child's single stdin stream.
///
/// Each call writes one complete line under the lock, so lines from
/// different sources never interleave.
#[derive(Clone)]
pub struct StdinMux {
    inner: Arc<Mutex<Option<BoxedWriter>>>,
}

impl StdinMux {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::pin(writer)))),
        }
    }

    /// A mux with no child behind it; every write fails with
    /// [`ConsoleError::StdinUnavailable`].
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn is_attached(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Write `line`, appending `\n` when it is not already terminated.
    pub async fn write_line(&self, line: &str) -> Result<(), ConsoleError> {
        self.write_line_bytes(line.as_bytes()).await
    }

    /// Byte form of [`StdinMux::write_line`]; the server reads raw bytes, so
    /// input need not be UTF-8.
    pub async fn write_line_bytes(&self, line: &[u8]) -> Result<(), ConsoleError> {
        if line.ends_with(b"\n") {
            self.write_raw(line).await
        } else {
            let mut buf = Vec::with_capacity(line.len() + 1);
            buf.extend_from_slice(line);
            buf.push(b'\n');
            self.write_raw(&buf).await
        }
    }

    /// Write bytes as-is.
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<(), ConsoleError> {
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or(ConsoleError::StdinUnavailable)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Drop the underlying writer so the child sees EOF.
    pub async fn close(&self) {
        if let Some(mut writer) = self.inner.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}
