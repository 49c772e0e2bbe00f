//! Console input from a FIFO on the filesystem, so tools like
//! `echo "say hi" > /tmp/console` reach the server.

use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use libmcrunner::StdinMux;

/// Relay lines written to the FIFO at `path` into the server's stdin until
/// `cancel` fires. A failure is sent once on `errors` and ends the task.
pub fn spawn(
    path: PathBuf,
    stdin: StdinMux,
    errors: mpsc::Sender<anyhow::Error>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = imp::run(&path, &stdin, &cancel).await {
            let _ = errors.send(err).await;
        }
    })
}

#[cfg(target_os = "linux")]
mod imp {
    use anyhow::{Context, Result, bail};
    use nix::sys::stat::Mode;
    use std::os::unix::fs::FileTypeExt;
    use std::path::Path;
    use tokio::io::BufReader;
    use tokio::net::unix::pipe;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, warn};

    use libmcrunner::{StdinMux, relay_lines};

    pub(super) async fn run(path: &Path, stdin: &StdinMux, cancel: &CancellationToken) -> Result<()> {
        ensure_fifo(path)?;
        info!(path = %path.display(), "reading console input from named pipe");

        let result = tokio::select! {
            () = cancel.cancelled() => Ok(()),
            result = relay(path, stdin) => result,
        };

        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed named pipe"),
            Err(err) => warn!(path = %path.display(), "failed to remove named pipe: {err}"),
        }
        result
    }

    fn ensure_fifo(path: &Path) -> Result<()> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.file_type().is_fifo() => Ok(()),
            Ok(_) => bail!("existing path {} is not a named pipe", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o666))
                    .with_context(|| format!("failed to create named pipe {}", path.display()))
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed to stat named pipe {}", path.display()))
            }
        }
    }

    /// Opened read-write so the pipe never reports EOF between writers; a
    /// new writer simply continues the stream.
    async fn relay(path: &Path, stdin: &StdinMux) -> Result<()> {
        loop {
            let receiver = pipe::OpenOptions::new()
                .read_write(true)
                .open_receiver(path)
                .with_context(|| format!("failed to open named pipe {}", path.display()))?;
            relay_lines(BufReader::new(receiver), stdin, "named_pipe")
                .await
                .with_context(|| format!("failed to read named pipe {}", path.display()))?;
            debug!(path = %path.display(), "named pipe reached EOF, reopening");
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use anyhow::Result;
    use std::path::Path;
    use tokio_util::sync::CancellationToken;
    use tracing::warn;

    use libmcrunner::StdinMux;

    pub(super) async fn run(path: &Path, _stdin: &StdinMux, _cancel: &CancellationToken) -> Result<()> {
        warn!(path = %path.display(), "named pipe console input is only supported on Linux");
        Ok(())
    }
}
