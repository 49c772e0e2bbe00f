//! The supervised server process.

use anyhow::{Context, Result};
use std::process::{ExitStatus, Stdio};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Exit code used when the child's status cannot be determined.
pub const UNKNOWN_EXIT_CODE: i32 = 1;

/// Handle to the running child: request a kill, await the exit code.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Option<u32>,
    kill_tx: mpsc::Sender<()>,
    exit_rx: oneshot::Receiver<i32>,
}

/// A freshly spawned child with whichever stdio handles were available.
pub struct SpawnedChild {
    pub process: ChildProcess,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

pub fn spawn(program: &str, args: &[String]) -> Result<SpawnedChild> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start {program}"))?;

    let pid = child.id();
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    debug!(pid, program, "server process started");

    let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
    let (exit_tx, exit_rx) = oneshot::channel();

    tokio::spawn(async move {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(()) = kill_rx.recv() => {
                    if let Err(err) = child.start_kill() {
                        error!("failed to kill server process: {err}");
                    }
                }
            }
        };
        let _ = exit_tx.send(exit_code(status));
    });

    Ok(SpawnedChild {
        process: ChildProcess {
            pid,
            kill_tx,
            exit_rx,
        },
        stdin,
        stdout,
        stderr,
    })
}

impl ChildProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask for SIGKILL. Returns immediately; the exit is observed via
    /// [`ChildProcess::wait`].
    pub fn kill(&self) {
        if self.kill_tx.try_send(()).is_err() {
            debug!("kill already requested or process gone");
        }
    }

    /// Resolves with the exit code once the process is gone. Cancel-safe
    /// when polled by reference.
    pub async fn wait(&mut self) -> i32 {
        match (&mut self.exit_rx).await {
            Ok(code) => code,
            Err(_) => {
                warn!("lost track of server process");
                UNKNOWN_EXIT_CODE
            }
        }
    }
}

/// Map a wait result to the code the supervisor exits with.
pub fn exit_code(status: std::io::Result<ExitStatus>) -> i32 {
    match status {
        Ok(status) => {
            if let Some(code) = status.code() {
                return code;
            }
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    return 128 + signal;
                }
            }
            UNKNOWN_EXIT_CODE
        }
        Err(err) => {
            error!("failed to wait for server process: {err}");
            UNKNOWN_EXIT_CODE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{UNKNOWN_EXIT_CODE, exit_code, spawn};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let mut child = spawn("sh", &sh("exit 3")).expect("spawn");
        assert_eq!(child.process.wait().await, 3);
    }

    #[tokio::test]
    async fn stdio_is_piped() {
        let mut child = spawn("sh", &sh("read line; echo \"got $line\"; echo oops >&2")).expect("spawn");
        let mut stdin = child.stdin.take().expect("stdin");
        stdin.write_all(b"stop\n").await.unwrap();
        drop(stdin);

        let mut out = String::new();
        child.stdout.take().expect("stdout").read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        child.stderr.take().expect("stderr").read_to_string(&mut err).await.unwrap();
        assert_eq!(out, "got stop\n");
        assert_eq!(err, "oops\n");
        assert_eq!(child.process.wait().await, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn killed_child_exits_with_signal_code() {
        let mut child = spawn("sh", &sh("sleep 30")).expect("spawn");
        child.process.kill();
        let code = tokio::time::timeout(Duration::from_secs(5), child.process.wait())
            .await
            .expect("child should die");
        assert_eq!(code, 128 + 9);
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        assert!(spawn("/nonexistent/server-binary", &[]).is_err());
    }

    #[test]
    fn wait_errors_map_to_unknown_code() {
        let err = std::io::Error::other("boom");
        assert_eq!(exit_code(Err(err)), UNKNOWN_EXIT_CODE);
    }
}
