//! Delivery of console commands to the server: through `rcon-cli` when RCON
//! is enabled and the client is installed, otherwise on stdin.

use anyhow::{Context, Result, anyhow, bail};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error};

use libmcrunner::{ConsoleError, StdinMux};

use crate::config::RconSettings;

pub const RCON_CLI: &str = "rcon-cli";

/// How long one `rcon-cli` call may take before the command is sent on
/// stdin instead.
pub const RCON_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RconTarget {
    Config(PathBuf),
    Direct { port: u16, password: String },
}

/// An `rcon-cli` executable and how to reach the server with it.
#[derive(Debug, Clone)]
pub struct RconCli {
    program: PathBuf,
    target: RconTarget,
    timeout: Duration,
}

impl RconCli {
    pub fn new(program: impl Into<PathBuf>, target: RconTarget) -> Self {
        Self {
            program: program.into(),
            target,
            timeout: RCON_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `None` unless RCON is enabled and `rcon-cli` is on `PATH`.
    pub fn detect(settings: &RconSettings) -> Option<Self> {
        if !settings.enabled {
            return None;
        }
        let program = match which::which(RCON_CLI) {
            Ok(path) => path,
            Err(err) => {
                debug!("RCON enabled but {RCON_CLI} not found: {err}");
                return None;
            }
        };
        let target = match &settings.config_file {
            Some(path) => RconTarget::Config(path.clone()),
            None => RconTarget::Direct {
                port: settings.port,
                password: settings.password.clone(),
            },
        };
        Some(Self::new(program, target))
    }

    pub fn args(&self, command: &str) -> Vec<String> {
        let mut args = match &self.target {
            RconTarget::Config(path) => {
                vec!["--config".to_string(), path.display().to_string()]
            }
            RconTarget::Direct { port, password } => vec![
                "--port".to_string(),
                port.to_string(),
                "--password".to_string(),
                password.clone(),
            ],
        };
        args.extend(command.split_whitespace().map(str::to_string));
        args
    }

    /// Run one command. A call that outlives the timeout is killed and
    /// reported as a failure.
    pub async fn run(&self, command: &str) -> Result<()> {
        let running = Command::new(&self.program)
            .args(self.args(command))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, running)
            .await
            .map_err(|_| anyhow!("{RCON_CLI} did not finish within {:?}", self.timeout))?
            .with_context(|| format!("failed to run {}", self.program.display()))?;

        if !output.status.success() {
            bail!(
                "{RCON_CLI} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Sends announcements and the stop command, preferring RCON and falling
/// back to the server's stdin.
#[derive(Clone)]
pub struct CommandDispatcher {
    rcon: Option<RconCli>,
    stdin: StdinMux,
}

impl CommandDispatcher {
    pub fn new(rcon: Option<RconCli>, stdin: StdinMux) -> Self {
        Self { rcon, stdin }
    }

    pub fn uses_rcon(&self) -> bool {
        self.rcon.is_some()
    }

    pub async fn send(&self, command: &str) -> Result<(), ConsoleError> {
        if let Some(rcon) = &self.rcon {
            match rcon.run(command).await {
                Ok(()) => {
                    debug!(command, "sent via {RCON_CLI}");
                    return Ok(());
                }
                Err(err) => error!(command, "failed to send via {RCON_CLI}, using console: {err:#}"),
            }
        }
        self.stdin.write_line(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandDispatcher, RconCli, RconTarget};
    use crate::config::RconSettings;
    use libmcrunner::StdinMux;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[cfg(unix)]
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("rcon-cli");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[test]
    fn direct_target_passes_port_and_password() {
        let cli = RconCli::new(
            "/usr/bin/rcon-cli",
            RconTarget::Direct {
                port: 25575,
                password: "minecraft".to_string(),
            },
        );
        assert_eq!(
            cli.args("say Server shutting down in 10 seconds"),
            vec![
                "--port", "25575", "--password", "minecraft", "say", "Server", "shutting",
                "down", "in", "10", "seconds"
            ]
        );
    }

    #[test]
    fn config_target_passes_config_file() {
        let cli = RconCli::new(
            "rcon-cli",
            RconTarget::Config(PathBuf::from("/data/.rcon-cli.yaml")),
        );
        assert_eq!(
            cli.args("stop"),
            vec!["--config", "/data/.rcon-cli.yaml", "stop"]
        );
    }

    #[test]
    fn detect_requires_rcon_enabled() {
        let settings = RconSettings {
            enabled: false,
            port: 25575,
            password: "minecraft".to_string(),
            config_file: None,
        };
        assert!(RconCli::detect(&settings).is_none());
    }

    #[tokio::test]
    async fn without_rcon_commands_go_to_stdin() {
        let (writer, reader) = tokio::io::duplex(1024);
        let dispatcher = CommandDispatcher::new(None, StdinMux::new(writer));
        assert!(!dispatcher.uses_rcon());
        dispatcher.send("stop").await.expect("send");

        let mut lines = BufReader::new(reader).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn failed_rcon_falls_back_to_stdin() {
        let (writer, reader) = tokio::io::duplex(1024);
        let missing = RconCli::new(
            "/nonexistent/rcon-cli",
            RconTarget::Direct {
                port: 25575,
                password: "minecraft".to_string(),
            },
        );
        let dispatcher = CommandDispatcher::new(Some(missing), StdinMux::new(writer));
        dispatcher.send("save-all").await.expect("send");

        let mut lines = BufReader::new(reader).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("save-all"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rcon_cli_receives_command_words() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("args.txt");
        let script = write_script(
            dir.path(),
            &format!("echo \"$@\" > '{}'", record.display()),
        );

        let cli = RconCli::new(
            &script,
            RconTarget::Direct {
                port: 25600,
                password: "pw".to_string(),
            },
        );
        let dispatcher = CommandDispatcher::new(Some(cli), StdinMux::detached());
        dispatcher.send("stop").await.expect("send");

        let recorded = std::fs::read_to_string(&record).unwrap();
        assert_eq!(recorded.trim(), "--port 25600 --password pw stop");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_rcon_cli_times_out_and_falls_back_to_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exec sleep 60");
        let cli = RconCli::new(&script, RconTarget::Config(dir.path().join("rcon.yaml")))
            .with_timeout(Duration::from_millis(200));

        let (writer, reader) = tokio::io::duplex(1024);
        let dispatcher = CommandDispatcher::new(Some(cli), StdinMux::new(writer));
        let started = Instant::now();
        dispatcher.send("stop").await.expect("send");
        assert!(started.elapsed() < Duration::from_secs(10), "took {:?}", started.elapsed());

        let mut lines = BufReader::new(reader).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("stop"));
    }
}
