use anyhow::{Context, Result};
use futures_util::future::join_all;
use std::future::pending;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use libmcrunner::{ConsoleRegistry, LineRing, OutputRelay, StdinMux, relay_lines};
use mc_runner_protocol::paths::home_dir;
use mc_runner_protocol::{DEFAULT_LOG_BUFFER_SIZE, DEFAULT_SSH_PORT, OutputStream};
use mc_runner_ssh::SshConsoleConfig;
use mc_runner_web::WebState;

use crate::command::{CommandDispatcher, RconCli};
use crate::config::{Args, RconSettings, WebConsoleConfig};
use crate::named_pipe;
use crate::process::{self, ChildProcess};
use crate::termination::{
    TerminationAction, TerminationController, TerminationEvent, TerminationState, announcement,
};

/// How long output relays and the named pipe get to wind down after exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Exit code when a stop is requested but no server process exists.
const NO_CHILD_EXIT_CODE: i32 = 1;

type Timer = Option<Pin<Box<Sleep>>>;

pub struct Supervisor {
    args: Args,
    rcon: RconSettings,
    web: Option<WebConsoleConfig>,
}

impl Supervisor {
    pub fn new(args: Args, rcon: RconSettings, web: Option<WebConsoleConfig>) -> Self {
        Self { args, rcon, web }
    }

    pub fn from_env(args: Args) -> Self {
        let rcon = RconSettings::from_env();
        let web = args
            .websocket_console
            .then(|| WebConsoleConfig::from_env(&rcon));
        Self::new(args, rcon, web)
    }

    /// Run the server until it exits and return the code to exit with.
    pub async fn run(self) -> Result<i32> {
        let (program, program_args) = self
            .args
            .command_line()
            .context("missing server executable")?;
        let mut signals = Signals::install()?;

        let cancel = CancellationToken::new();
        let registry = Arc::new(ConsoleRegistry::new());
        let ring = Arc::new(LineRing::new(
            self.web
                .as_ref()
                .map_or(DEFAULT_LOG_BUFFER_SIZE, |web| web.log_buffer_size),
        ));
        // Output relays and the named pipe; awaited briefly on exit.
        let mut background: Vec<JoinHandle<()>> = Vec::new();

        let (mut child, stdin) = match process::spawn(&program, &program_args) {
            Ok(spawned) => {
                info!(pid = spawned.process.pid(), program = %program, "server started");
                let stdin = match spawned.stdin {
                    Some(stdin) => StdinMux::new(stdin),
                    None => {
                        error!("unable to get server stdin");
                        StdinMux::detached()
                    }
                };
                match spawned.stdout {
                    Some(stdout) => background.push(spawn_output_relay(
                        OutputStream::Stdout,
                        stdout,
                        tokio::io::stdout(),
                        &ring,
                        &registry,
                    )),
                    None => error!("unable to get server stdout"),
                }
                match spawned.stderr {
                    Some(stderr) => background.push(spawn_output_relay(
                        OutputStream::Stderr,
                        stderr,
                        tokio::io::stderr(),
                        &ring,
                        &registry,
                    )),
                    None => error!("unable to get server stderr"),
                }
                (Some(spawned.process), stdin)
            }
            Err(err) => {
                error!("failed to start server: {err:#}");
                (None, StdinMux::detached())
            }
        };

        if !self.args.detach_stdin {
            let stdin = stdin.clone();
            tokio::spawn(async move {
                let local = BufReader::new(tokio::io::stdin());
                match relay_lines(local, &stdin, "stdin").await {
                    Ok(lines) => debug!(lines, "local stdin closed"),
                    Err(err) => error!("failed to relay standard input: {err}"),
                }
            });
        }

        if let Some(path) = &self.args.bootstrap {
            match tokio::fs::read(path).await {
                Ok(content) => {
                    if let Err(err) = stdin.write_raw(&content).await {
                        error!(path = %path.display(), "failed to write bootstrap content: {err}");
                    }
                }
                Err(err) => {
                    error!(path = %path.display(), "failed to read bootstrap commands: {err}")
                }
            }
        }

        let (error_tx, mut error_rx) = mpsc::channel::<anyhow::Error>(8);

        if let Some(path) = &self.args.named_pipe {
            background.push(named_pipe::spawn(
                path.clone(),
                stdin.clone(),
                error_tx.clone(),
                cancel.child_token(),
            ));
        }

        if self.args.remote_console {
            let config = SshConsoleConfig {
                listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_SSH_PORT)),
                password: self.rcon.password.clone(),
                key_dir: home_dir(),
            };
            let registry = registry.clone();
            let stdin = stdin.clone();
            let shutdown = cancel.child_token();
            let errors = error_tx.clone();
            tokio::spawn(async move {
                if let Err(err) = mc_runner_ssh::serve(config, registry, stdin, shutdown).await {
                    let _ = errors.send(err).await;
                }
            });
            info!("running with remote console support");
        }

        if let Some(web) = self.web.clone() {
            let state = Arc::new(WebState {
                registry: registry.clone(),
                ring: ring.clone(),
                stdin: stdin.clone(),
                settings: web.settings,
                shutdown: cancel.child_token(),
            });
            let errors = error_tx.clone();
            tokio::spawn(async move {
                if let Err(err) = mc_runner_web::bind_and_serve(&web.address, state).await {
                    let _ = errors.send(err).await;
                }
            });
        }
        drop(error_tx);

        let dispatcher = CommandDispatcher::new(RconCli::detect(&self.rcon), stdin.clone());
        if dispatcher.uses_rcon() {
            debug!("console commands will be sent with rcon-cli");
        }

        let mut controller = TerminationController::new(
            self.args.stop_server_announce_delay,
            self.args.stop_duration,
        );
        let mut announce_timer: Timer = None;
        let mut kill_timer: Timer = None;

        let outcome = loop {
            let event = tokio::select! {
                code = wait_child(&mut child) => break RunOutcome::Exited(code),
                event = signals.next() => event,
                () = wait_timer(&mut announce_timer) => {
                    announce_timer = None;
                    info!("announce delay elapsed, stopping server");
                    TerminationEvent::AnnounceElapsed
                }
                () = wait_timer(&mut kill_timer) => {
                    kill_timer = None;
                    TerminationEvent::KillElapsed
                }
                Some(err) = error_rx.recv() => {
                    error!("background task failed: {err:#}");
                    continue;
                }
            };

            let before = controller.state();
            let actions = controller.handle(event);
            log_event(event, before, actions.is_empty());

            for action in actions {
                match action {
                    TerminationAction::Announce(delay) => {
                        info!("announcing server shutdown");
                        if let Err(err) = dispatcher.send(&announcement(delay)).await {
                            error!("failed to send shutdown announcement: {err}");
                        }
                    }
                    TerminationAction::ArmAnnounceTimer(delay) => {
                        info!(delay = ?delay, "waiting before server stop");
                        announce_timer = Some(Box::pin(tokio::time::sleep(delay)));
                    }
                    TerminationAction::CancelAnnounceTimer => announce_timer = None,
                    TerminationAction::SendStop => {
                        let command = stop_command(&self.args.stop_command);
                        info!(command, "sending stop command to server");
                        if let Err(err) = dispatcher.send(command).await {
                            error!("failed to send stop command: {err}");
                        }
                        info!("waiting for completion");
                    }
                    TerminationAction::ArmKillTimer(after) => {
                        kill_timer = Some(Box::pin(tokio::time::sleep(after)));
                    }
                    TerminationAction::Kill => {
                        error!("server took too long to stop, killing it");
                        if let Some(child) = &child {
                            child.kill();
                        }
                    }
                }
            }

            if child.is_none()
                && matches!(
                    controller.state(),
                    TerminationState::Stopping | TerminationState::Killed
                )
            {
                warn!("no server process to wait for");
                break RunOutcome::NoChild;
            }
        };

        if let Some(code) = outcome.failed_server_code() {
            warn!(
                exit_code = code,
                "server process failed; inspect the log lines above for the cause"
            );
        }
        let code = outcome.exit_code();

        cancel.cancel();
        stdin.close().await;
        if tokio::time::timeout(DRAIN_TIMEOUT, join_all(background))
            .await
            .is_err()
        {
            debug!("background tasks still busy after exit");
        }
        info!("done");
        Ok(code)
    }
}

/// How the supervision loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Exited(i32),
    /// The server never started and a stop was requested.
    NoChild,
}

impl RunOutcome {
    fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Exited(code) => code,
            RunOutcome::NoChild => NO_CHILD_EXIT_CODE,
        }
    }

    /// Exit code of a server that ran and failed.
    fn failed_server_code(self) -> Option<i32> {
        match self {
            RunOutcome::Exited(code) if code != 0 => Some(code),
            _ => None,
        }
    }
}

fn spawn_output_relay<R, W>(
    stream: OutputStream,
    reader: R,
    local: W,
    ring: &Arc<LineRing>,
    registry: &Arc<ConsoleRegistry>,
) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Send + 'static,
{
    let relay = OutputRelay::new(stream, ring.clone(), registry.clone()).with_local(local);
    tokio::spawn(async move {
        if let Err(err) = relay.run(reader).await {
            error!(stream = ?stream, "output relay failed: {err}");
        }
    })
}

fn stop_command(configured: &str) -> &str {
    match configured.trim() {
        "" => "stop",
        command => command,
    }
}

async fn wait_child(child: &mut Option<ChildProcess>) -> i32 {
    match child {
        Some(child) => child.wait().await,
        None => pending().await,
    }
}

async fn wait_timer(timer: &mut Timer) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

fn log_event(event: TerminationEvent, before: TerminationState, ignored: bool) {
    match (event, ignored) {
        (TerminationEvent::Terminate, false) => info!("SIGTERM caught, gracefully stopping server"),
        (TerminationEvent::Terminate, true) => {
            info!(state = %before, "SIGTERM caught, server is already stopping")
        }
        (TerminationEvent::Bypass, false) if before == TerminationState::Idle => {
            info!("SIGUSR1 caught, stopping server without announce delay")
        }
        (TerminationEvent::Bypass, false) => {
            info!("SIGUSR1 caught, bypassing running announce delay")
        }
        (TerminationEvent::Bypass, true) => {
            info!(state = %before, "SIGUSR1 caught, server is already stopping")
        }
        (TerminationEvent::KillElapsed, _) | (TerminationEvent::AnnounceElapsed, _) => {
            debug!(event = ?event, state = %before, "termination timer fired")
        }
    }
}

#[cfg(unix)]
struct Signals {
    term: tokio::signal::unix::Signal,
    usr1: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            term: signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?,
            usr1: signal(SignalKind::user_defined1()).context("failed to listen for SIGUSR1")?,
        })
    }

    async fn next(&mut self) -> TerminationEvent {
        tokio::select! {
            Some(()) = self.term.recv() => TerminationEvent::Terminate,
            Some(()) = self.usr1.recv() => TerminationEvent::Bypass,
            else => pending().await,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> TerminationEvent {
        match tokio::signal::ctrl_c().await {
            Ok(()) => TerminationEvent::Terminate,
            Err(err) => {
                error!("failed to listen for ctrl-c: {err}");
                pending().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{NO_CHILD_EXIT_CODE, RunOutcome, Supervisor, stop_command};
    use crate::config::{Args, RconSettings};
    use clap::Parser;

    fn rcon_disabled() -> RconSettings {
        RconSettings {
            enabled: false,
            port: 25575,
            password: "minecraft".to_string(),
            config_file: None,
        }
    }

    fn supervisor(argv: &[&str]) -> Supervisor {
        let mut full = vec!["mc-server-runner", "--detach-stdin"];
        full.extend_from_slice(argv);
        Supervisor::new(Args::try_parse_from(full).expect("args"), rcon_disabled(), None)
    }

    #[test]
    fn blank_stop_command_falls_back_to_stop() {
        assert_eq!(stop_command(""), "stop");
        assert_eq!(stop_command("  "), "stop");
        assert_eq!(stop_command("end"), "end");
    }

    #[test]
    fn only_a_server_that_ran_is_reported_as_failed() {
        assert_eq!(RunOutcome::Exited(3).failed_server_code(), Some(3));
        assert_eq!(RunOutcome::Exited(0).failed_server_code(), None);
        assert_eq!(RunOutcome::NoChild.failed_server_code(), None);
        assert_eq!(RunOutcome::NoChild.exit_code(), NO_CHILD_EXIT_CODE);
        assert_eq!(RunOutcome::Exited(137).exit_code(), 137);
    }

    #[tokio::test]
    async fn child_exit_code_is_returned() {
        let code = supervisor(&["sh", "-c", "exit 7"]).run().await.expect("run");
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn bootstrap_file_is_written_to_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let bootstrap = dir.path().join("bootstrap.txt");
        std::fs::write(&bootstrap, "exit 4\n").unwrap();
        let bootstrap = bootstrap.display().to_string();

        let code = supervisor(&["--bootstrap", &bootstrap, "sh", "-c", "read cmd; eval \"$cmd\""])
            .run()
            .await
            .expect("run");
        assert_eq!(code, 4);
    }

    #[tokio::test]
    async fn shell_option_runs_command_through_shell() {
        let code = supervisor(&["--shell", "sh", "--", "-c", "exit 5"])
            .run()
            .await
            .expect("run");
        assert_eq!(code, 5);
    }
}
