pub mod host_keys;
pub mod line_editor;
pub mod session;

use anyhow::{Context, Result};
use russh::server::{Auth, Config, Handler, Msg, Server, Session};
use russh::{Channel, ChannelId, Pty};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use libmcrunner::auth::passwords_match;
use libmcrunner::{ConsoleRegistry, RemoteSession, StdinMux};
use mc_runner_protocol::SessionId;

use crate::host_keys::HostKeyStore;
use crate::line_editor::{EditorEvent, LineEditor};
use crate::session::SshSession;

#[derive(Debug, Clone)]
pub struct SshConsoleConfig {
    pub listen: SocketAddr,
    pub password: String,
    /// Directory holding the host key file.
    pub key_dir: PathBuf,
}

struct ConsoleContext {
    registry: Arc<ConsoleRegistry>,
    stdin: StdinMux,
    password: String,
}

/// Bind `config.listen` and serve SSH console sessions until `shutdown` is
/// cancelled.
pub async fn serve(
    config: SshConsoleConfig,
    registry: Arc<ConsoleRegistry>,
    stdin: StdinMux,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind remote console on {}", config.listen))?;
    serve_listener(listener, config.password, config.key_dir, registry, stdin, shutdown).await
}

/// Load or create the host keys in `key_dir` and serve SSH console sessions
/// on an already bound `listener` until `shutdown` is cancelled.
pub async fn serve_listener(
    listener: TcpListener,
    password: String,
    key_dir: PathBuf,
    registry: Arc<ConsoleRegistry>,
    stdin: StdinMux,
    shutdown: CancellationToken,
) -> Result<()> {
    let keys = tokio::task::spawn_blocking(move || HostKeyStore::new(key_dir).ensure())
        .await
        .context("host key task panicked")??;

    let russh_config = Config {
        keys: keys.to_russh_keys()?,
        auth_rejection_time: Duration::from_secs(1),
        ..Default::default()
    };

    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "remote console listening");
    }

    let mut server = ConsoleServer {
        ctx: Arc::new(ConsoleContext {
            registry,
            stdin,
            password,
        }),
        shutdown: shutdown.clone(),
    };
    let running = async { server.run_on_socket(Arc::new(russh_config), &listener).await };

    tokio::select! {
        result = running => result.context("remote console server failed"),
        () = shutdown.cancelled() => Ok(()),
    }
}

struct ConsoleServer {
    ctx: Arc<ConsoleContext>,
    shutdown: CancellationToken,
}

impl Server for ConsoleServer {
    type Handler = ConsoleHandler;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> ConsoleHandler {
        let cancel = self.shutdown.child_token();
        ConsoleHandler {
            ctx: self.ctx.clone(),
            peer,
            user: String::new(),
            pty: false,
            shell_started: false,
            input_tx: None,
            _disconnect: cancel.clone().drop_guard(),
            cancel,
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        debug!("remote console connection ended with error: {error:#}");
    }
}

struct ConsoleHandler {
    ctx: Arc<ConsoleContext>,
    peer: Option<SocketAddr>,
    user: String,
    pty: bool,
    shell_started: bool,
    input_tx: Option<mpsc::Sender<Vec<u8>>>,
    cancel: CancellationToken,
    // Ends the session task when russh drops the handler on disconnect.
    _disconnect: DropGuard,
}

impl ConsoleHandler {
    fn peer_label(&self) -> String {
        self.peer
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

impl Handler for ConsoleHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if passwords_match(&self.ctx.password, password) {
            self.user = user.to_string();
            return Ok(Auth::Accept);
        }
        warn!(user, addr = %self.peer_label(), "Remote console session rejected");
        Ok(Auth::reject())
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(!self.shell_started)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.pty = true;
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.shell_started {
            session.channel_failure(channel)?;
            return Ok(());
        }
        self.shell_started = true;
        session.channel_success(channel)?;

        let console = Arc::new(SshSession::new(
            SessionId::new_v4(),
            session.handle(),
            channel,
            self.pty,
            self.cancel.clone(),
        ));
        let (input_tx, input_rx) = mpsc::channel(64);
        self.input_tx = Some(input_tx);

        tokio::spawn(run_session(
            self.ctx.clone(),
            console,
            input_rx,
            self.pty,
            self.user.clone(),
            self.peer_label(),
            self.cancel.clone(),
        ));
        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = &self.input_tx
            && tx.send(data.to_vec()).await.is_err()
        {
            self.input_tx = None;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.input_tx = None;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.input_tx = None;
        self.cancel.cancel();
        Ok(())
    }
}

/// Registered for its whole lifetime; forwards completed lines to stdin until
/// the user ends input, the channel closes or the server shuts down.
async fn run_session(
    ctx: Arc<ConsoleContext>,
    console: Arc<SshSession>,
    raw_rx: mpsc::Receiver<Vec<u8>>,
    pty: bool,
    user: String,
    addr: String,
    cancel: CancellationToken,
) {
    let session_id = ctx.registry.register(console.clone());
    info!(session_id = %session_id, user = %user, addr = %addr, "Remote console session accepted");

    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
    let reader = tokio::spawn(read_lines(console.clone(), raw_rx, line_tx, pty));

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            line = line_rx.recv() => {
                let Some(line) = line else {
                    break;
                };
                if let Err(err) = ctx.stdin.write_line(&line).await {
                    warn!(session_id = %session_id, "failed to write console input: {err}");
                }
            }
        }
    }

    reader.abort();
    ctx.registry.unregister(&session_id);
    console.close().await;
    info!(session_id = %session_id, "Remote console session ended");
}

async fn read_lines(
    console: Arc<SshSession>,
    mut raw_rx: mpsc::Receiver<Vec<u8>>,
    line_tx: mpsc::Sender<String>,
    echo: bool,
) {
    let mut editor = LineEditor::new(echo);
    while let Some(bytes) = raw_rx.recv().await {
        for event in editor.feed(&bytes) {
            match event {
                EditorEvent::Echo(bytes) => {
                    if console.echo(&bytes).await.is_err() {
                        return;
                    }
                }
                EditorEvent::Line(line) => {
                    if line_tx.send(line).await.is_err() {
                        return;
                    }
                }
                EditorEvent::Eof => return,
            }
        }
    }
}
