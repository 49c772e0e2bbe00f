use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use mc_runner_protocol::{
    DEFAULT_CONSOLE_PASSWORD, DEFAULT_LOG_BUFFER_SIZE, DEFAULT_RCON_PORT,
    DEFAULT_WEBSOCKET_ADDRESS,
};
use mc_runner_web::WebConsoleSettings;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "mc-server-runner",
    version,
    about = "Runs a game server process and shares its console"
)]
pub struct Args {
    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,

    /// File whose contents are written to the server's stdin after start.
    #[arg(long, value_name = "FILE")]
    pub bootstrap: Option<PathBuf>,

    /// Command sent to the server to stop it gracefully.
    #[arg(long, default_value = "stop")]
    pub stop_command: String,

    /// How long to wait after the stop command before killing the server
    /// (e.g. 60s, 2m). Zero waits forever.
    #[arg(long, value_parser = parse_duration, default_value = "0s")]
    pub stop_duration: Duration,

    /// Announce the shutdown in-game and wait this long before stopping.
    #[arg(long, value_parser = parse_duration, default_value = "0s")]
    pub stop_server_announce_delay: Duration,

    /// Don't forward this process's stdin to the server.
    #[arg(long)]
    pub detach_stdin: bool,

    /// Serve the console over SSH on port 2222.
    #[arg(long)]
    pub remote_console: bool,

    /// Run the server command through this shell.
    #[arg(long)]
    pub shell: Option<String>,

    /// Create a named pipe at this path whose lines are written to the
    /// server's stdin.
    #[arg(long, value_name = "PATH")]
    pub named_pipe: Option<PathBuf>,

    /// Serve the console over WebSocket.
    #[arg(long)]
    pub websocket_console: bool,

    /// Server executable and its arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Args {
    /// Program and arguments to spawn, honouring `--shell`.
    pub fn command_line(&self) -> Option<(String, Vec<String>)> {
        let (first, rest) = self.command.split_first()?;
        Some(match &self.shell {
            Some(shell) => (shell.clone(), self.command.clone()),
            None => (first.clone(), rest.to_vec()),
        })
    }
}

/// RCON settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconSettings {
    pub enabled: bool,
    pub port: u16,
    pub password: String,
    pub config_file: Option<PathBuf>,
}

impl RconSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = match non_empty(lookup("RCON_PORT")) {
            Some(raw) => raw.trim().parse::<u16>().unwrap_or_else(|_| {
                warn!(value = %raw, "invalid RCON_PORT, using {DEFAULT_RCON_PORT}");
                DEFAULT_RCON_PORT
            }),
            None => DEFAULT_RCON_PORT,
        };

        Self {
            enabled: lookup("ENABLE_RCON").is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
            port,
            password: non_empty(lookup("RCON_PASSWORD"))
                .unwrap_or_else(|| DEFAULT_CONSOLE_PASSWORD.to_string()),
            config_file: non_empty(lookup("RCON_CONFIG_FILE")).map(PathBuf::from),
        }
    }
}

/// WebSocket console settings read from the environment.
#[derive(Debug, Clone)]
pub struct WebConsoleConfig {
    pub address: String,
    pub log_buffer_size: usize,
    pub settings: WebConsoleSettings,
}

impl WebConsoleConfig {
    pub fn from_env(rcon: &RconSettings) -> Self {
        Self::from_lookup(env_lookup, rcon)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, rcon: &RconSettings) -> Self {
        let password =
            non_empty(lookup("WEBSOCKET_PASSWORD")).unwrap_or_else(|| rcon.password.clone());

        let mut settings = WebConsoleSettings::new(password);
        settings.allowed_origins = lookup("WEBSOCKET_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        settings.disable_authentication = env_flag(lookup("WEBSOCKET_DISABLE_AUTHENTICATION"));
        settings.disable_origin_check = env_flag(lookup("WEBSOCKET_DISABLE_ORIGIN_CHECK"));

        let log_buffer_size = match non_empty(lookup("WEBSOCKET_LOG_BUFFER_SIZE")) {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(size) if size > 0 => size,
                _ => {
                    warn!(value = %raw, "invalid WEBSOCKET_LOG_BUFFER_SIZE, using {DEFAULT_LOG_BUFFER_SIZE}");
                    DEFAULT_LOG_BUFFER_SIZE
                }
            },
            None => DEFAULT_LOG_BUFFER_SIZE,
        };

        Self {
            address: non_empty(lookup("WEBSOCKET_ADDRESS"))
                .unwrap_or_else(|| DEFAULT_WEBSOCKET_ADDRESS.to_string()),
            log_buffer_size,
            settings,
        }
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn env_flag(value: Option<String>) -> bool {
    value.is_some_and(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "t" | "true" | "yes" | "on"
        )
    })
}

/// Parse durations like `90s`, `1m30s`, `500ms` or `2h`. A bare number is
/// taken as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|err| format!("{input:?}: {err}"));
    }

    let mut total = 0.0_f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {input:?}"))?;
        if num_end == 0 {
            return Err(format!("invalid duration {input:?}"));
        }
        let value: f64 = rest[..num_end]
            .parse()
            .map_err(|_| format!("invalid number in duration {input:?}"))?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => return Err(format!("unknown unit {unit:?} in duration {input:?}")),
        };
        total += value * scale;
        rest = &rest[unit_end..];
    }

    Duration::try_from_secs_f64(total).map_err(|err| format!("{input:?}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::{Args, RconSettings, WebConsoleConfig, parse_duration};
    use clap::Parser;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn durations_parse_go_style() {
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
        assert_eq!(parse_duration("90s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("1m30s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_duration("15"), Ok(Duration::from_secs(15)));
        assert!(parse_duration("10 parsecs").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("-5").is_err());
    }

    #[test]
    fn args_take_trailing_command_with_flags() {
        let args = Args::try_parse_from([
            "mc-server-runner",
            "--stop-duration",
            "60s",
            "--named-pipe",
            "/tmp/minecraft-console-in",
            "java",
            "-Xmx2G",
            "-jar",
            "server.jar",
            "nogui",
        ])
        .expect("parse");

        assert_eq!(args.stop_duration, Duration::from_secs(60));
        assert_eq!(args.stop_command, "stop");
        assert_eq!(args.named_pipe, Some(PathBuf::from("/tmp/minecraft-console-in")));
        let (program, rest) = args.command_line().expect("command");
        assert_eq!(program, "java");
        assert_eq!(rest, vec!["-Xmx2G", "-jar", "server.jar", "nogui"]);
    }

    #[test]
    fn shell_wraps_the_whole_command() {
        let args = Args::try_parse_from(["mc-server-runner", "--shell", "bash", "start.sh"])
            .expect("parse");
        let (program, rest) = args.command_line().expect("command");
        assert_eq!(program, "bash");
        assert_eq!(rest, vec!["start.sh"]);
    }

    #[test]
    fn missing_command_is_rejected() {
        assert!(Args::try_parse_from(["mc-server-runner", "--debug"]).is_err());
    }

    #[test]
    fn rcon_defaults() {
        let rcon = RconSettings::from_lookup(lookup(&[]));
        assert!(!rcon.enabled);
        assert_eq!(rcon.port, 25575);
        assert_eq!(rcon.password, "minecraft");
        assert_eq!(rcon.config_file, None);
    }

    #[test]
    fn rcon_from_environment() {
        let rcon = RconSettings::from_lookup(lookup(&[
            ("ENABLE_RCON", "TRUE"),
            ("RCON_PORT", "25600"),
            ("RCON_PASSWORD", "s3cret"),
            ("RCON_CONFIG_FILE", "/data/rcon.yml"),
        ]));
        assert!(rcon.enabled);
        assert_eq!(rcon.port, 25600);
        assert_eq!(rcon.password, "s3cret");
        assert_eq!(rcon.config_file, Some(PathBuf::from("/data/rcon.yml")));
    }

    #[test]
    fn websocket_password_falls_back_to_rcon_password() {
        let rcon = RconSettings::from_lookup(lookup(&[("RCON_PASSWORD", "rcon-pw")]));
        let web = WebConsoleConfig::from_lookup(lookup(&[]), &rcon);
        assert_eq!(web.settings.password, "rcon-pw");
        assert_eq!(web.address, "0.0.0.0:80");
        assert_eq!(web.log_buffer_size, 50);

        let web = WebConsoleConfig::from_lookup(lookup(&[("WEBSOCKET_PASSWORD", "ws-pw")]), &rcon);
        assert_eq!(web.settings.password, "ws-pw");
    }

    #[test]
    fn websocket_settings_from_environment() {
        let rcon = RconSettings::from_lookup(lookup(&[]));
        let web = WebConsoleConfig::from_lookup(
            lookup(&[
                ("WEBSOCKET_ADDRESS", "127.0.0.1:8080"),
                (
                    "WEBSOCKET_ALLOWED_ORIGINS",
                    "https://a.example.com, https://b.example.com,",
                ),
                ("WEBSOCKET_DISABLE_AUTHENTICATION", "true"),
                ("WEBSOCKET_DISABLE_ORIGIN_CHECK", "false"),
                ("WEBSOCKET_LOG_BUFFER_SIZE", "200"),
            ]),
            &rcon,
        );
        assert_eq!(web.address, "127.0.0.1:8080");
        assert_eq!(
            web.settings.allowed_origins,
            vec!["https://a.example.com", "https://b.example.com"]
        );
        assert!(web.settings.disable_authentication);
        assert!(!web.settings.disable_origin_check);
        assert_eq!(web.log_buffer_size, 200);
    }
}
