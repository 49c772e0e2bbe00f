mod command;
mod config;
mod named_pipe;
mod process;
mod supervisor;
mod termination;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::Args;
use crate::supervisor::Supervisor;

const LOG_TARGETS: [&str; 4] = [
    "mc_server_runner",
    "libmcrunner",
    "mc_runner_ssh",
    "mc_runner_web",
];

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            LOG_TARGETS
                .iter()
                .map(|target| format!("{target}={level}"))
                .collect::<Vec<_>>()
                .join(",")
                .into()
        }))
        .init();

    let code = match Supervisor::from_env(args).run().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            1
        }
    };
    std::process::exit(code);
}
