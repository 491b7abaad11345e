//! ttyhub: shares PTY sessions with WebSocket viewers.
//!
//! Runs commands on pseudo-terminals and multiplexes each one to any number
//! of viewers, with acknowledgement-based flow control and detach/reattach
//! that replays what a returning viewer missed.

mod config;
mod hub;
mod launch;
mod server;
mod session;
mod transport;
mod viewer;

use clap::Parser;
use config::{Overrides, PacketMode, ServerConfig};
use server::TtyHubServer;
use std::path::PathBuf;
use tracing::{error, info};

/// ttyhub: terminal session hub
#[derive(Parser, Debug)]
#[command(name = "ttyhub", version, about = "Share PTY sessions with WebSocket viewers")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.ttyhub/config.toml")]
    config: String,

    /// Refuse a viewer while another one is connected
    #[arg(long)]
    once: bool,

    /// Ignore viewer input
    #[arg(long)]
    readonly: bool,

    /// Signal sent to a session's process when it is torn down
    #[arg(long)]
    signal: Option<String>,

    /// Start the command in a detached session without waiting for a viewer
    #[arg(long)]
    detached: bool,

    /// PTY packet mode
    #[arg(long, value_enum)]
    packet_mode: Option<PacketMode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Command to run for new sessions (default: $SHELL)
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let overrides = Overrides {
        port: cli.port,
        bind: cli.bind,
        once: cli.once,
        readonly: cli.readonly,
        signal: cli.signal,
        packet_mode: cli.packet_mode,
        command: cli.command,
        detached: cli.detached,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = server_config.port,
        "starting ttyhub"
    );

    let server = TtyHubServer::new(server_config);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("ttyhub stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            let _ = ctrl_c.await;
        }
    }
}
