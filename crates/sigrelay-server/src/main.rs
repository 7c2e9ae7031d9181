//! sigrelay-server: signaling relay for call and chat sessions.
//!
//! Accepts WebSocket upgrades on the signaling routes and relays offers,
//! answers, ICE candidates and chat events between participants of a room.

use clap::Parser;
use sigrelay_server::{ConfigOverrides, ServerConfig, SignalingServer};
use std::path::PathBuf;
use tracing::{error, info, warn};

/// sigrelay-server: WebSocket signaling relay
#[derive(Parser, Debug)]
#[command(name = "sigrelay-server", version, about = "WebSocket signaling relay")]
struct Cli {
    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.sigrelay/config.toml")]
    config: String,

    /// Maximum accepted frame payload in bytes
    #[arg(long)]
    max_payload: Option<usize>,

    /// Keepalive ping interval in seconds
    #[arg(long)]
    ping_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let overrides = ConfigOverrides {
        host: cli.host,
        port: cli.port,
        max_payload: cli.max_payload,
        ping_interval_secs: cli.ping_interval,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.host,
        port = config.port,
        "starting sigrelay-server"
    );

    let server = SignalingServer::new(config);
    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
