//! ssho-server binary: parse flags, load config, serve until signalled.

use clap::Parser;
use ssho_server::config::{ConfigOverrides, ServerConfig};
use ssho_server::server::SshoServer;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};

/// ssho-server — persistent shared terminal sessions over WebSocket
#[derive(Parser, Debug)]
#[command(name = "ssho-server", version, about = "Persistent shared terminal sessions")]
struct Cli {
    /// Listen address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Shell to spawn for new sessions (default: $SHELL)
    #[arg(long)]
    shell: Option<String>,

    /// History kept per session for replay, in bytes
    #[arg(long)]
    history_limit: Option<usize>,

    /// Config file path
    #[arg(long, default_value = "~/.ssho/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting ssho-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        bind: cli.bind,
        port: cli.port,
        shell: cli.shell,
        history_limit: cli.history_limit,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = SshoServer::new(server_config);

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

    info!("ssho-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
