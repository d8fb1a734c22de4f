//! Terminal Relay Server
//!
//! WebSocket relay for remote terminal access. Runs an interactive CLI in a
//! PTY per connection and streams its output to the client, forwarding the
//! client's keystrokes back as input.

mod config;
mod pty;
mod server;
mod session;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::RelayConfig;
use server::{ServerConfig, WebSocketServer};

/// Terminal Relay Server
///
/// WebSocket relay for an interactive CLI running in a PTY
#[derive(Parser, Debug)]
#[command(name = "term-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8765)]
    port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Token clients must present in their init message
    #[arg(long, env = "TERM_RELAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Program to run in each session (defaults to `claude`)
    #[arg(long)]
    command: Option<String>,

    /// Arguments passed to the program
    #[arg(last = true)]
    args: Vec<String>,
}

impl Args {
    /// Build the relay configuration: file values first, then flags on top
    fn relay_config(&self) -> anyhow::Result<RelayConfig> {
        let mut relay = match &self.config {
            Some(path) => RelayConfig::load(path)?,
            None => RelayConfig::default(),
        };

        if let Some(command) = &self.command {
            relay.command = command.clone();
        }
        if !self.args.is_empty() {
            relay.args = self.args.clone();
        }
        if self.token.is_some() {
            relay.token = self.token.clone();
        }
        Ok(relay)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Terminal Relay v{}", env!("CARGO_PKG_VERSION"));

    let relay = args.relay_config()?;
    info!("Sessions run: {} {}", relay.command, relay.args.join(" "));
    if relay.requires_token() {
        info!("Token authentication enabled");
    }

    // Create and start the WebSocket server
    let config = ServerConfig::new(args.bind, args.port);
    let server = Arc::new(WebSocketServer::new(config, relay));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
