//! WebSocket server implementation
//!
//! Listens on a configurable address, upgrades each accepted connection and
//! hands it to its own `ConnectionHandler`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::handler::ConnectionHandler;
use crate::config::RelayConfig;
use crate::ws::WsConnection;

/// Time allowed for the upgrade handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long shutdown waits for open connections to tear down their sessions
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self { bind, port }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket server relaying terminal sessions
pub struct WebSocketServer {
    config: ServerConfig,
    relay: Arc<RelayConfig>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig, relay: RelayConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            relay: Arc::new(relay),
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    ///
    /// Each connection runs on its own task. On shutdown every handler stops
    /// its session and closes its connection before this returns.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!("WebSocket relay listening on ws://{}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let relay = Arc::clone(&self.relay);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, relay, shutdown_rx).await {
                                    warn!("Connection error from {}: {:#}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished connections
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        // Wait for active connections to finish
        if !connections.is_empty() {
            info!("Waiting for {} active connections to close...", connections.len());
            let drained = timeout(DRAIN_TIMEOUT, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Connections still open after {:?}, aborting", DRAIN_TIMEOUT);
                connections.shutdown().await;
            }
        }

        Ok(())
    }
}

/// Upgrade a single connection and run its handler
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    relay: Arc<RelayConfig>,
    shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", peer_addr, e);
    }

    let connection = timeout(
        HANDSHAKE_TIMEOUT,
        WsConnection::accept(stream, peer_addr.to_string()),
    )
    .await
    .context("Handshake timed out")?
    .context("Handshake failed")?;

    ConnectionHandler::new(connection, relay, shutdown_rx)
        .run()
        .await;
    Ok(())
}
