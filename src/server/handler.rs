//! WebSocket connection handler
//!
//! Binds one terminal session to one upgraded connection. Inbound text is
//! either a control message, handled here, or input for the session. Session
//! output and lifecycle events flow back through a forwarder task that shares
//! the connection's sender.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::protocol::{ControlMessage, Inbound, ServerMessage};
use crate::config::RelayConfig;
use crate::pty::TerminalSize;
use crate::session::{SessionEvent, SpawnConfig, TerminalSession};
use crate::ws::{WsConnection, WsReceiver, WsResult, WsSender};

/// How long a new connection has to send `init`
pub const INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Quiet period after which the peer is pinged
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a stopped session's forwarder may take to finish its last frame
const FORWARDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffered inbound messages between the reader task and the main loop
const INBOUND_CAPACITY: usize = 64;

/// Buffered session events awaiting the forwarder
const SESSION_EVENT_CAPACITY: usize = 256;

/// Outcome of the startup exchange
enum Startup {
    /// Start a session, then write any raw input that arrived in place of `init`
    Begin { pending_input: Option<String> },
    /// Close without starting a session
    Close,
}

/// Task relaying one session's events to the client.
///
/// It is stopped by raising `discard` and letting it run out, never by
/// aborting it in the middle of a frame.
struct Forwarder {
    task: JoinHandle<()>,
    discard: Arc<AtomicBool>,
}

/// Handles a single WebSocket connection
pub struct ConnectionHandler {
    config: Arc<RelayConfig>,
    sender: WsSender,
    /// Messages from the reader task, in arrival order
    inbound: mpsc::Receiver<WsResult<String>>,
    reader: JoinHandle<()>,
    shutdown_rx: broadcast::Receiver<()>,
    session: Option<TerminalSession>,
    forwarder: Option<Forwarder>,
    working_dir: PathBuf,
    /// Last accepted terminal size, reused by `restart`
    size: TerminalSize,
}

impl ConnectionHandler {
    /// Create a handler for an upgraded connection and start reading from it
    pub fn new(
        connection: WsConnection,
        config: Arc<RelayConfig>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (receiver, sender) = connection.split();
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let reader = tokio::spawn(read_inbound(receiver, inbound_tx));

        Self {
            working_dir: config.resolve_workdir(None),
            config,
            sender,
            inbound,
            reader,
            shutdown_rx,
            session: None,
            forwarder: None,
            size: TerminalSize::default(),
        }
    }

    /// Drive the connection until the peer leaves, the server shuts down, or
    /// the wire fails. Tears everything down before returning.
    pub async fn run(mut self) {
        let peer = self.sender.peer().to_string();
        debug!("Handling connection from {}", peer);

        if let Err(e) = self.serve().await {
            warn!("Connection from {} failed: {}", peer, e);
        }

        self.cleanup().await;
        info!("Connection from {} closed", peer);
    }

    async fn serve(&mut self) -> WsResult<()> {
        let pending_input = match self.startup().await? {
            Startup::Begin { pending_input } => pending_input,
            Startup::Close => return Ok(()),
        };

        self.start_session().await?;
        if let Some(input) = pending_input {
            self.write_input(&input).await;
        }

        let mut idle = interval_at(Instant::now() + IDLE_TIMEOUT, IDLE_TIMEOUT);
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = self.inbound.recv() => match message {
                    Some(Ok(text)) => {
                        idle.reset();
                        self.route(&text).await?;
                    }
                    Some(Err(e)) if e.is_disconnect() => {
                        debug!("Peer {} disconnected: {}", self.sender.peer(), e);
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection to {}", self.sender.peer());
                    return Ok(());
                }
                _ = idle.tick() => {
                    debug!("Connection from {} idle, sending ping", self.sender.peer());
                    self.sender.ping().await?;
                }
            }
        }
    }

    /// Wait for `init` and check the token
    async fn startup(&mut self) -> WsResult<Startup> {
        let first = tokio::select! {
            result = timeout(INIT_TIMEOUT, self.inbound.recv()) => match result {
                Ok(Some(Ok(text))) => Some(text),
                Ok(Some(Err(e))) if e.is_disconnect() => return Ok(Startup::Close),
                Ok(Some(Err(e))) => return Err(e),
                Ok(None) => return Ok(Startup::Close),
                Err(_) => None,
            },
            _ = self.shutdown_rx.recv() => return Ok(Startup::Close),
        };

        let mut token = None;
        let mut pending_input = None;
        match first {
            Some(text) => match Inbound::parse(&text) {
                Inbound::Control(init @ ControlMessage::Init { .. }) => {
                    match init.size() {
                        Ok(Some(size)) => self.size = size,
                        Ok(None) => {}
                        Err(e) => warn!("Ignoring init size from {}: {}", self.sender.peer(), e),
                    }
                    if let ControlMessage::Init {
                        cwd,
                        token: provided,
                        ..
                    } = init
                    {
                        self.working_dir = self.config.resolve_workdir(cwd.as_deref());
                        token = provided;
                    }
                }
                Inbound::Control(other) => {
                    debug!("Expected init from {}, got {:?}", self.sender.peer(), other);
                }
                Inbound::Rejected(e) => {
                    warn!("Dropping malformed control message from {}: {}", self.sender.peer(), e);
                }
                Inbound::Input => pending_input = Some(text),
            },
            None => debug!(
                "No init from {} within {:?}, using defaults",
                self.sender.peer(),
                INIT_TIMEOUT
            ),
        }

        if !self.config.verify_token(token.as_deref()) {
            warn!("Authentication failed for {}", self.sender.peer());
            self.send(&ServerMessage::auth_failed()).await?;
            return Ok(Startup::Close);
        }

        Ok(Startup::Begin { pending_input })
    }

    /// Replace any running session with a fresh one
    async fn start_session(&mut self) -> WsResult<()> {
        self.send(&ServerMessage::starting()).await?;
        self.stop_session().await;

        let spawn = SpawnConfig::new(self.config.command.clone(), self.working_dir.clone())
            .with_args(self.config.args.clone())
            .with_size(self.size)
            .with_env("TERM", self.config.term.clone());
        let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_CAPACITY);
        let mut session = TerminalSession::new(spawn, events_tx);

        match session.start().await {
            Ok(()) => {
                info!(
                    "Session {} ready for {} (pid {:?}, {}x{})",
                    session.id(),
                    self.sender.peer(),
                    session.pid(),
                    self.size.cols,
                    self.size.rows
                );
                self.session = Some(session);
                self.send(&ServerMessage::ready()).await?;

                let discard = Arc::new(AtomicBool::new(false));
                let task = tokio::spawn(forward_events(
                    events_rx,
                    self.sender.clone(),
                    Arc::clone(&discard),
                ));
                self.forwarder = Some(Forwarder { task, discard });
                Ok(())
            }
            Err(e) => {
                error!("Failed to start session for {}: {}", self.sender.peer(), e);
                self.send(&ServerMessage::session_ended(format!(
                    "Failed to start session: {}",
                    e
                )))
                .await
            }
        }
    }

    /// Stop the session and wait for its forwarder to finish the frame it is
    /// writing. Output still queued is dropped.
    async fn stop_session(&mut self) {
        if let Some(forwarder) = &self.forwarder {
            forwarder.discard.store(true, Ordering::SeqCst);
        }

        if let Some(mut session) = self.session.take() {
            debug!("Stopping session {} ({:?})", session.id(), session.state().await);
            session.stop().await;
        }

        // The session and its relay are gone, so the event channel closes
        if let Some(mut forwarder) = self.forwarder.take() {
            if timeout(FORWARDER_DRAIN_TIMEOUT, &mut forwarder.task).await.is_err() {
                warn!(
                    "Forwarder for {} stuck for {:?}, aborting",
                    self.sender.peer(),
                    FORWARDER_DRAIN_TIMEOUT
                );
                forwarder.task.abort();
            }
        }
    }

    /// Act on one inbound text message
    async fn route(&mut self, text: &str) -> WsResult<()> {
        match Inbound::parse(text) {
            Inbound::Control(message) => self.handle_control(message).await?,
            Inbound::Rejected(e) => {
                warn!("Dropping malformed control message from {}: {}", self.sender.peer(), e);
            }
            Inbound::Input => self.write_input(text).await,
        }
        Ok(())
    }

    async fn handle_control(&mut self, message: ControlMessage) -> WsResult<()> {
        match message {
            ControlMessage::Resize { .. } => self.resize(&message),
            ControlMessage::Restart => {
                let running = match &self.session {
                    Some(session) => session.is_alive().await,
                    None => false,
                };
                info!(
                    "Restart requested by {} (session running: {})",
                    self.sender.peer(),
                    running
                );
                self.start_session().await?;
            }
            ControlMessage::Ping => self.send(&ServerMessage::Pong).await?,
            ControlMessage::Init { .. } => {
                debug!("Ignoring repeated init from {}", self.sender.peer());
            }
        }
        Ok(())
    }

    fn resize(&mut self, message: &ControlMessage) {
        let size = match message.size() {
            Ok(Some(size)) => size,
            Ok(None) => return,
            Err(e) => {
                warn!("Dropping resize from {}: {}", self.sender.peer(), e);
                return;
            }
        };

        self.size = size;
        if let Some(session) = &mut self.session {
            match session.resize(size) {
                Ok(()) => {
                    let applied = session.size();
                    debug!(
                        "Session {} resized to {}x{}",
                        session.id(),
                        applied.cols,
                        applied.rows
                    );
                }
                Err(e) => warn!("Session {} resize failed: {}", session.id(), e),
            }
        }
    }

    async fn write_input(&self, text: &str) {
        match &self.session {
            Some(session) => {
                if let Err(e) = session.write(text).await {
                    warn!("Session {} dropped input: {}", session.id(), e);
                }
            }
            None => debug!("No session for {}, dropping input", self.sender.peer()),
        }
    }

    async fn send(&self, message: &ServerMessage) -> WsResult<()> {
        send_message(&self.sender, message).await
    }

    async fn cleanup(&mut self) {
        self.stop_session().await;
        self.reader.abort();
        self.sender.close().await;
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.task.abort();
        }
    }
}

/// Pump frames from the receiver into the handler's queue. Stops after the
/// first error, which is forwarded too.
async fn read_inbound(mut receiver: WsReceiver, inbound: mpsc::Sender<WsResult<String>>) {
    loop {
        let result = receiver.recv().await;
        let failed = result.is_err();
        if inbound.send(result).await.is_err() || failed {
            break;
        }
    }
}

/// Relay one session's events to the client until the session is gone.
/// Once `discard` is raised, remaining events are dropped unsent.
async fn forward_events(
    mut events: mpsc::Receiver<SessionEvent>,
    sender: WsSender,
    discard: Arc<AtomicBool>,
) {
    while let Some(event) = events.recv().await {
        if discard.load(Ordering::SeqCst) {
            continue;
        }
        let result = match event {
            SessionEvent::Output(text) => sender.send_text(&text).await,
            SessionEvent::Ended {
                session_id,
                message,
                exit,
            } => {
                info!(
                    "Session {} for {} ended ({:?})",
                    session_id,
                    sender.peer(),
                    exit.map(|exit| exit.reason)
                );
                send_message(&sender, &ServerMessage::session_ended(message)).await
            }
        };
        if let Err(e) = result {
            debug!("Stopped forwarding to {}: {}", sender.peer(), e);
            break;
        }
    }
}

async fn send_message(sender: &WsSender, message: &ServerMessage) -> WsResult<()> {
    match message.to_json() {
        Ok(json) => sender.send_text(&json).await,
        Err(e) => {
            error!("Failed to encode {:?}: {}", message, e);
            Ok(())
        }
    }
}
