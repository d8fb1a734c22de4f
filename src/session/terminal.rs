//! Terminal session
//!
//! Runs one child process on a PTY and relays its output as `SessionEvent`s.
//! Handles the full lifecycle: spawn, output relay, liveness, input,
//! resize and two-stage shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pty::filter::{strip_replacement_chars, SyncMarkerFilter, Utf8Decoder};
use crate::pty::{ChildWatch, ProcessExit, PtyError, PtyProcess, PtyReader, TerminalSize};

/// How often the relay checks for a child that exited without closing its PTY
pub const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Time between SIGTERM and SIGKILL when stopping
pub const STOP_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// How long the relay waits for an exit status after the PTY reports EOF
const EXIT_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

const READ_BUFFER_SIZE: usize = 8192;

/// Errors that can occur during terminal session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not running")]
    NotRunning,

    #[error("Session already started")]
    AlreadyStarted,

    #[error("PTY error: {0}")]
    Pty(#[from] PtyError),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Lifecycle of a terminal session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, nothing spawned yet
    Created,
    /// Opening the PTY and spawning the child
    Starting,
    /// Child running, output relay active
    Running,
    /// Child gone or being stopped; descriptor not yet released
    Ending,
    /// Child reaped and descriptor closed
    Terminated,
}

/// Events emitted by a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Terminal output, with synchronized-update markers removed
    Output(String),
    /// The child exited or its PTY failed. Emitted at most once per session,
    /// and never for a session that was stopped explicitly.
    Ended {
        session_id: Uuid,
        message: String,
        exit: Option<ProcessExit>,
    },
}

/// Configuration for spawning a session's child process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Program to run
    pub command: String,
    /// Program arguments
    pub args: Vec<String>,
    /// Resolved working directory
    pub working_dir: PathBuf,
    /// Terminal size at spawn
    pub size: TerminalSize,
    /// Extra environment variables
    pub env: HashMap<String, String>,
}

impl SpawnConfig {
    /// Create a new spawn config with default terminal size
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            size: TerminalSize::default(),
            env: HashMap::new(),
        }
    }

    /// Set program arguments
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set terminal dimensions
    pub fn with_size(mut self, size: TerminalSize) -> Self {
        self.size = size;
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// A single child process attached to a PTY
pub struct TerminalSession {
    /// Unique identifier, used in logs and `Ended` events
    id: Uuid,
    config: SpawnConfig,
    state: Arc<RwLock<SessionState>>,
    process: Option<PtyProcess>,
    /// Output relay task
    relay: Option<JoinHandle<()>>,
    events: mpsc::Sender<SessionEvent>,
}

impl TerminalSession {
    /// Create a new session (not yet spawned) that reports to `events`
    pub fn new(config: SpawnConfig, events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            state: Arc::new(RwLock::new(SessionState::Created)),
            process: None,
            relay: None,
            events,
        }
    }

    /// Get the session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the current state
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// OS process id of the child, once spawned
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(PtyProcess::pid)
    }

    /// Spawn the child and start relaying its output
    pub async fn start(&mut self) -> SessionResult<()> {
        {
            let mut state = self.state.write().await;
            if *state != SessionState::Created {
                return Err(SessionError::AlreadyStarted);
            }
            *state = SessionState::Starting;
        }

        let spawned = PtyProcess::spawn(
            &self.config.command,
            &self.config.args,
            &self.config.working_dir,
            Some(&self.config.env),
            self.config.size,
        )
        .and_then(|process| process.reader().map(|reader| (process, reader)));

        let (process, reader) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                *self.state.write().await = SessionState::Terminated;
                return Err(e.into());
            }
        };

        info!(
            "Session {} started {} (pid {:?}) in {}",
            self.id,
            self.config.command,
            process.pid(),
            self.config.working_dir.display()
        );

        let watch = process.watch();
        self.process = Some(process);
        *self.state.write().await = SessionState::Running;

        self.relay = Some(tokio::spawn(relay_output(
            self.id,
            reader,
            watch,
            self.events.clone(),
            Arc::clone(&self.state),
        )));

        Ok(())
    }

    /// Write client input to the child.
    ///
    /// U+FFFD is removed first; if nothing is left the write is skipped.
    pub async fn write(&self, input: &str) -> SessionResult<()> {
        let process = self.process.as_ref().ok_or(SessionError::NotRunning)?;

        let filtered = strip_replacement_chars(input);
        if filtered.is_empty() {
            return Ok(());
        }
        process.write(filtered.as_bytes()).await?;
        Ok(())
    }

    /// Resize the terminal. Before `start` this only sets the spawn size.
    pub fn resize(&mut self, size: TerminalSize) -> SessionResult<()> {
        self.config.size = size;
        if let Some(process) = &self.process {
            process.resize(size)?;
            debug!("Session {} resized to {}x{}", self.id, size.cols, size.rows);
        }
        Ok(())
    }

    /// Current window size, read back from the PTY while it is open
    pub fn size(&self) -> TerminalSize {
        self.process
            .as_ref()
            .and_then(|process| process.size().ok())
            .unwrap_or(self.config.size)
    }

    /// Check if the child is still running
    pub async fn is_alive(&self) -> bool {
        match &self.process {
            Some(process) => process.watch().is_alive().await,
            None => false,
        }
    }

    /// Stop the session: cancel the relay, terminate the child and close the
    /// PTY. Safe to call in any state, any number of times.
    pub async fn stop(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.abort();
            let _ = relay.await;
        }

        if let Some(mut process) = self.process.take() {
            *self.state.write().await = SessionState::Ending;
            let exit = process.terminate(STOP_GRACE_PERIOD).await;
            process.close();
            debug!("Session {} stopped: {:?}", self.id, exit);
        }

        *self.state.write().await = SessionState::Terminated;
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        // `stop` is the orderly path; this only keeps an abandoned relay from
        // outliving the session.
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
    }
}

/// Relay PTY output to `events` until the child goes away.
///
/// Reads are readiness-driven. The liveness tick catches a child that exits
/// while something else still holds the PTY open, bounding detection to one
/// poll interval.
async fn relay_output(
    session_id: Uuid,
    reader: PtyReader,
    watch: ChildWatch,
    events: mpsc::Sender<SessionEvent>,
    state: Arc<RwLock<SessionState>>,
) {
    let mut markers = SyncMarkerFilter::new();
    let mut decoder = Utf8Decoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut liveness = tokio::time::interval(LIVENESS_POLL_INTERVAL);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Bytes arrived since the previous tick
    let mut fresh = false;

    let failure = loop {
        tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => break None,
                Ok(n) => {
                    fresh = true;
                    let text = decoder.decode(&markers.filter(&buf[..n]));
                    if !send_output(&events, text).await {
                        return;
                    }
                }
                Err(e) => break Some(format!("Connection lost: {}", e)),
            },
            _ = liveness.tick() => {
                if !watch.is_alive().await {
                    break None;
                }
                // A held partial marker is plain output once the child goes quiet
                if !std::mem::take(&mut fresh) && markers.has_pending() {
                    let text = decoder.decode(&markers.flush());
                    if !send_output(&events, text).await {
                        return;
                    }
                }
            }
        }
    };

    *state.write().await = SessionState::Ending;

    // Whatever the child wrote before exiting may still be buffered
    while let Ok(Some(n)) = reader.try_read(&mut buf) {
        if n == 0 {
            break;
        }
        let text = decoder.decode(&markers.filter(&buf[..n]));
        if !send_output(&events, text).await {
            return;
        }
    }
    let tail = decoder.decode(&markers.flush()) + &decoder.flush();
    if !send_output(&events, tail).await {
        return;
    }

    let exit = watch.wait_for_exit(EXIT_SETTLE_TIMEOUT).await;
    let message = match (&failure, exit.and_then(|e| e.exit_code)) {
        (Some(failure), _) => failure.clone(),
        (None, Some(code)) => format!("Session ended (exit code {})", code),
        (None, None) => "Session ended".to_string(),
    };

    match &failure {
        Some(reason) => warn!("Session {} output failed: {}", session_id, reason),
        None => info!("Session {} ended: {:?}", session_id, exit),
    }

    let _ = events
        .send(SessionEvent::Ended {
            session_id,
            message,
            exit,
        })
        .await;
}

/// Returns false once nobody is listening
async fn send_output(events: &mpsc::Sender<SessionEvent>, text: String) -> bool {
    if text.is_empty() {
        return true;
    }
    events.send(SessionEvent::Output(text)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::{timeout_at, Instant};

    fn sh(script: &str) -> SpawnConfig {
        SpawnConfig::new("sh", "/tmp").with_args(vec!["-c".to_string(), script.to_string()])
    }

    fn session(config: SpawnConfig) -> (TerminalSession, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(1024);
        (TerminalSession::new(config, tx), rx)
    }

    /// Accumulate output until `needle` appears or a few seconds pass
    async fn output_until(rx: &mut mpsc::Receiver<SessionEvent>, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut seen = String::new();
        while !seen.contains(needle) {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(SessionEvent::Output(text))) => seen.push_str(&text),
                Ok(Some(SessionEvent::Ended { .. })) => {}
                Ok(None) | Err(_) => break,
            }
        }
        seen
    }

    /// Wait for the `Ended` event, discarding output
    async fn ended(rx: &mut mpsc::Receiver<SessionEvent>, limit: Duration) -> Option<String> {
        let deadline = Instant::now() + limit;
        loop {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(SessionEvent::Ended { message, .. })) => return Some(message),
                Ok(Some(SessionEvent::Output(_))) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    #[test]
    fn test_spawn_config_builder() {
        let config = SpawnConfig::new("claude", "/work")
            .with_args(vec!["--flag".to_string()])
            .with_size(TerminalSize::new(120, 40))
            .with_env("TERM", "xterm-256color");
        assert_eq!(config.command, "claude");
        assert_eq!(config.args, vec!["--flag"]);
        assert_eq!(config.working_dir, PathBuf::from("/work"));
        assert_eq!(config.size, TerminalSize::new(120, 40));
        assert_eq!(config.env.get("TERM").map(String::as_str), Some("xterm-256color"));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (session, _rx) = session(SpawnConfig::new("cat", "/tmp"));
        assert_eq!(session.state().await, SessionState::Created);
        assert_eq!(session.size(), TerminalSize::default());
        assert!(!session.is_alive().await);
        assert!(session.pid().is_none());
    }

    #[tokio::test]
    async fn test_write_before_start() {
        let (session, _rx) = session(SpawnConfig::new("cat", "/tmp"));
        assert!(matches!(
            session.write("x").await,
            Err(SessionError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_input_echoed_as_output() {
        let (mut session, mut rx) = session(SpawnConfig::new("cat", "/tmp"));
        session.start().await.unwrap();
        assert_eq!(session.state().await, SessionState::Running);
        assert!(session.is_alive().await);

        session.write("echo hi\n").await.unwrap();
        assert!(output_until(&mut rx, "echo hi").await.contains("echo hi"));

        session.stop().await;
    }

    #[tokio::test]
    async fn test_replacement_chars_filtered_from_input() {
        let (mut session, mut rx) = session(SpawnConfig::new("cat", "/tmp"));
        session.start().await.unwrap();

        session.write("\u{FFFD}").await.unwrap();
        session.write("a\u{FFFD}b\n").await.unwrap();
        let output = output_until(&mut rx, "ab").await;
        assert!(output.contains("ab"));
        assert!(!output.contains('\u{FFFD}'));

        session.stop().await;
    }

    #[tokio::test]
    async fn test_sync_markers_stripped_from_output() {
        let (mut session, mut rx) =
            session(sh(r"printf '\033[?2026hinside\033[?2026l'; sleep 0.2"));
        session.start().await.unwrap();

        let output = output_until(&mut rx, "inside").await;
        assert!(output.contains("inside"));
        assert!(!output.contains("\x1b[?2026"));

        session.stop().await;
    }

    #[tokio::test]
    async fn test_exit_emits_single_ended_event() {
        let (mut session, mut rx) = session(sh("sleep 0.2"));
        session.start().await.unwrap();

        let message = ended(&mut rx, Duration::from_secs(3)).await;
        assert!(message.is_some());
        assert!(!session.is_alive().await);
        assert_eq!(session.state().await, SessionState::Ending);

        // Nothing further once the session has ended
        assert_eq!(ended(&mut rx, Duration::from_secs(1)).await, None);

        session.stop().await;
        assert_eq!(session.state().await, SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_trailing_escape_released_when_quiet() {
        let (mut session, mut rx) = session(sh(r"printf 'ready\033'; sleep 5"));
        session.start().await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(2500);
        let mut seen = String::new();
        while !seen.contains("ready\x1b") {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(SessionEvent::Output(text))) => seen.push_str(&text),
                other => panic!("no trailing escape in {:?}, got {:?}", seen, other),
            }
        }

        session.stop().await;
    }

    #[tokio::test]
    async fn test_exit_detected_while_pty_held_open() {
        // The background sleep keeps the terminal open after the shell exits
        let (mut session, mut rx) = session(sh("trap '' HUP; sleep 5 & exit 0"));
        session.start().await.unwrap();

        let message = ended(&mut rx, Duration::from_millis(1500)).await;
        assert_eq!(message.as_deref(), Some("Session ended (exit code 0)"));

        session.stop().await;
    }

    #[tokio::test]
    async fn test_exit_code_in_ended_message() {
        let (mut session, mut rx) = session(sh("exit 7"));
        session.start().await.unwrap();

        let message = ended(&mut rx, Duration::from_secs(3)).await.unwrap();
        assert!(message.contains('7'), "message {:?}", message);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_resize_before_and_during_run() {
        let (mut session, mut rx) = session(sh("stty size; read line; stty size; sleep 1"));
        session.resize(TerminalSize::new(100, 30)).unwrap();
        session.start().await.unwrap();

        assert!(output_until(&mut rx, "30 100").await.contains("30 100"));
        assert_eq!(session.size(), TerminalSize::new(100, 30));

        session.resize(TerminalSize::new(120, 40)).unwrap();
        assert_eq!(session.size(), TerminalSize::new(120, 40));
        session.write("\n").await.unwrap();
        assert!(output_until(&mut rx, "40 120").await.contains("40 120"));

        session.stop().await;
    }

    #[tokio::test]
    async fn test_environment_and_working_dir() {
        let dir = TempDir::new().unwrap();
        let config = SpawnConfig::new("sh", dir.path())
            .with_args(vec!["-c".to_string(), "echo \"$TERM\"; pwd".to_string()])
            .with_env("TERM", "xterm-256color");
        let (mut session, mut rx) = session(config);
        session.start().await.unwrap();

        let expected_dir = dir.path().display().to_string();
        let output = output_until(&mut rx, &expected_dir).await;
        assert!(output.contains("xterm-256color"));
        assert!(output.contains(&expected_dir));

        session.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_silent() {
        let (mut session, mut rx) = session(SpawnConfig::new("cat", "/tmp"));
        session.start().await.unwrap();
        let pid = session.pid().unwrap();

        session.stop().await;
        session.stop().await;
        assert_eq!(session.state().await, SessionState::Terminated);
        assert!(!session.is_alive().await);
        assert!(matches!(
            session.write("x").await,
            Err(SessionError::NotRunning)
        ));

        // An explicit stop never reports `Ended`
        assert_eq!(ended(&mut rx, Duration::from_millis(800)).await, None);

        // The child is gone
        assert_ne!(unsafe { libc::kill(pid as libc::pid_t, 0) }, 0);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let (mut session, _rx) = session(SpawnConfig::new("cat", "/tmp"));
        session.stop().await;
        assert_eq!(session.state().await, SessionState::Terminated);
        assert!(matches!(
            session.start().await,
            Err(SessionError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (mut session, _rx) = session(SpawnConfig::new("cat", "/tmp"));
        session.start().await.unwrap();
        assert!(matches!(
            session.start().await,
            Err(SessionError::AlreadyStarted)
        ));
        session.stop().await;
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (mut session, _rx) = session(SpawnConfig::new("no-such-program-81b2", "/tmp"));
        let result = session.start().await;
        assert!(matches!(result, Err(SessionError::Pty(PtyError::SpawnFailed(_)))));
        assert_eq!(session.state().await, SessionState::Terminated);
    }
}
