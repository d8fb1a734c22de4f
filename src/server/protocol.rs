//! Protocol message definitions
//!
//! Defines the structured messages exchanged with clients. Inbound JSON objects
//! whose `type` names a control message are handled by the relay, or dropped
//! if malformed; every other inbound text is terminal input. Outbound `ServerMessage`s report session
//! lifecycle changes and answer keepalives.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pty::TerminalSize;

/// Maximum terminal dimensions
pub const MAX_TERMINAL_COLS: u16 = 500;
pub const MAX_TERMINAL_ROWS: u16 = 200;

/// Default terminal dimensions
pub const DEFAULT_TERMINAL_COLS: u16 = 80;
pub const DEFAULT_TERMINAL_ROWS: u16 = 24;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Client Messages
// ============================================================================

/// Values of `type` that mark an inbound text frame as a control message
pub const CONTROL_TYPES: [&str; 4] = ["init", "resize", "restart", "ping"];

/// Control messages sent from client to server
///
/// Dimensions are decoded wider than the PTY accepts so that an oversized
/// value is rejected by `validate` rather than by the decoder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First message on a connection
    Init {
        /// Requested working directory, absolute or relative
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        /// Initial terminal columns
        #[serde(default = "default_cols")]
        cols: u32,
        /// Initial terminal rows
        #[serde(default = "default_rows")]
        rows: u32,
        /// Access token, required when the relay is configured with one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Resize the session's terminal
    Resize {
        /// New terminal width in columns
        cols: u32,
        /// New terminal height in rows
        rows: u32,
    },

    /// Replace the running session with a fresh one
    Restart,

    /// Application-level keepalive
    Ping,
}

fn default_cols() -> u32 {
    DEFAULT_TERMINAL_COLS.into()
}

fn default_rows() -> u32 {
    DEFAULT_TERMINAL_ROWS.into()
}

/// What an inbound text frame turned out to be
#[derive(Debug)]
pub enum Inbound {
    /// A well-formed control message
    Control(ControlMessage),
    /// Tagged with a control `type` but malformed; never terminal input
    Rejected(ProtocolError),
    /// Anything else, to be written to the session
    Input,
}

impl Inbound {
    /// Classify an inbound text frame.
    ///
    /// A JSON object whose `type` names a control message is always a
    /// control message, decoded or rejected. All other text is input.
    pub fn parse(text: &str) -> Self {
        if !text.trim_start().starts_with('{') {
            return Inbound::Input;
        }
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => return Inbound::Input,
        };
        let is_control = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|kind| CONTROL_TYPES.contains(&kind));
        if !is_control {
            return Inbound::Input;
        }

        match serde_json::from_value(value) {
            Ok(message) => Inbound::Control(message),
            Err(e) => Inbound::Rejected(e.into()),
        }
    }
}

impl ControlMessage {
    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ControlMessage::Init { cols, rows, .. } | ControlMessage::Resize { cols, rows } => {
                validate_dimensions(*cols, *rows)
            }
            ControlMessage::Restart | ControlMessage::Ping => Ok(()),
        }
    }

    /// Terminal size carried by `init` or `resize`, once validated
    pub fn size(&self) -> ProtocolResult<Option<TerminalSize>> {
        self.validate()?;
        Ok(match self {
            ControlMessage::Init { cols, rows, .. } | ControlMessage::Resize { cols, rows } => {
                // In range after validation
                Some(TerminalSize::new(*cols as u16, *rows as u16))
            }
            _ => None,
        })
    }
}

#[cfg(test)]
impl ControlMessage {
    /// Create an Init message with default dimensions
    pub fn init(cwd: Option<String>, token: Option<String>) -> Self {
        ControlMessage::Init {
            cwd,
            cols: default_cols(),
            rows: default_rows(),
            token,
        }
    }

    /// Create a Resize message
    pub fn resize(cols: u32, rows: u32) -> Self {
        ControlMessage::Resize { cols, rows }
    }
}

/// Check terminal dimensions against the supported range
fn validate_dimensions(cols: u32, rows: u32) -> ProtocolResult<()> {
    if cols == 0 || cols > u32::from(MAX_TERMINAL_COLS) {
        return Err(ProtocolError::ValidationError(format!(
            "cols must be between 1 and {}",
            MAX_TERMINAL_COLS
        )));
    }
    if rows == 0 || rows > u32::from(MAX_TERMINAL_ROWS) {
        return Err(ProtocolError::ValidationError(format!(
            "rows must be between 1 and {}",
            MAX_TERMINAL_ROWS
        )));
    }
    Ok(())
}

// ============================================================================
// Server Messages
// ============================================================================

/// Session lifecycle states reported to the client
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// A session is being (re)started
    Starting,
    /// The child process has been spawned
    Ready,
    /// The child process exited or its PTY failed
    SessionEnded,
    /// The client's token was missing or wrong
    AuthFailed,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Lifecycle notification
    Status {
        status: SessionStatus,
        /// Human-readable detail
        message: String,
    },

    /// Response to Ping
    Pong,
}

impl ServerMessage {
    /// Create a Status message
    pub fn status(status: SessionStatus, message: impl Into<String>) -> Self {
        ServerMessage::Status {
            status,
            message: message.into(),
        }
    }

    pub fn starting() -> Self {
        Self::status(SessionStatus::Starting, "Starting session...")
    }

    pub fn ready() -> Self {
        Self::status(SessionStatus::Ready, "Session is ready")
    }

    pub fn session_ended(message: impl Into<String>) -> Self {
        Self::status(SessionStatus::SessionEnded, message)
    }

    pub fn auth_failed() -> Self {
        Self::status(SessionStatus::AuthFailed, "Invalid or missing token")
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
