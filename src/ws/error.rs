//! Wire protocol errors

use thiserror::Error;

/// Errors raised by the handshake and the frame codec.
///
/// Every variant is fatal to the connection; there is no recovery at this layer.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("Stream ended before the handshake completed")]
    HandshakeIncomplete,

    #[error("Handshake request has no Sec-WebSocket-Key header")]
    MissingKey,

    #[error("Handshake headers exceed {0} bytes")]
    HeadersTooLarge(usize),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection closed by peer")]
    ClosedByPeer,

    #[error("Fragmented messages are not supported")]
    FragmentationUnsupported,

    #[error("Unsupported opcode: {0:#x}")]
    UnsupportedOpcode(u8),

    #[error("Payload of {0} bytes exceeds the frame size limit")]
    PayloadTooLarge(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for wire protocol operations
pub type WsResult<T> = Result<T, WsError>;

impl WsError {
    /// Whether the failure came from the peer going away rather than from
    /// something it sent. Callers treat both the same way; this only changes
    /// how loudly the failure is logged.
    pub fn is_disconnect(&self) -> bool {
        match self {
            WsError::ConnectionClosed | WsError::ClosedByPeer | WsError::HandshakeIncomplete => {
                true
            }
            WsError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
