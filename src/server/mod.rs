//! WebSocket server module
//!
//! Accepts client connections, decodes control messages and binds each
//! connection to its own terminal session.

mod handler;
mod protocol;
mod websocket;

pub use handler::*;
pub use protocol::*;
pub use websocket::*;
