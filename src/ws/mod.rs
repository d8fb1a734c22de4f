//! WebSocket wire protocol
//!
//! A minimal RFC 6455 server: upgrade handshake, frame codec and a split
//! connection type. Only final text/binary frames plus close, ping and pong
//! are supported; extensions and fragmentation are not.

mod connection;
mod error;
pub mod frame;
pub mod handshake;

pub use connection::*;
pub use error::*;
