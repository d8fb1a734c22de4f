//! Upgrade handshake
//!
//! Reads the HTTP upgrade request, derives `Sec-WebSocket-Accept` and builds
//! the `101 Switching Protocols` response. Subprotocols and extensions are
//! never negotiated.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::{WsError, WsResult};

/// Fixed GUID appended to the client key before hashing
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the size of the request line plus headers
pub const MAX_HEADER_BYTES: usize = 16 * 1024;

const END_OF_HEADERS: &[u8] = b"\r\n\r\n";

/// Compute the accept value: base64(SHA-1(key ++ GUID))
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Build the complete `101` response for a given accept value
pub fn switching_protocols_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept
    )
}

/// A parsed upgrade request
#[derive(Debug, Clone, Default)]
pub struct HandshakeRequest {
    /// First line of the request, e.g. `GET / HTTP/1.1`
    pub request_line: String,
    /// Header values keyed by lowercased name
    headers: HashMap<String, String>,
}

impl HandshakeRequest {
    /// Read header lines up to and including the blank line.
    ///
    /// Reading stops exactly at the end of the headers, so any frame bytes the
    /// client pipelined behind them stay buffered in `reader`.
    pub async fn read_from<R>(reader: &mut R) -> WsResult<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut raw = Vec::with_capacity(512);

        loop {
            let remaining = MAX_HEADER_BYTES.saturating_sub(raw.len());
            if remaining == 0 {
                return Err(WsError::HeadersTooLarge(MAX_HEADER_BYTES));
            }

            let n = (&mut *reader)
                .take(remaining as u64)
                .read_until(b'\n', &mut raw)
                .await?;
            if n == 0 {
                return Err(WsError::HandshakeIncomplete);
            }
            if raw.ends_with(END_OF_HEADERS) {
                break;
            }
        }

        Ok(Self::parse(&String::from_utf8_lossy(&raw)))
    }

    /// Parse a raw request head. Lines without a colon are skipped.
    pub fn parse(raw: &str) -> Self {
        let mut lines = raw.split("\r\n");
        let request_line = lines.next().unwrap_or_default().to_string();

        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();

        Self {
            request_line,
            headers,
        }
    }

    /// Look up a header, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The client's `Sec-WebSocket-Key`
    pub fn websocket_key(&self) -> WsResult<&str> {
        self.header("sec-websocket-key")
            .filter(|key| !key.is_empty())
            .ok_or(WsError::MissingKey)
    }
}
