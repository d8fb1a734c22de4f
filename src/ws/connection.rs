//! WebSocket connection
//!
//! Wraps a byte-stream transport after a successful upgrade handshake and
//! exposes message-level receive and send. The connection splits into a
//! `WsReceiver`, owned by whoever drives the inbound loop, and a cloneable
//! `WsSender`. Every clone of the sender writes through the same mutex, so
//! frames from concurrent tasks never interleave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::debug;

use super::frame::{Frame, Opcode};
use super::handshake::{accept_key, switching_protocols_response, HandshakeRequest};
use super::{WsError, WsResult};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An upgraded connection
pub struct WsConnection {
    receiver: WsReceiver,
    sender: WsSender,
}

impl WsConnection {
    /// Perform the server side of the upgrade handshake on `stream`.
    ///
    /// If the request carries no `Sec-WebSocket-Key` the transport is shut down
    /// without writing any response.
    pub async fn accept<S>(stream: S, peer: impl Into<String>) -> WsResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer: Arc<str> = Arc::from(peer.into());
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(Box::new(read_half) as BoxedReader);

        let request = HandshakeRequest::read_from(&mut reader).await?;
        let key = match request.websocket_key() {
            Ok(key) => key,
            Err(e) => {
                let _ = write_half.shutdown().await;
                return Err(e);
            }
        };

        let response = switching_protocols_response(&accept_key(key));
        write_half.write_all(response.as_bytes()).await?;
        write_half.flush().await?;
        debug!("Upgraded connection from {} ({})", peer, request.request_line);

        let sender = WsSender {
            writer: Arc::new(Mutex::new(Some(Box::new(write_half)))),
            open: Arc::new(AtomicBool::new(true)),
            peer,
        };
        let receiver = WsReceiver {
            reader,
            sender: sender.clone(),
            failed: false,
        };

        Ok(Self { receiver, sender })
    }

    /// Split into the inbound half and a shareable outbound half
    pub fn split(self) -> (WsReceiver, WsSender) {
        (self.receiver, self.sender)
    }
}

/// Inbound half of a connection
pub struct WsReceiver {
    reader: BufReader<BoxedReader>,
    sender: WsSender,
    failed: bool,
}

impl WsReceiver {
    /// Receive the next data message.
    ///
    /// Control frames are consumed here: a ping is answered with a pong that
    /// echoes its payload, a pong is dropped, and a close marks the connection
    /// closed and fails with `ClosedByPeer`. Text and binary payloads are
    /// decoded as UTF-8, lossily.
    pub async fn recv(&mut self) -> WsResult<String> {
        if self.failed || !self.sender.is_open() {
            return Err(WsError::ConnectionClosed);
        }

        loop {
            let frame = match Frame::read_from(&mut self.reader).await {
                Ok(frame) => frame,
                Err(e) => {
                    self.failed = true;
                    if e.is_disconnect() {
                        self.sender.mark_closed();
                    }
                    return Err(e);
                }
            };

            match frame.opcode {
                Opcode::Text | Opcode::Binary => {
                    return Ok(String::from_utf8_lossy(&frame.payload).into_owned());
                }
                Opcode::Ping => {
                    self.sender.send_frame(Frame::pong(frame.payload)).await?;
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    self.failed = true;
                    self.sender.mark_closed();
                    return Err(WsError::ClosedByPeer);
                }
                Opcode::Continuation => {
                    self.failed = true;
                    return Err(WsError::FragmentationUnsupported);
                }
            }
        }
    }

}

/// Outbound half of a connection
#[derive(Clone)]
pub struct WsSender {
    /// `None` once the transport has been shut down
    writer: Arc<Mutex<Option<BoxedWriter>>>,
    open: Arc<AtomicBool>,
    peer: Arc<str>,
}

impl WsSender {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether frames can still be sent
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Send a text message. A no-op once the connection is closed.
    pub async fn send_text(&self, text: &str) -> WsResult<()> {
        self.send_frame(Frame::text(text)).await
    }

    /// Send a protocol-level ping
    pub async fn ping(&self) -> WsResult<()> {
        self.send_frame(Frame::ping(Vec::new())).await
    }

    /// Write one whole frame while holding the writer lock.
    ///
    /// If this future is dropped partway through a frame, the connection is
    /// marked closed: the peer has a truncated frame and nothing written after
    /// it could be parsed.
    pub(crate) async fn send_frame(&self, frame: Frame) -> WsResult<()> {
        let mut guard = self.writer.lock().await;
        if !self.is_open() {
            return Ok(());
        }
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };

        let bytes = frame.encode();
        let in_flight = InFlightFrame { open: &self.open };
        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        in_flight.finish();

        if let Err(e) = result {
            self.open.store(false, Ordering::SeqCst);
            *guard = None;
            return Err(WsError::Io(e));
        }
        Ok(())
    }

    /// Send an empty close frame, if the connection is still open, and shut
    /// down the transport. Safe to call more than once.
    pub async fn close(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            if self.open.swap(false, Ordering::SeqCst) {
                let _ = writer.write_all(&Frame::close().encode()).await;
                let _ = writer.flush().await;
            }
            let _ = writer.shutdown().await;
            debug!("Closed connection to {}", self.peer);
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Closes the connection if dropped before `finish`
struct InFlightFrame<'a> {
    open: &'a AtomicBool,
}

impl InFlightFrame<'_> {
    fn finish(self) {
        std::mem::forget(self);
    }
}

impl Drop for InFlightFrame<'_> {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    const CLIENT_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    fn upgrade_request(key: Option<&str>) -> String {
        let mut request = String::from("GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n");
        if let Some(key) = key {
            request.push_str(&format!("Sec-WebSocket-Key: {}\r\n", key));
        }
        request.push_str("\r\n");
        request
    }

    async fn connect_pair() -> (WsConnection, DuplexStream) {
        connect_pair_with_capacity(1 << 20).await
    }

    async fn connect_pair_with_capacity(capacity: usize) -> (WsConnection, DuplexStream) {
        let (mut client, server) = tokio::io::duplex(capacity);
        client
            .write_all(upgrade_request(Some(CLIENT_KEY)).as_bytes())
            .await
            .unwrap();

        let conn = WsConnection::accept(server, "test-peer").await.unwrap();

        let expected = switching_protocols_response(&accept_key(CLIENT_KEY));
        let mut response = vec![0u8; expected.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(String::from_utf8(response).unwrap(), expected);

        (conn, client)
    }

    async fn send_client_frame(client: &mut DuplexStream, frame: Frame) {
        client.write_all(&frame.with_mask(MASK).encode()).await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_and_receive_text() {
        let (conn, mut client) = connect_pair().await;
        let (mut receiver, sender) = conn.split();
        assert_eq!(sender.peer(), "test-peer");

        send_client_frame(&mut client, Frame::text("hello relay")).await;
        assert_eq!(receiver.recv().await.unwrap(), "hello relay");
    }

    #[tokio::test]
    async fn test_accept_without_key_sends_nothing() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(upgrade_request(None).as_bytes())
            .await
            .unwrap();

        let result = WsConnection::accept(server, "test-peer").await;
        assert!(matches!(result, Err(WsError::MissingKey)));

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (conn, mut client) = connect_pair().await;
        let (mut receiver, _sender) = conn.split();

        send_client_frame(&mut client, Frame::ping(b"abc".to_vec())).await;
        send_client_frame(&mut client, Frame::pong(b"ignored".to_vec())).await;
        send_client_frame(&mut client, Frame::text("after ping")).await;

        assert_eq!(receiver.recv().await.unwrap(), "after ping");

        let pong = Frame::read_from(&mut client).await.unwrap();
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(pong.mask, None);
        assert_eq!(pong.payload, b"abc");
    }

    #[tokio::test]
    async fn test_invalid_utf8_decoded_lossily() {
        let (conn, mut client) = connect_pair().await;
        let (mut receiver, _sender) = conn.split();

        send_client_frame(&mut client, Frame::new(Opcode::Text, vec![b'a', 0xff, b'b'])).await;
        assert_eq!(receiver.recv().await.unwrap(), "a\u{FFFD}b");
    }

    #[tokio::test]
    async fn test_peer_close_fails_receive_and_silences_sender() {
        let (conn, mut client) = connect_pair().await;
        let (mut receiver, sender) = conn.split();

        send_client_frame(&mut client, Frame::close()).await;
        assert!(matches!(receiver.recv().await, Err(WsError::ClosedByPeer)));
        assert!(matches!(receiver.recv().await, Err(WsError::ConnectionClosed)));
        assert!(!sender.is_open());

        // No-op once closed
        sender.send_text("dropped").await.unwrap();
        sender.close().await;

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_stream_end_is_closed_connection() {
        let (conn, client) = connect_pair().await;
        let (mut receiver, sender) = conn.split();

        drop(client);
        let err = receiver.recv().await.unwrap_err();
        assert!(err.is_disconnect());
        assert!(!sender.is_open());
    }

    #[tokio::test]
    async fn test_send_then_close() {
        let (conn, mut client) = connect_pair().await;
        let (_receiver, sender) = conn.split();

        sender.send_text("output").await.unwrap();
        sender.close().await;
        sender.close().await;
        sender.send_text("after close").await.unwrap();

        let text = Frame::read_from(&mut client).await.unwrap();
        assert_eq!(text.opcode, Opcode::Text);
        assert_eq!(text.mask, None);
        assert_eq!(text.payload, b"output");

        let close = Frame::read_from(&mut client).await.unwrap();
        assert_eq!(close.opcode, Opcode::Close);
        assert!(close.payload.is_empty());

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_senders_do_not_interleave() {
        let (conn, mut client) = connect_pair().await;
        let (_receiver, sender) = conn.split();

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let sender = sender.clone();
            tasks.push(tokio::spawn(async move {
                let body = String::from_utf8(vec![b'a' + i; 70_000]).unwrap();
                sender.send_text(&body).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for _ in 0..8 {
            let frame = Frame::read_from(&mut client).await.unwrap();
            assert_eq!(frame.payload.len(), 70_000);
            let first = frame.payload[0];
            assert!(frame.payload.iter().all(|&b| b == first));
        }
    }

    #[tokio::test]
    async fn test_cancelled_send_closes_connection() {
        let (conn, mut client) = connect_pair_with_capacity(4096).await;
        let (_receiver, sender) = conn.split();

        // The pipe fills up and the write stalls partway through the frame
        let body = "x".repeat(64 * 1024);
        let stalled =
            tokio::time::timeout(Duration::from_millis(100), sender.send_text(&body)).await;
        assert!(stalled.is_err());
        assert!(!sender.is_open());

        // Nothing follows the truncated frame
        sender.send_text("after").await.unwrap();
        sender.close().await;

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.len() < body.len());
        assert!(!String::from_utf8_lossy(&received).contains("after"));
    }
}
