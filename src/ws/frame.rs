//! WebSocket frame codec
//!
//! Frames written by the server are never masked. Frames read from the peer
//! may carry a mask key and are unmasked before they reach the caller.
//! Fragmented messages are rejected.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::{WsError, WsResult};

/// Largest inbound payload accepted, checked before the payload is allocated
pub const MAX_PAYLOAD_LEN: u64 = 16 * 1024 * 1024;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_BITS: u8 = 0x0F;
const LEN_BITS: u8 = 0x7F;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Frame opcodes understood by the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Decode the low nibble of the first header byte
    pub fn from_u8(value: u8) -> WsResult<Self> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(WsError::UnsupportedOpcode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    /// Close, ping and pong are handled by the protocol layer itself
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// A single protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    /// Mask key the frame was (or will be) sent with
    pub mask: Option<[u8; 4]>,
    /// Payload, always held unmasked
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a final, unmasked frame
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into().into_bytes())
    }

    pub fn close() -> Self {
        Self::new(Opcode::Close, Vec::new())
    }

    pub fn ping(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Attach a mask key, as a client would when sending
    #[cfg(test)]
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    /// Serialize the frame to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(14 + len);

        let fin = if self.fin { FIN_BIT } else { 0 };
        out.push(fin | self.opcode.as_u8());

        let mask_bit = if self.mask.is_some() { MASK_BIT } else { 0 };
        if len < LEN_16 as usize {
            out.push(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.push(mask_bit | LEN_16);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | LEN_64);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match self.mask {
            Some(key) => {
                out.extend_from_slice(&key);
                let start = out.len();
                out.extend_from_slice(&self.payload);
                apply_mask(&mut out[start..], key);
            }
            None => out.extend_from_slice(&self.payload),
        }

        out
    }

    /// Read one frame from the stream and unmask its payload.
    ///
    /// Any short read means the stream ended mid-frame and is reported as
    /// `ConnectionClosed`.
    pub async fn read_from<R>(reader: &mut R) -> WsResult<Frame>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 2];
        read_exact(reader, &mut header).await?;

        let fin = header[0] & FIN_BIT != 0;
        let opcode = Opcode::from_u8(header[0] & OPCODE_BITS)?;
        let masked = header[1] & MASK_BIT != 0;

        let len = match header[1] & LEN_BITS {
            LEN_16 => {
                let mut ext = [0u8; 2];
                read_exact(reader, &mut ext).await?;
                u16::from_be_bytes(ext) as u64
            }
            LEN_64 => {
                let mut ext = [0u8; 8];
                read_exact(reader, &mut ext).await?;
                u64::from_be_bytes(ext)
            }
            n => n as u64,
        };

        if opcode == Opcode::Continuation || (!fin && !opcode.is_control()) {
            return Err(WsError::FragmentationUnsupported);
        }
        if len > MAX_PAYLOAD_LEN {
            return Err(WsError::PayloadTooLarge(len));
        }

        let mask = if masked {
            let mut key = [0u8; 4];
            read_exact(reader, &mut key).await?;
            Some(key)
        } else {
            None
        };

        let mut payload = vec![0u8; len as usize];
        read_exact(reader, &mut payload).await?;
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Frame {
            fin,
            opcode,
            mask,
            payload,
        })
    }
}

/// XOR each byte with `key[i % 4]`. Masking and unmasking are the same operation.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> WsResult<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(WsError::ConnectionClosed),
        Err(e) => Err(WsError::Io(e)),
    }
}
