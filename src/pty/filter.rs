//! Byte filters applied between the PTY and the client
//!
//! Output passes through `SyncMarkerFilter` and then `Utf8Decoder`; input
//! passes through `strip_replacement_chars`.

use std::borrow::Cow;

/// Begin synchronized update (DEC private mode 2026 set)
pub const SYNC_BEGIN: &[u8] = b"\x1b[?2026h";

/// End synchronized update (DEC private mode 2026 reset)
pub const SYNC_END: &[u8] = b"\x1b[?2026l";

/// Character substituted by lossy decoders for invalid input
pub const REPLACEMENT_CHAR: char = '\u{FFFD}';

const ESC: u8 = 0x1b;

/// Strips synchronized-update markers from a byte stream.
///
/// A marker split across two reads is reassembled: a trailing partial match
/// is held back and rescanned together with the next chunk.
#[derive(Debug, Default)]
pub struct SyncMarkerFilter {
    carry: Vec<u8>,
}

impl SyncMarkerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter one chunk, returning the bytes that are safe to emit now
    pub fn filter(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(chunk);

        let mut out = Vec::with_capacity(data.len());
        let mut i = 0;
        while i < data.len() {
            if data[i] == ESC {
                let rest = &data[i..];
                if rest.starts_with(SYNC_BEGIN) {
                    i += SYNC_BEGIN.len();
                    continue;
                }
                if rest.starts_with(SYNC_END) {
                    i += SYNC_END.len();
                    continue;
                }
                if is_partial_marker(rest) {
                    self.carry = rest.to_vec();
                    break;
                }
            }
            out.push(data[i]);
            i += 1;
        }

        out
    }

    /// Release any held-back bytes, e.g. at end of stream
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.carry)
    }

    /// Whether bytes are currently held back
    pub fn has_pending(&self) -> bool {
        !self.carry.is_empty()
    }
}

fn is_partial_marker(rest: &[u8]) -> bool {
    (rest.len() < SYNC_BEGIN.len() && SYNC_BEGIN.starts_with(rest))
        || (rest.len() < SYNC_END.len() && SYNC_END.starts_with(rest))
}

/// Incremental UTF-8 decoder.
///
/// An incomplete multi-byte sequence at the end of a chunk is carried into
/// the next one instead of being replaced. Invalid bytes decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(chunk);

        let mut out = String::with_capacity(data.len());
        let mut rest = &data[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(REPLACEMENT_CHAR);
                            rest = &tail[bad..];
                        }
                        None => {
                            self.carry = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Decode whatever is still held back
    pub fn flush(&mut self) -> String {
        let carry = std::mem::take(&mut self.carry);
        String::from_utf8_lossy(&carry).into_owned()
    }
}

/// Remove U+FFFD from client input. The character only ever appears as an
/// artifact of a client-side decoding error.
pub fn strip_replacement_chars(input: &str) -> Cow<'_, str> {
    if input.contains(REPLACEMENT_CHAR) {
        Cow::Owned(input.chars().filter(|&c| c != REPLACEMENT_CHAR).collect())
    } else {
        Cow::Borrowed(input)
    }
}
