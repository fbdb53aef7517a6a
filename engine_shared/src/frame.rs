//! Wire framing.
//!
//! `Frame = u16 totalLength | payload (totalLength - 2 bytes)`, where the
//! length counts the two prefix bytes themselves. [`FrameReader`] accumulates
//! raw socket reads and hands back complete payloads; a partial frame stays
//! buffered until the rest arrives.
//!
//! There is no resynchronization: once a corrupt length is read the stream is
//! unusable, and a declared length below [`FRAME_HEADER_LEN`] is reported as
//! an error so the connection can be dropped.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 2;

/// Largest payload that fits the `u16` total length.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - FRAME_HEADER_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    PayloadTooLarge(usize),
    /// Declared total length smaller than the prefix.
    InvalidLength(u16),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::PayloadTooLarge(len) => {
                write!(f, "payload of {len} bytes exceeds {MAX_PAYLOAD_LEN}")
            }
            FrameError::InvalidLength(len) => write!(f, "invalid frame length {len}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Prefixes `payload` with its total frame length.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let total = payload.len() + FRAME_HEADER_LEN;
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u16_le(total as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Per-connection reassembly buffer.
#[derive(Debug, Default)]
pub struct FrameReader {
    stream: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read socket bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.stream.extend_from_slice(data);
    }

    /// Bytes currently buffered (complete or not).
    pub fn buffered(&self) -> usize {
        self.stream.len()
    }

    /// Pops the next complete payload, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.stream.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        // Peek; only consume once the whole frame is here.
        let total = u16::from_le_bytes([self.stream[0], self.stream[1]]);
        if (total as usize) < FRAME_HEADER_LEN {
            return Err(FrameError::InvalidLength(total));
        }
        if self.stream.len() < total as usize {
            return Ok(None);
        }

        self.stream.advance(FRAME_HEADER_LEN);
        let payload = self.stream.split_to(total as usize - FRAME_HEADER_LEN);
        Ok(Some(payload.freeze()))
    }
}
