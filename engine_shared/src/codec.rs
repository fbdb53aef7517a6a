//! Binary serialization primitives.
//!
//! Fixed-width little-endian integers and floats plus `u16`-length-prefixed
//! UTF-8 strings. Writers append to a `BytesMut`; readers consume from a byte
//! slice cursor and never panic on short input.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

/// Longest string `put_string` accepts.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Decoding/encoding failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes remained than the value needs.
    UnexpectedEof { needed: usize, remaining: usize },
    /// String bytes were not valid UTF-8.
    InvalidUtf8,
    /// String longer than [`MAX_STRING_LEN`].
    StringTooLong(usize),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnexpectedEof { needed, remaining } => write!(
                f,
                "unexpected end of data: needed {needed} bytes, {remaining} remaining"
            ),
            CodecError::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            CodecError::StringTooLong(len) => {
                write!(f, "string of {len} bytes exceeds {MAX_STRING_LEN}")
            }
        }
    }
}

impl std::error::Error for CodecError {}

pub fn put_u8(buf: &mut BytesMut, value: u8) {
    buf.put_u8(value);
}

pub fn put_u16(buf: &mut BytesMut, value: u16) {
    buf.put_u16_le(value);
}

pub fn put_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u32_le(value);
}

pub fn put_f32(buf: &mut BytesMut, value: f32) {
    buf.put_f32_le(value);
}

/// Writes a `u16` byte length followed by the UTF-8 bytes.
pub fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), CodecError> {
    if value.len() > MAX_STRING_LEN {
        return Err(CodecError::StringTooLong(value.len()));
    }
    buf.put_u16_le(value.len() as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Encoded size of a string written by [`put_string`].
pub fn string_len(value: &str) -> usize {
    2 + value.len()
}

fn ensure(src: &[u8], needed: usize) -> Result<(), CodecError> {
    if src.remaining() < needed {
        return Err(CodecError::UnexpectedEof {
            needed,
            remaining: src.remaining(),
        });
    }
    Ok(())
}

pub fn get_u8(src: &mut &[u8]) -> Result<u8, CodecError> {
    ensure(src, 1)?;
    Ok(src.get_u8())
}

pub fn get_u16(src: &mut &[u8]) -> Result<u16, CodecError> {
    ensure(src, 2)?;
    Ok(src.get_u16_le())
}

pub fn get_u32(src: &mut &[u8]) -> Result<u32, CodecError> {
    ensure(src, 4)?;
    Ok(src.get_u32_le())
}

pub fn get_f32(src: &mut &[u8]) -> Result<f32, CodecError> {
    ensure(src, 4)?;
    Ok(src.get_f32_le())
}

pub fn get_string(src: &mut &[u8]) -> Result<String, CodecError> {
    let len = get_u16(src)? as usize;
    ensure(src, len)?;
    let whole: &[u8] = *src;
    let (head, tail) = whole.split_at(len);
    let value = std::str::from_utf8(head)
        .map_err(|_| CodecError::InvalidUtf8)?
        .to_string();
    *src = tail;
    Ok(value)
}

/// Splits off exactly `len` bytes.
pub fn get_slice<'a>(src: &mut &'a [u8], len: usize) -> Result<&'a [u8], CodecError> {
    ensure(src, len)?;
    let whole: &'a [u8] = *src;
    let (head, tail) = whole.split_at(len);
    *src = tail;
    Ok(head)
}
