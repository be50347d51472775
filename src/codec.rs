//! Shared binary encoding helpers for the partition slot format.
//!
//! Strings are length-prefixed with the common 7-bit-continuation varint
//! encoding (a single byte for lengths up to 127, matching the embedded
//! binary-writer convention this format is pinned to).

use crate::error::{PersistenceError, Result};

/// Encodes `value` as a 7-bit-continuation varint, appending to `out`.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Number of bytes `write_varint` would emit for `value`.
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Reads a 7-bit-continuation varint from the front of `buf`, returning the
/// decoded value and the number of bytes consumed.
pub fn read_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            break;
        }
    }
    Err(PersistenceError::IoError(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "truncated varint length prefix",
    )))
}

/// Writes a length-prefixed UTF-8 string.
pub fn write_prefixed_string(out: &mut Vec<u8>, s: &str) {
    write_varint(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

/// Reads a length-prefixed UTF-8 string from the front of `buf`, returning
/// the string and the number of bytes consumed.
pub fn read_prefixed_string(buf: &[u8]) -> Result<(String, usize)> {
    let (len, prefix_len) = read_varint(buf)?;
    let len = len as usize;
    let start = prefix_len;
    let end = start
        .checked_add(len)
        .ok_or(PersistenceError::IoError(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "string length overflow",
        )))?;
    let bytes = buf.get(start..end).ok_or_else(|| {
        PersistenceError::IoError(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "truncated string payload",
        ))
    })?;
    let s = std::str::from_utf8(bytes)
        .map_err(|e| {
            PersistenceError::IoError(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?
        .to_owned();
    Ok((s, end))
}
