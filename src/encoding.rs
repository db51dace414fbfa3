//! Length-prefixed binary primitives used by both the node storage
//! encoding and the node hash-input encoding.
//!
//! Three shapes exist:
//!
//! - `int8`: a single raw byte (two's complement).
//! - signed varint: zigzag-mapped, then LEB128.
//! - length-prefixed bytes: unsigned LEB128 length, then the raw bytes.
//!
//! The encodings are fixed: they feed SHA-256 to form node hashes, so any
//! change would alter every root hash ever produced.

use crate::error::TreeError;

/// Longest possible LEB128 encoding of a 64-bit value.
const MAX_VARINT_LEN: usize = 10;

#[inline]
fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Appends a single two's-complement byte.
#[inline]
pub fn put_int8(buf: &mut Vec<u8>, v: i8) {
    buf.push(v as u8);
}

/// Reads a single two's-complement byte, returning the value and the number
/// of bytes consumed.
pub fn get_int8(buf: &[u8]) -> Result<(i8, usize), TreeError> {
    match buf.first() {
        Some(&b) => Ok((b as i8, 1)),
        None => Err(TreeError::MalformedNode("unexpected end of input".into())),
    }
}

/// Appends an unsigned LEB128 varint.
pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push(v as u8 | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Reads an unsigned LEB128 varint, returning the value and the number of
/// bytes consumed.
pub fn get_uvarint(buf: &[u8]) -> Result<(u64, usize), TreeError> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(TreeError::MalformedNode("varint overflows u64".into()));
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(TreeError::MalformedNode(
        "varint truncated or too long".into(),
    ))
}

/// Appends a zigzag-encoded signed varint.
#[inline]
pub fn put_varint(buf: &mut Vec<u8>, v: i64) {
    put_uvarint(buf, zigzag(v));
}

/// Reads a zigzag-encoded signed varint.
#[inline]
pub fn get_varint(buf: &[u8]) -> Result<(i64, usize), TreeError> {
    let (v, n) = get_uvarint(buf)?;
    Ok((unzigzag(v), n))
}

/// Appends a length-prefixed byte slice.
pub fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_uvarint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Reads a length-prefixed byte slice, returning the contents and the total
/// number of bytes consumed (prefix included).
pub fn get_bytes(buf: &[u8]) -> Result<(&[u8], usize), TreeError> {
    let (len, prefix) = get_uvarint(buf)?;
    let len = usize::try_from(len)
        .map_err(|_| TreeError::MalformedNode("byte slice length overflows usize".into()))?;
    let end = prefix
        .checked_add(len)
        .ok_or_else(|| TreeError::MalformedNode("byte slice length overflows usize".into()))?;
    if buf.len() < end {
        return Err(TreeError::MalformedNode(format!(
            "byte slice truncated: want {} bytes, have {}",
            len,
            buf.len() - prefix
        )));
    }
    Ok((&buf[prefix..end], end))
}
