//! Snapshot file format definitions.
//!
//! # File Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ MAGIC: [u8; 5] = "REDIS"                        │
//! ├─────────────────────────────────────────────────┤
//! │ VERSION_AND_FLAGS: [u8; 4]                      │
//! │   byte 0: major version (currently 0x01)        │
//! │   byte 1: flags                                 │
//! │     bit 0: payload is gzip-compressed           │
//! │     bit 1: trailing CRC32 present               │
//! │   bytes 2-3: reserved, must be 0x00             │
//! ├─────────────────────────────────────────────────┤
//! │                  PAYLOAD                        │
//! │ (possibly gzip compressed)                      │
//! │ ┌─────────────────────────────────────────────┐ │
//! │ │ Entry 1:                                    │ │
//! │ │  - Value Tag: u8                            │ │
//! │ │  - Key Length: varint                       │ │
//! │ │  - Key: [u8]                                │ │
//! │ │  - Expiry Ms: i64 LE (-1 = none)            │ │
//! │ │  - Value Body (tag-dependent)               │ │
//! │ ├─────────────────────────────────────────────┤ │
//! │ │ Entry 2: ...                                │ │
//! │ └─────────────────────────────────────────────┘ │
//! ├─────────────────────────────────────────────────┤
//! │ CRC32: u32 LE over all preceding bytes          │
//! │ (present iff flags bit 1 set)                   │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! A predecessor format used the fixed ASCII version `"0001"` with no flags
//! byte; it is accepted on read as `major=1, flags=compressed|checksumed`.

use crate::types::{SnapshotEntry, Value};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Magic prefix of every snapshot file.
pub const MAGIC: [u8; 5] = *b"REDIS";

/// Current major format version.
pub const VERSION_MAJOR: u8 = 1;

/// Header size in bytes (magic + version/flags).
pub const HEADER_SIZE: usize = 9;

/// Flag: payload is gzip-compressed.
pub const FLAG_COMPRESSED: u8 = 1 << 0;

/// Flag: file ends with a CRC32 trailer.
pub const FLAG_CHECKSUMED: u8 = 1 << 1;

/// Expiry sentinel for entries without a TTL.
pub const NO_EXPIRY: i64 = -1;

/// Legacy fixed version field, accepted on read only.
const LEGACY_VERSION: [u8; 4] = *b"0001";

/// Value variant tags.
const TAG_STR: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_LIST: u8 = 2;
const TAG_SET: u8 = 3;
const TAG_HASH: u8 = 4;
const TAG_ZSET: u8 = 5;

/// Decode-side corruption errors.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("bad magic number")]
    BadMagic,

    #[error("unsupported snapshot version: {0}")]
    UnsupportedVersion(u8),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

/// Parsed version-and-flags header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    /// Major format version.
    pub major: u8,

    /// Flags bitfield.
    pub flags: u8,
}

impl SnapshotHeader {
    /// Build a header for a new snapshot.
    pub fn new(compressed: bool, checksumed: bool) -> Self {
        let mut flags = 0;
        if compressed {
            flags |= FLAG_COMPRESSED;
        }
        if checksumed {
            flags |= FLAG_CHECKSUMED;
        }
        Self {
            major: VERSION_MAJOR,
            flags,
        }
    }

    /// Whether the payload is gzip-compressed.
    pub fn compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// Whether a CRC32 trailer is present.
    pub fn checksumed(&self) -> bool {
        self.flags & FLAG_CHECKSUMED != 0
    }

    /// Serialize magic plus version/flags.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..5].copy_from_slice(&MAGIC);
        buf[5] = self.major;
        buf[6] = self.flags;
        buf
    }

    /// Parse the header from the start of a snapshot file.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_SIZE {
            return Err(DecodeError::Malformed("truncated header"));
        }
        if buf[0..5] != MAGIC {
            return Err(DecodeError::BadMagic);
        }

        let version = &buf[5..9];
        if version == LEGACY_VERSION {
            return Ok(Self {
                major: VERSION_MAJOR,
                flags: FLAG_COMPRESSED | FLAG_CHECKSUMED,
            });
        }

        let major = version[0];
        if major != VERSION_MAJOR {
            return Err(DecodeError::UnsupportedVersion(major));
        }
        if version[2] != 0 || version[3] != 0 {
            return Err(DecodeError::Malformed("nonzero reserved version bytes"));
        }

        Ok(Self {
            major,
            flags: version[1],
        })
    }
}

/// Encode a u32 as a variable-length integer (LEB128).
pub(crate) fn encode_varint(mut value: u32, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], DecodeError> {
    let end = pos
        .checked_add(n)
        .ok_or(DecodeError::Malformed("length overflow"))?;
    if end > buf.len() {
        return Err(DecodeError::Malformed("truncated entry"));
    }
    let slice = &buf[*pos..end];
    *pos = end;
    Ok(slice)
}

fn take_varint(buf: &[u8], pos: &mut usize) -> Result<u32, DecodeError> {
    let mut value: u32 = 0;
    let mut shift = 0;
    loop {
        let byte = take(buf, pos, 1)?[0];
        value |= u32::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 35 {
            return Err(DecodeError::Malformed("varint overflow"));
        }
    }
}

fn take_bytes(buf: &[u8], pos: &mut usize) -> Result<Bytes, DecodeError> {
    let len = take_varint(buf, pos)? as usize;
    Ok(Bytes::copy_from_slice(take(buf, pos, len)?))
}

fn take_i64(buf: &[u8], pos: &mut usize) -> Result<i64, DecodeError> {
    let raw = take(buf, pos, 8)?;
    Ok(i64::from_le_bytes(raw.try_into().expect("8-byte slice")))
}

fn take_f64(buf: &[u8], pos: &mut usize) -> Result<f64, DecodeError> {
    let raw = take(buf, pos, 8)?;
    Ok(f64::from_le_bytes(raw.try_into().expect("8-byte slice")))
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    encode_varint(bytes.len() as u32, buf);
    buf.extend_from_slice(bytes);
}

fn value_tag(value: &Value) -> u8 {
    match value {
        Value::Str(_) => TAG_STR,
        Value::Int(_) => TAG_INT,
        Value::List(_) => TAG_LIST,
        Value::Set(_) => TAG_SET,
        Value::Hash(_) => TAG_HASH,
        Value::SortedSet(_) => TAG_ZSET,
    }
}

/// Serialize one entry onto `buf`.
pub fn encode_entry(entry: &SnapshotEntry, buf: &mut Vec<u8>) {
    buf.push(value_tag(&entry.value));
    put_bytes(buf, &entry.key);
    buf.extend_from_slice(&entry.expires_at_ms.unwrap_or(NO_EXPIRY).to_le_bytes());

    match &entry.value {
        Value::Str(s) => put_bytes(buf, s),
        Value::Int(n) => buf.extend_from_slice(&n.to_le_bytes()),
        Value::List(items) => {
            encode_varint(items.len() as u32, buf);
            for item in items {
                put_bytes(buf, item);
            }
        }
        Value::Set(members) => {
            encode_varint(members.len() as u32, buf);
            for member in members {
                put_bytes(buf, member);
            }
        }
        Value::Hash(fields) => {
            encode_varint(fields.len() as u32, buf);
            for (field, value) in fields {
                put_bytes(buf, field);
                put_bytes(buf, value);
            }
        }
        Value::SortedSet(members) => {
            encode_varint(members.len() as u32, buf);
            for (member, score) in members {
                put_bytes(buf, member);
                buf.extend_from_slice(&score.to_le_bytes());
            }
        }
    }
}

/// Parse one entry from `buf`, returning it and the bytes consumed.
pub fn decode_entry(buf: &[u8]) -> Result<(SnapshotEntry, usize), DecodeError> {
    let mut pos = 0;

    let tag = take(buf, &mut pos, 1)?[0];
    let key = take_bytes(buf, &mut pos)?;
    let expiry = take_i64(buf, &mut pos)?;
    let expires_at_ms = if expiry == NO_EXPIRY {
        None
    } else {
        Some(expiry)
    };

    let value = match tag {
        TAG_STR => Value::Str(take_bytes(buf, &mut pos)?),
        TAG_INT => Value::Int(take_i64(buf, &mut pos)?),
        TAG_LIST => {
            let count = take_varint(buf, &mut pos)?;
            let mut items = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                items.push(take_bytes(buf, &mut pos)?);
            }
            Value::List(items)
        }
        TAG_SET => {
            let count = take_varint(buf, &mut pos)?;
            let mut members = BTreeSet::new();
            for _ in 0..count {
                members.insert(take_bytes(buf, &mut pos)?);
            }
            Value::Set(members)
        }
        TAG_HASH => {
            let count = take_varint(buf, &mut pos)?;
            let mut fields = BTreeMap::new();
            for _ in 0..count {
                let field = take_bytes(buf, &mut pos)?;
                let value = take_bytes(buf, &mut pos)?;
                fields.insert(field, value);
            }
            Value::Hash(fields)
        }
        TAG_ZSET => {
            let count = take_varint(buf, &mut pos)?;
            let mut members = BTreeMap::new();
            for _ in 0..count {
                let member = take_bytes(buf, &mut pos)?;
                let score = take_f64(buf, &mut pos)?;
                members.insert(member, score);
            }
            Value::SortedSet(members)
        }
        _ => return Err(DecodeError::Malformed("unknown value tag")),
    };

    Ok((
        SnapshotEntry {
            key,
            value,
            expires_at_ms,
        },
        pos,
    ))
}
