//! Commit log record format.
//!
//! Each record has the following binary layout (all integers big-endian):
//!
//! ```text
//! +----------+----------+-----------+-------+---------+-----+-----------+-------+
//! |  Offset  |   Size   | Timestamp | Attrs | Key len | Key | Value len | Value |
//! | (8 bytes)| (4 bytes)| (8 bytes) | (1 b) | (4 b)   | (N) | (4 b)     | (M)   |
//! +----------+----------+-----------+-------+---------+-----+-----------+-------+
//! ```
//!
//! - Offset: the record's own log offset, stamped at append time
//! - Size: `key len + value len + 8` (everything after the header)
//! - Attrs: bits 0-1 mode, bits 2-4 op, bits 5-7 unused

use crate::error::{Result, TransitError};
use crate::message::Op;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{self, Read};

/// Size of the fixed record header in bytes.
pub const HEADER_LEN: usize = 21;

/// Width of the key and value length prefixes.
pub const LEN_PREFIX: usize = 4;

const MODE_MASK: u8 = 0b0000_0011;
const OP_MASK: u8 = 0b0001_1100;
const OP_SHIFT: u8 = 2;

/// Where a reader is with respect to a given namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Copy,
    Sync,
    Complete,
}

impl Mode {
    fn to_bits(self) -> u8 {
        match self {
            Mode::Copy => 0,
            Mode::Sync => 1,
            Mode::Complete => 2,
        }
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Mode::Copy),
            1 => Some(Mode::Sync),
            2 => Some(Mode::Complete),
            _ => None,
        }
    }
}

/// Decoded fixed-size header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub offset: u64,
    pub size: u32,
    pub timestamp: u64,
    pub attributes: u8,
}

impl EntryHeader {
    pub fn decode(mut buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= HEADER_LEN);
        Self {
            offset: buf.get_u64(),
            size: buf.get_u32(),
            timestamp: buf.get_u64(),
            attributes: buf.get_u8(),
        }
    }

    /// Total on-disk length of the record this header starts.
    #[inline]
    pub fn record_len(&self) -> u64 {
        HEADER_LEN as u64 + u64::from(self.size)
    }
}

/// High level view of one commit log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: u64,
    pub mode: Mode,
    pub op: Op,
}

impl LogEntry {
    /// Pack mode and op into the attribute byte.
    pub fn attributes(&self) -> u8 {
        self.mode.to_bits() | (self.op.to_bits() << OP_SHIFT)
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + 2 * LEN_PREFIX + self.key.len() + self.value.len()
    }

    /// Serialize the record, stamping it with `offset`.
    pub fn encode(&self, offset: u64) -> Result<Bytes> {
        let size = body_size(self.key.len(), self.value.len())?;
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u64(offset);
        buf.put_u32(size);
        buf.put_u64(self.timestamp);
        buf.put_u8(self.attributes());
        // both lengths are below `size`, which fits in a u32
        buf.put_u32(self.key.len() as u32);
        buf.put_slice(&self.key);
        buf.put_u32(self.value.len() as u32);
        buf.put_slice(&self.value);
        Ok(buf.freeze())
    }

    /// Rebuild an entry from its header and the `size` bytes that follow it.
    pub fn decode(header: &EntryHeader, mut body: &[u8], position: u64) -> Result<Self> {
        let corrupt = |reason: &str| TransitError::CorruptEntry {
            position,
            reason: reason.to_string(),
        };
        if body.len() < LEN_PREFIX {
            return Err(corrupt("missing key length"));
        }
        let key_len = body.get_u32() as usize;
        if body.len() < key_len + LEN_PREFIX {
            return Err(corrupt("key overruns record"));
        }
        let key = body[..key_len].to_vec();
        body.advance(key_len);
        let value_len = body.get_u32() as usize;
        if body.len() != value_len {
            return Err(corrupt("value length does not match record size"));
        }
        let mode = Mode::from_bits(header.attributes & MODE_MASK).ok_or_else(|| corrupt("bad mode"))?;
        let op = Op::from_bits((header.attributes & OP_MASK) >> OP_SHIFT)
            .ok_or_else(|| corrupt("bad op"))?;
        Ok(Self {
            key,
            value: body.to_vec(),
            timestamp: header.timestamp,
            mode,
            op,
        })
    }
}

/// The header's size field: both length prefixes plus key and value.
fn body_size(key_len: usize, value_len: usize) -> Result<u32> {
    key_len
        .checked_add(value_len)
        .and_then(|n| n.checked_add(2 * LEN_PREFIX))
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(TransitError::EntryTooLarge { key_len, value_len })
}

/// Fill `buf` from `r`, stopping early only at end of data. Returns the number
/// of bytes read.
pub(crate) fn read_full<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(read) => n += read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

/// Read the next record from a sequential reader.
///
/// Returns `Ok(None)` at end of data, including when the trailing record is
/// only partially written.
pub fn read_entry<R: Read + ?Sized>(r: &mut R) -> Result<Option<(u64, LogEntry)>> {
    let mut header_buf = [0u8; HEADER_LEN];
    if read_full(r, &mut header_buf)? < HEADER_LEN {
        return Ok(None);
    }
    let header = EntryHeader::decode(&header_buf);
    let mut body = vec![0u8; header.size as usize];
    if read_full(r, &mut body)? < body.len() {
        return Ok(None);
    }
    let entry = LogEntry::decode(&header, &body, header.offset)?;
    Ok(Some((header.offset, entry)))
}
