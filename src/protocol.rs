// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication handshake wire protocol.
//!
//! Frames exchanged between a slave and its masters before the data stream
//! starts. After `START_OF_REPLICATION_STREAM` the socket belongs to the
//! streaming multiplexer and this module no longer interprets its bytes.
//!
//! # Frame Layout
//!
//! All integers are little-endian. `frame_len` counts the whole frame,
//! header included.
//!
//! ```text
//! ┌────────────────┬─────────────────┬──────────────────────────┐
//! │ frame_type: u8 │ frame_len: u32  │ payload (frame_len - 5)  │
//! └────────────────┴─────────────────┴──────────────────────────┘
//!
//! REQUEST_TABLE_INFO (1)          slave → master
//!   protocol_version u32 | instance_id_lo u64 | instance_id_hi u64
//!   | peer_id u64 | table_name utf16le[..]
//!
//! TABLE_INFO (2)                  master → slave
//!   master_table_id u32 | row_count u64 | structure_version u64
//!   | table_name utf16le[..]
//!
//! REQUEST_REPLICATION_STREAM (3)  slave → first master
//!   master_table_id u32 | structure_version u64 | initial_row_count u64
//!
//! START_OF_REPLICATION_STREAM (4) first master → slave
//!   master_table_id u32 | metadata_len u64 | metadata[metadata_len]
//!   | symbol_tables[..]
//! ```
//!
//! A `master_table_id` of 0 in `TABLE_INFO` means the master does not have
//! the table.
//!
//! Decoding never panics: every read is bounds-checked and reported as a
//! [`FrameError`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;
use thiserror::Error;

/// Size of the `[frame_type][frame_len]` header.
pub const HEADER_LEN: usize = 5;

/// Protocol version sent in `REQUEST_TABLE_INFO`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Smallest usable frame buffer: room for the largest fixed-size frame.
pub const MIN_FRAME_BUFFER_SIZE: usize = 64;

const REQUEST_TABLE_INFO_FIXED: usize = HEADER_LEN + 4 + 8 + 8 + 8;
const TABLE_INFO_FIXED: usize = HEADER_LEN + 4 + 8 + 8;
const REQUEST_STREAM_LEN: usize = HEADER_LEN + 4 + 8 + 8;
const START_OF_STREAM_FIXED: usize = HEADER_LEN + 4 + 8;

/// Errors decoding or encoding a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: needed {needed} more bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    #[error("declared frame length {0} is shorter than the frame header")]
    InvalidLength(u32),

    #[error("frame of {len} bytes exceeds the {limit} byte frame buffer")]
    TooLarge { len: usize, limit: usize },

    #[error("table name is not valid UTF-16")]
    InvalidTableName,

    #[error("metadata length {declared} overruns the frame ({available} bytes left)")]
    MetadataOverrun { declared: u64, available: usize },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Frame types
// ═══════════════════════════════════════════════════════════════════════════════

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    RequestTableInfo = 1,
    TableInfo = 2,
    RequestReplicationStream = 3,
    StartOfReplicationStream = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(Self::RequestTableInfo),
            2 => Ok(Self::TableInfo),
            3 => Ok(Self::RequestReplicationStream),
            4 => Ok(Self::StartOfReplicationStream),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }
}

impl FrameType {
    /// Metric/log label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestTableInfo => "REQUEST_TABLE_INFO",
            Self::TableInfo => "TABLE_INFO",
            Self::RequestReplicationStream => "REQUEST_REPLICATION_STREAM",
            Self::StartOfReplicationStream => "START_OF_REPLICATION_STREAM",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slave's opening frame on every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTableInfo {
    pub protocol_version: u32,
    pub instance_id: u128,
    pub peer_id: u64,
    pub table_name: String,
}

/// Master's description of the requested table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    /// 0 when the master does not have the table.
    pub master_table_id: u32,
    pub row_count: u64,
    pub structure_version: u64,
    pub table_name: String,
}

/// Sent on the first connection once every master has answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestReplicationStream {
    pub master_table_id: u32,
    pub structure_version: u64,
    pub initial_row_count: u64,
}

/// Master's confirmation that data will follow.
///
/// Carries the table metadata and symbol tables the slave needs to create
/// the table locally when it does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOfReplicationStream {
    pub master_table_id: u32,
    pub metadata: Bytes,
    pub symbols: Bytes,
}

/// One decoded handshake frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    RequestTableInfo(RequestTableInfo),
    TableInfo(TableInfo),
    RequestReplicationStream(RequestReplicationStream),
    StartOfReplicationStream(StartOfReplicationStream),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::RequestTableInfo(_) => FrameType::RequestTableInfo,
            Self::TableInfo(_) => FrameType::TableInfo,
            Self::RequestReplicationStream(_) => FrameType::RequestReplicationStream,
            Self::StartOfReplicationStream(_) => FrameType::StartOfReplicationStream,
        }
    }

    /// Total encoded size, header included.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::RequestTableInfo(f) => REQUEST_TABLE_INFO_FIXED + utf16_len(&f.table_name),
            Self::TableInfo(f) => TABLE_INFO_FIXED + utf16_len(&f.table_name),
            Self::RequestReplicationStream(_) => REQUEST_STREAM_LEN,
            Self::StartOfReplicationStream(f) => {
                START_OF_STREAM_FIXED + f.metadata.len() + f.symbols.len()
            }
        }
    }

    /// Append the encoded frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = self.encoded_len();
        let frame_len = u32::try_from(len).map_err(|_| FrameError::TooLarge {
            len,
            limit: u32::MAX as usize,
        })?;

        dst.reserve(len);
        dst.put_u8(self.frame_type() as u8);
        dst.put_u32_le(frame_len);

        match self {
            Self::RequestTableInfo(f) => {
                dst.put_u32_le(f.protocol_version);
                dst.put_u64_le(f.instance_id as u64);
                dst.put_u64_le((f.instance_id >> 64) as u64);
                dst.put_u64_le(f.peer_id);
                put_utf16(dst, &f.table_name);
            }
            Self::TableInfo(f) => {
                dst.put_u32_le(f.master_table_id);
                dst.put_u64_le(f.row_count);
                dst.put_u64_le(f.structure_version);
                put_utf16(dst, &f.table_name);
            }
            Self::RequestReplicationStream(f) => {
                dst.put_u32_le(f.master_table_id);
                dst.put_u64_le(f.structure_version);
                dst.put_u64_le(f.initial_row_count);
            }
            Self::StartOfReplicationStream(f) => {
                dst.put_u32_le(f.master_table_id);
                dst.put_u64_le(f.metadata.len() as u64);
                dst.put_slice(&f.metadata);
                dst.put_slice(&f.symbols);
            }
        }
        Ok(())
    }

    /// Decode exactly one frame. `src` must start at a frame header; bytes
    /// past the declared frame length are ignored.
    pub fn decode(src: &[u8]) -> Result<Frame, FrameError> {
        let Some((frame_type, len)) = peek_header(src)? else {
            return Err(FrameError::Truncated {
                needed: HEADER_LEN,
                available: src.len(),
            });
        };
        if src.len() < len {
            return Err(FrameError::Truncated {
                needed: len,
                available: src.len(),
            });
        }
        let mut body = &src[HEADER_LEN..len];

        let frame = match frame_type {
            FrameType::RequestTableInfo => {
                let protocol_version = take_u32(&mut body)?;
                let lo = take_u64(&mut body)?;
                let hi = take_u64(&mut body)?;
                let peer_id = take_u64(&mut body)?;
                Frame::RequestTableInfo(RequestTableInfo {
                    protocol_version,
                    instance_id: ((hi as u128) << 64) | lo as u128,
                    peer_id,
                    table_name: take_utf16(body)?,
                })
            }
            FrameType::TableInfo => {
                let master_table_id = take_u32(&mut body)?;
                let row_count = take_u64(&mut body)?;
                let structure_version = take_u64(&mut body)?;
                Frame::TableInfo(TableInfo {
                    master_table_id,
                    row_count,
                    structure_version,
                    table_name: take_utf16(body)?,
                })
            }
            FrameType::RequestReplicationStream => {
                Frame::RequestReplicationStream(RequestReplicationStream {
                    master_table_id: take_u32(&mut body)?,
                    structure_version: take_u64(&mut body)?,
                    initial_row_count: take_u64(&mut body)?,
                })
            }
            FrameType::StartOfReplicationStream => {
                let master_table_id = take_u32(&mut body)?;
                let declared = take_u64(&mut body)?;
                let meta_len = usize::try_from(declared)
                    .ok()
                    .filter(|n| *n <= body.len())
                    .ok_or(FrameError::MetadataOverrun {
                        declared,
                        available: body.len(),
                    })?;
                let (metadata, symbols) = body.split_at(meta_len);
                Frame::StartOfReplicationStream(StartOfReplicationStream {
                    master_table_id,
                    metadata: Bytes::copy_from_slice(metadata),
                    symbols: Bytes::copy_from_slice(symbols),
                })
            }
        };
        Ok(frame)
    }
}

/// Parse a frame header. Returns `None` when fewer than [`HEADER_LEN`]
/// bytes are available.
pub fn peek_header(src: &[u8]) -> Result<Option<(FrameType, usize)>, FrameError> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let frame_type = FrameType::try_from(src[0])?;
    let mut len_bytes = &src[1..HEADER_LEN];
    let declared = len_bytes.get_u32_le();
    if (declared as usize) < HEADER_LEN {
        return Err(FrameError::InvalidLength(declared));
    }
    Ok(Some((frame_type, declared as usize)))
}

fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

fn put_utf16(dst: &mut BytesMut, s: &str) {
    for unit in s.encode_utf16() {
        dst.put_u16_le(unit);
    }
}

fn ensure(body: &[u8], needed: usize) -> Result<(), FrameError> {
    if body.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            available: body.len(),
        });
    }
    Ok(())
}

fn take_u32(body: &mut &[u8]) -> Result<u32, FrameError> {
    ensure(body, 4)?;
    Ok(body.get_u32_le())
}

fn take_u64(body: &mut &[u8]) -> Result<u64, FrameError> {
    ensure(body, 8)?;
    Ok(body.get_u64_le())
}

fn take_utf16(body: &[u8]) -> Result<String, FrameError> {
    if body.len() % 2 != 0 {
        return Err(FrameError::InvalidTableName);
    }
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| FrameError::InvalidTableName)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Buffers
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of one non-blocking read into a [`FrameReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were appended.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// Peer closed the connection.
    Eof,
    /// Buffer full; consume a frame before reading again.
    Full,
}

/// Fixed-capacity inbound buffer that yields whole frames.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    capacity: usize,
}

impl FrameReader {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Append bytes using `read`, which receives the buffer and the maximum
    /// number of bytes it may append, and returns how many it appended.
    pub fn fill<F>(&mut self, read: F) -> io::Result<ReadOutcome>
    where
        F: FnOnce(&mut BytesMut, usize) -> io::Result<usize>,
    {
        let free = self.capacity.saturating_sub(self.buf.len());
        if free == 0 {
            return Ok(ReadOutcome::Full);
        }
        self.buf.reserve(free);
        match read(&mut self.buf, free) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Decode the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let Some((_, len)) = peek_header(&self.buf)? else {
            return Ok(None);
        };
        if len > self.capacity {
            return Err(FrameError::TooLarge {
                len,
                limit: self.capacity,
            });
        }
        if self.buf.len() < len {
            return Ok(None);
        }
        let frame = self.buf.split_to(len);
        Frame::decode(&frame).map(Some)
    }

    /// Take every byte not yet consumed as a frame.
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

/// Fixed-capacity outbound buffer drained by non-blocking writes.
#[derive(Debug)]
pub struct FrameWriter {
    buf: BytesMut,
    capacity: usize,
}

impl FrameWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            capacity,
        }
    }

    /// Encode `frame` behind whatever is still pending.
    pub fn queue(&mut self, frame: &Frame) -> Result<(), FrameError> {
        let len = frame.encoded_len();
        if self.buf.len() + len > self.capacity {
            return Err(FrameError::TooLarge {
                len,
                limit: self.capacity - self.buf.len(),
            });
        }
        frame.encode(&mut self.buf)
    }

    /// Write as much as `write` accepts. Returns `true` once nothing is
    /// pending, `false` if the socket would block first.
    pub fn flush<F>(&mut self, mut write: F) -> io::Result<bool>
    where
        F: FnMut(&[u8]) -> io::Result<usize>,
    {
        while !self.buf.is_empty() {
            match write(&self.buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => self.buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
