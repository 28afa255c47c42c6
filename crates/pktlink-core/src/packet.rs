//! Packet wire format
//!
//! A packet is a fixed-size header followed by a payload of packed fields.
//! Everything is host byte order; both ends must share architecture.
//!
//! ```text
//! offset 0   i32  version
//! offset 4   i32  payload_size
//! offset 8   u8   command[COMMAND_LEN]   (NUL padded)
//! offset 32  i32  type
//! offset 36  --   pad
//! offset 40  u64  seq
//! ```
//!
//! The header and payload live in one contiguous buffer, so `as_bytes()` can
//! be handed to the transport unchanged.
//!
//! # Usage
//!
//! ```ignore
//! use pktlink_core::packet::{Packet, PacketBuilder, Value};
//!
//! let req = Packet::create("resize", "iis", &[Value::Int(320), Value::Int(240), "box".into()])?;
//! let reply = PacketBuilder::reply(&req).int(0).finish()?;
//!
//! let mut reader = reply.reader();
//! let status = reader.read_int()?;
//! ```

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{PacketError, PacketResult};

/// Protocol version written into every header
pub const PACKET_VERSION: i32 = 1;

/// Size of the command field, including the terminating NUL
pub const COMMAND_LEN: usize = 24;

/// Size of the fixed header in bytes
pub const HEADER_SIZE: usize = 48;

/// Payload capacity grows in steps of this many bytes while packing
pub const PAYLOAD_GROWTH: usize = 512;

const VERSION_OFFSET: usize = 0;
const PAYLOAD_SIZE_OFFSET: usize = 4;
const COMMAND_OFFSET: usize = 8;
const TYPE_OFFSET: usize = 32;
const SEQ_OFFSET: usize = 40;

/// Process-wide sequence counter. Never reused while the process lives.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

#[inline]
fn next_seq() -> u64 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Packet type tag
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Request expecting an `Ack`
    Request = 0,
    /// Reply to a `Request`
    Ack = 1,
    /// Fire-and-forget request
    RequestNoAck = 2,
}

impl PacketType {
    /// Decode a raw header tag
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(PacketType::Request),
            1 => Some(PacketType::Ack),
            2 => Some(PacketType::RequestNoAck),
            _ => None,
        }
    }

    #[inline]
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Whether the sender waits for an `Ack`
    #[inline]
    pub fn expects_reply(self) -> bool {
        matches!(self, PacketType::Request)
    }
}

/// One packed payload field
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Str(String),
    Float(f64),
}

impl Value {
    /// Canonical format tag for this value
    pub fn tag(&self) -> char {
        match self {
            Value::Int(_) => 'i',
            Value::Str(_) => 's',
            Value::Float(_) => 'd',
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Field kind named by a format tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Int,
    Str,
    Float,
}

impl FieldKind {
    fn from_tag(tag: char) -> PacketResult<Self> {
        match tag {
            'i' | 'I' => Ok(FieldKind::Int),
            's' | 'S' => Ok(FieldKind::Str),
            'd' | 'D' => Ok(FieldKind::Float),
            other => Err(PacketError::UnknownTag(other)),
        }
    }
}

/// A packet: header plus packed payload in a single buffer
#[derive(Clone, PartialEq)]
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// Build a `Request` packet from a format string and values.
    pub fn create(command: &str, format: &str, args: &[Value]) -> PacketResult<Packet> {
        PacketBuilder::request(command)?.pack(format, args)?.finish()
    }

    /// Build a `RequestNoAck` packet. The peer never answers it.
    pub fn create_noack(command: &str, format: &str, args: &[Value]) -> PacketResult<Packet> {
        PacketBuilder::request_noack(command)?.pack(format, args)?.finish()
    }

    /// Build the `Ack` answering `original` (same command and sequence).
    pub fn create_reply(original: &Packet, format: &str, args: &[Value]) -> PacketResult<Packet> {
        PacketBuilder::reply(original).pack(format, args)?.finish()
    }

    /// Append `bytes` at `offset` of a packet under reassembly.
    ///
    /// `existing == None` starts a fresh packet and requires `offset == 0`.
    /// The offset may not leave a gap after the bytes already assembled.
    /// The buffer grows with the bytes supplied, never with the size the
    /// header announces.
    pub fn build(existing: Option<Packet>, offset: usize, bytes: &[u8]) -> PacketResult<Packet> {
        let mut packet = match existing {
            Some(packet) => packet,
            None if offset == 0 => Packet {
                buf: Vec::with_capacity(HEADER_SIZE.max(bytes.len())),
            },
            None => return Err(PacketError::InvalidOffset { offset, len: 0 }),
        };

        let len = packet.buf.len();
        if offset > len {
            return Err(PacketError::InvalidOffset { offset, len });
        }

        let end = offset + bytes.len();
        if end > len {
            packet.buf.resize(end, 0);
        }
        packet.buf[offset..end].copy_from_slice(bytes);
        Ok(packet)
    }

    // ── Header accessors (zero until the header bytes are assembled) ──

    fn header_i32(&self, offset: usize) -> i32 {
        self.buf
            .get(offset..offset + 4)
            .and_then(|b| b.try_into().ok())
            .map(i32::from_ne_bytes)
            .unwrap_or(0)
    }

    pub fn version(&self) -> i32 {
        self.header_i32(VERSION_OFFSET)
    }

    /// Payload size announced by the header
    pub fn payload_size(&self) -> usize {
        self.header_i32(PAYLOAD_SIZE_OFFSET).max(0) as usize
    }

    /// Raw command field up to the first NUL
    pub fn command_bytes(&self) -> &[u8] {
        let field = match self.buf.get(COMMAND_OFFSET..COMMAND_OFFSET + COMMAND_LEN) {
            Some(field) => field,
            None => return &[],
        };
        let end = field.iter().position(|&b| b == 0).unwrap_or(COMMAND_LEN);
        &field[..end]
    }

    /// Command name; empty if the header is incomplete or not UTF-8
    pub fn command(&self) -> &str {
        core::str::from_utf8(self.command_bytes()).unwrap_or("")
    }

    /// Type tag, `None` if unknown or not yet assembled
    pub fn packet_type(&self) -> Option<PacketType> {
        if !self.header_complete() {
            return None;
        }
        PacketType::from_raw(self.header_i32(TYPE_OFFSET))
    }

    pub fn seq(&self) -> u64 {
        self.buf
            .get(SEQ_OFFSET..SEQ_OFFSET + 8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_ne_bytes)
            .unwrap_or(0)
    }

    #[inline]
    pub const fn header_size() -> usize {
        HEADER_SIZE
    }

    /// Bytes assembled so far (header + payload for a finished packet)
    #[inline]
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Size announced by the header: `HEADER_SIZE + payload_size`
    #[inline]
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload_size()
    }

    #[inline]
    pub fn header_complete(&self) -> bool {
        self.buf.len() >= HEADER_SIZE
    }

    /// Header assembled and every announced payload byte present
    pub fn is_complete(&self) -> bool {
        self.header_complete() && self.buf.len() == self.total_size()
    }

    /// Raw wire bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn payload(&self) -> &[u8] {
        self.buf.get(HEADER_SIZE..).unwrap_or(&[])
    }

    /// Check the header of a packet read off the wire.
    pub fn validate_header(&self) -> PacketResult<()> {
        if !self.header_complete() {
            return Err(PacketError::IncompleteHeader);
        }
        let version = self.version();
        if version != PACKET_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let size = self.header_i32(PAYLOAD_SIZE_OFFSET);
        if size < 0 {
            return Err(PacketError::InvalidPayloadSize(size));
        }
        let raw = self.header_i32(TYPE_OFFSET);
        if PacketType::from_raw(raw).is_none() {
            return Err(PacketError::UnknownType(raw));
        }
        Ok(())
    }

    // ── Payload decoding ──

    /// Typed reader over the payload
    pub fn reader(&self) -> PayloadReader<'_> {
        PayloadReader::new(self.payload())
    }

    /// Unpack fields in `format` order. The vector length is the field count.
    pub fn get(&self, format: &str) -> PacketResult<Vec<Value>> {
        let mut reader = self.reader();
        let mut values = Vec::with_capacity(format.len());
        for tag in format.chars() {
            values.push(reader.read_tag(tag)?);
        }
        Ok(values)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.packet_type() {
            Some(ty) => write!(
                f,
                "cmd={} type={:?} seq={} payload={}B",
                self.command(),
                ty,
                self.seq(),
                self.payload_size()
            ),
            None => write!(f, "<partial packet {}B>", self.buf.len()),
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({})", self)
    }
}

/// Incremental packet construction.
///
/// Capacity grows in `PAYLOAD_GROWTH` steps while fields are appended;
/// `finish()` writes the payload size and trims the buffer to its exact size.
pub struct PacketBuilder {
    buf: Vec<u8>,
}

impl PacketBuilder {
    /// Start a `Request`; assigns the next sequence number.
    pub fn request(command: &str) -> PacketResult<Self> {
        Self::with_header(check_command(command)?, PacketType::Request, next_seq())
    }

    /// Start a `RequestNoAck`; assigns the next sequence number.
    pub fn request_noack(command: &str) -> PacketResult<Self> {
        Self::with_header(check_command(command)?, PacketType::RequestNoAck, next_seq())
    }

    /// Start the `Ack` for `original`, reusing its command and sequence.
    pub fn reply(original: &Packet) -> Self {
        let mut buf = Vec::with_capacity(HEADER_SIZE + PAYLOAD_GROWTH);
        write_header(&mut buf, original.command_bytes(), PacketType::Ack, original.seq());
        Self { buf }
    }

    fn with_header(command: &[u8], ty: PacketType, seq: u64) -> PacketResult<Self> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + PAYLOAD_GROWTH);
        write_header(&mut buf, command, ty, seq);
        Ok(Self { buf })
    }

    fn grow(&mut self, extra: usize) {
        let needed = self.buf.len() + extra;
        if needed <= self.buf.capacity() {
            return;
        }
        let payload = needed - HEADER_SIZE;
        let rounded = payload.div_ceil(PAYLOAD_GROWTH) * PAYLOAD_GROWTH;
        self.buf.reserve_exact(HEADER_SIZE + rounded - self.buf.len());
    }

    pub fn int(mut self, v: i32) -> Self {
        self.grow(4);
        self.buf.extend_from_slice(&v.to_ne_bytes());
        self
    }

    pub fn float(mut self, v: f64) -> Self {
        self.grow(8);
        self.buf.extend_from_slice(&v.to_ne_bytes());
        self
    }

    /// Append a NUL-terminated string.
    pub fn string(mut self, v: &str) -> PacketResult<Self> {
        if v.as_bytes().contains(&0) {
            return Err(PacketError::InteriorNul);
        }
        self.grow(v.len() + 1);
        self.buf.extend_from_slice(v.as_bytes());
        self.buf.push(0);
        Ok(self)
    }

    pub fn value(self, v: &Value) -> PacketResult<Self> {
        match v {
            Value::Int(i) => Ok(self.int(*i)),
            Value::Str(s) => self.string(s),
            Value::Float(d) => Ok(self.float(*d)),
        }
    }

    /// Append `args` as described by `format`, one tag per value.
    pub fn pack(mut self, format: &str, args: &[Value]) -> PacketResult<Self> {
        let mut args_iter = args.iter();
        for (pos, tag) in format.chars().enumerate() {
            let kind = FieldKind::from_tag(tag)?;
            let arg = args_iter.next().ok_or(PacketError::FormatMismatch(pos))?;
            self = match (kind, arg) {
                (FieldKind::Int, Value::Int(v)) => self.int(*v),
                (FieldKind::Str, Value::Str(s)) => self.string(s)?,
                (FieldKind::Float, Value::Float(v)) => self.float(*v),
                _ => return Err(PacketError::FormatMismatch(pos)),
            };
        }
        if args_iter.next().is_some() {
            return Err(PacketError::FormatMismatch(format.chars().count()));
        }
        Ok(self)
    }

    /// Fails with `PayloadTooLarge` when the payload does not fit the
    /// 32-bit size field.
    pub fn finish(mut self) -> PacketResult<Packet> {
        let payload = payload_size_field(self.buf.len() - HEADER_SIZE)?;
        self.buf[PAYLOAD_SIZE_OFFSET..PAYLOAD_SIZE_OFFSET + 4]
            .copy_from_slice(&payload.to_ne_bytes());
        self.buf.shrink_to_fit();
        Ok(Packet { buf: self.buf })
    }
}

fn payload_size_field(len: usize) -> PacketResult<i32> {
    i32::try_from(len).map_err(|_| PacketError::PayloadTooLarge(len))
}

fn check_command(command: &str) -> PacketResult<&[u8]> {
    let bytes = command.as_bytes();
    if bytes.len() >= COMMAND_LEN {
        return Err(PacketError::CommandTooLong(bytes.len()));
    }
    if bytes.contains(&0) {
        return Err(PacketError::InvalidCommand);
    }
    Ok(bytes)
}

fn write_header(buf: &mut Vec<u8>, command: &[u8], ty: PacketType, seq: u64) {
    buf.clear();
    buf.resize(HEADER_SIZE, 0);
    buf[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&PACKET_VERSION.to_ne_bytes());
    let cmd_len = command.len().min(COMMAND_LEN - 1);
    buf[COMMAND_OFFSET..COMMAND_OFFSET + cmd_len].copy_from_slice(&command[..cmd_len]);
    buf[TYPE_OFFSET..TYPE_OFFSET + 4].copy_from_slice(&ty.as_raw().to_ne_bytes());
    buf[SEQ_OFFSET..SEQ_OFFSET + 8].copy_from_slice(&seq.to_ne_bytes());
}

/// Sequential reader over packed payload fields.
///
/// There is no schema on the wire: the reader must ask for fields in the
/// order and kinds the sender packed them.
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> PacketResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(PacketError::Truncated)?;
        let bytes = self.data.get(self.pos..end).ok_or(PacketError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_int(&mut self) -> PacketResult<i32> {
        let bytes = self.take(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        Ok(i32::from_ne_bytes(raw))
    }

    pub fn read_float(&mut self) -> PacketResult<f64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_ne_bytes(raw))
    }

    /// Read up to and including the next NUL
    pub fn read_str(&mut self) -> PacketResult<&'a str> {
        let rest = self.data.get(self.pos..).ok_or(PacketError::Truncated)?;
        let nul = rest.iter().position(|&b| b == 0).ok_or(PacketError::Truncated)?;
        let bytes = self.take(nul + 1)?;
        core::str::from_utf8(&bytes[..nul]).map_err(|_| PacketError::InvalidUtf8)
    }

    /// Read one field of the kind named by `tag`
    pub fn read_tag(&mut self, tag: char) -> PacketResult<Value> {
        match FieldKind::from_tag(tag)? {
            FieldKind::Int => self.read_int().map(Value::Int),
            FieldKind::Str => self.read_str().map(|s| Value::Str(s.to_string())),
            FieldKind::Float => self.read_float().map(Value::Float),
        }
    }

    /// Bytes not yet consumed
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}
