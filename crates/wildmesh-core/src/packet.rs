//! Frame envelope and wire primitives
//!
//! Every message on the mesh travels inside one fixed-layout envelope. All
//! multi-byte fields are big-endian.
//!
//! ## Frame Structure
//!
//! ```text
//! ┌─────────┬──────┬────────┬──────────┬──────────┬──────────┬─────┬──────────┬───────────┬─────────┬─────────┬─────────┐
//! │ Version │ Type │ Source │ Last hop │   Dest   │ Sequence │ Hop │ Max hops │ Timestamp │ Pay len │ Payload │ CRC-16  │
//! │   1B    │  1B  │   4B   │    4B    │    4B    │    2B    │ 1B  │    1B    │    4B     │   2B    │  0-nB   │   2B    │
//! └─────────┴──────┴────────┴──────────┴──────────┴──────────┴─────┴──────────┴───────────┴─────────┴─────────┴─────────┘
//! ```
//!
//! `Source` is the originator and never changes in transit. `Last hop` is
//! rewritten by every relay so receivers can learn reverse paths.

use crate::error::CodecError;
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current envelope version
pub const PROTOCOL_VERSION: u8 = 2;

/// Node identifier - 4-byte hardware-derived ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub struct NodeId([u8; 4]);

impl NodeId {
    /// Broadcast address (all 0xFF)
    pub const BROADCAST: NodeId = NodeId([0xFF, 0xFF, 0xFF, 0xFF]);

    /// Unknown/unset address (all 0x00)
    pub const UNKNOWN: NodeId = NodeId([0x00, 0x00, 0x00, 0x00]);

    /// Create a new NodeId from 4 bytes
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        NodeId(bytes)
    }

    /// Create a NodeId from a u32
    pub const fn from_u32(value: u32) -> Self {
        NodeId(value.to_be_bytes())
    }

    /// Convert to u32
    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Check if this is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Check if this is unknown/unset
    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        NodeId::from_u32(value)
    }
}

impl From<NodeId> for u32 {
    fn from(id: NodeId) -> Self {
        id.to_u32()
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    /// Parses hex with or without a `0x` prefix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim_start_matches("0x").trim_start_matches("0X");
        u32::from_str_radix(digits, 16).map(NodeId::from_u32)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:08x})", self.to_u32())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.to_u32())
    }
}

/// Message type tag carried in the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Periodic liveness announcement
    Heartbeat = 0x01,
    /// Neighbor discovery beacon
    DiscoveryBeacon = 0x02,
    /// On-demand route request (flooded)
    RouteRequest = 0x03,
    /// Route reply (unicast along the reverse path)
    RouteReply = 0x04,
    /// Opaque application payload
    Data = 0x05,
    /// Four-timestamp sync request
    TimeSyncRequest = 0x07,
    /// Four-timestamp sync response
    TimeSyncResponse = 0x08,
    /// Reference-node time broadcast
    TimeAnnouncement = 0x09,
    /// Network admission request
    JoinRequest = 0x0A,
    /// Network admission reply
    JoinReply = 0x0B,
    /// Coordinator presence broadcast
    CoordinatorAnnouncement = 0x0C,
}

impl MessageType {
    /// Create from byte value
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(MessageType::Heartbeat),
            0x02 => Some(MessageType::DiscoveryBeacon),
            0x03 => Some(MessageType::RouteRequest),
            0x04 => Some(MessageType::RouteReply),
            0x05 => Some(MessageType::Data),
            0x07 => Some(MessageType::TimeSyncRequest),
            0x08 => Some(MessageType::TimeSyncResponse),
            0x09 => Some(MessageType::TimeAnnouncement),
            0x0A => Some(MessageType::JoinRequest),
            0x0B => Some(MessageType::JoinReply),
            0x0C => Some(MessageType::CoordinatorAnnouncement),
            _ => None,
        }
    }

    /// Types whose payload carries clock readings
    pub fn is_time_sync(self) -> bool {
        matches!(
            self,
            MessageType::TimeSyncRequest
                | MessageType::TimeSyncResponse
                | MessageType::TimeAnnouncement
        )
    }

    /// Wire tag
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Short lowercase name used in logs and diagnostics
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Heartbeat => "heartbeat",
            MessageType::DiscoveryBeacon => "discovery_beacon",
            MessageType::RouteRequest => "route_request",
            MessageType::RouteReply => "route_reply",
            MessageType::Data => "data",
            MessageType::TimeSyncRequest => "time_sync_request",
            MessageType::TimeSyncResponse => "time_sync_response",
            MessageType::TimeAnnouncement => "time_announcement",
            MessageType::JoinRequest => "join_request",
            MessageType::JoinReply => "join_reply",
            MessageType::CoordinatorAnnouncement => "coordinator_announcement",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded frame: routing fields plus an undecoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message type tag
    pub message_type: MessageType,
    /// Originating node
    pub source: NodeId,
    /// Node that put this frame on the air
    pub last_hop: NodeId,
    /// Final destination (BROADCAST for everyone)
    pub destination: NodeId,
    /// Per-originator sequence number
    pub sequence: u16,
    /// Hops travelled so far (0 when heard straight from the source)
    pub hop_count: u8,
    /// Hop limit for this frame
    pub max_hops: u8,
    /// Sender's clock at transmission (milliseconds, low 32 bits)
    pub timestamp: u32,
    /// Type-specific payload
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Fixed header size in bytes
    pub const HEADER_SIZE: usize = 24;

    /// Trailing checksum size in bytes
    pub const CRC_SIZE: usize = 2;

    /// Smallest possible frame (empty payload)
    pub const MIN_FRAME_SIZE: usize = Self::HEADER_SIZE + Self::CRC_SIZE;

    /// Check if this frame is addressed to everyone
    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }

    /// Check if this frame came straight from its originator
    pub fn is_direct(&self) -> bool {
        self.hop_count == 0
    }

    /// Total encoded size
    pub fn encoded_len(&self) -> usize {
        Self::MIN_FRAME_SIZE + self.payload.len()
    }

    /// Serialize to a checksummed frame
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        if self.payload.len() > u16::MAX as usize {
            return Err(CodecError::PayloadTooLarge(self.payload.len()));
        }
        let mut w = WireWriter::with_capacity(self.encoded_len());
        w.u8(PROTOCOL_VERSION);
        w.u8(self.message_type.as_byte());
        w.node(self.source);
        w.node(self.last_hop);
        w.node(self.destination);
        w.u16(self.sequence);
        w.u8(self.hop_count);
        w.u8(self.max_hops);
        w.u32(self.timestamp);
        w.u16(self.payload.len() as u16);
        w.bytes(&self.payload);
        let mut frame = w.into_inner();
        let crc = crc16_ccitt(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
        Ok(frame)
    }

    /// Parse and integrity-check a received frame
    pub fn from_bytes(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() < Self::MIN_FRAME_SIZE {
            return Err(CodecError::FrameTooShort(frame.len()));
        }

        let (body, trailer) = frame.split_at(frame.len() - Self::CRC_SIZE);
        let expected = BigEndian::read_u16(trailer);
        let actual = crc16_ccitt(body);
        if expected != actual {
            return Err(CodecError::ChecksumMismatch { expected, actual });
        }

        let mut r = WireReader::new(body);
        let version = r.u8()?;
        if version != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let tag = r.u8()?;
        let message_type = MessageType::from_byte(tag).ok_or(CodecError::UnknownMessageType(tag))?;
        let source = r.node()?;
        let last_hop = r.node()?;
        let destination = r.node()?;
        let sequence = r.u16()?;
        let hop_count = r.u8()?;
        let max_hops = r.u8()?;
        let timestamp = r.u32()?;
        let declared = r.u16()? as usize;
        if declared != r.remaining() {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: r.remaining(),
            });
        }
        let payload = r.take(declared)?.to_vec();

        Ok(Self {
            message_type,
            source,
            last_hop,
            destination,
            sequence,
            hop_count,
            max_hops,
            timestamp,
            payload,
        })
    }
}

/// Append-only big-endian writer
#[derive(Debug, Default)]
pub(crate) struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub(crate) fn u16(&mut self, value: u16) {
        let mut b = [0u8; 2];
        BigEndian::write_u16(&mut b, value);
        self.buf.extend_from_slice(&b);
    }

    pub(crate) fn u32(&mut self, value: u32) {
        let mut b = [0u8; 4];
        BigEndian::write_u32(&mut b, value);
        self.buf.extend_from_slice(&b);
    }

    pub(crate) fn u64(&mut self, value: u64) {
        let mut b = [0u8; 8];
        BigEndian::write_u64(&mut b, value);
        self.buf.extend_from_slice(&b);
    }

    pub(crate) fn node(&mut self, id: NodeId) {
        self.buf.extend_from_slice(id.as_bytes());
    }

    pub(crate) fn bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked big-endian reader
#[derive(Debug)]
pub(crate) struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub(crate) fn node(&mut self) -> Result<NodeId, CodecError> {
        let b = self.take(4)?;
        Ok(NodeId::from_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Fail if any bytes are left over
    pub(crate) fn finish(self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF)
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> Envelope {
        Envelope {
            message_type: MessageType::Data,
            source: NodeId::from_u32(0x0000_0001),
            last_hop: NodeId::from_u32(0x0000_0002),
            destination: NodeId::from_u32(0x0000_0003),
            sequence: 0x1234,
            hop_count: 1,
            max_hops: 8,
            timestamp: 0xDEAD_BEEF,
            payload: b"hello".to_vec(),
        }
    }

    #[test]
    fn test_node_id() {
        let id = NodeId::from_bytes([0x12, 0x34, 0x56, 0x78]);
        assert_eq!(id.to_u32(), 0x12345678);
        assert!(!id.is_broadcast());
        assert!(NodeId::BROADCAST.is_broadcast());
        assert!(NodeId::UNKNOWN.is_unknown());
        assert_eq!(id.to_string(), "12345678");
    }

    #[test]
    fn test_node_id_ordering_matches_numeric() {
        assert!(NodeId::from_u32(0x0100) > NodeId::from_u32(0x00FF));
        assert!(NodeId::from_u32(2) > NodeId::from_u32(1));
    }

    #[test]
    fn test_node_id_parse() {
        assert_eq!("0xa1b2c3d4".parse::<NodeId>().unwrap().to_u32(), 0xa1b2c3d4);
        assert_eq!("1000".parse::<NodeId>().unwrap().to_u32(), 0x1000);
        assert!("zz".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_node_id_serde_as_integer() {
        let json = serde_json::to_string(&NodeId::from_u32(42)).unwrap();
        assert_eq!(json, "42");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, NodeId::from_u32(42));
    }

    #[test]
    fn test_envelope_layout() {
        let env = sample_envelope();
        let bytes = env.to_bytes().unwrap();
        assert_eq!(bytes.len(), Envelope::MIN_FRAME_SIZE + 5);
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], MessageType::Data.as_byte());
        assert_eq!(&bytes[2..6], &[0, 0, 0, 1]);

        let decoded = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_envelope_rejects_corruption() {
        let mut bytes = sample_envelope().to_bytes().unwrap();
        bytes[10] ^= 0x40;
        assert!(matches!(
            Envelope::from_bytes(&bytes),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_envelope_rejects_short_frame() {
        assert!(matches!(
            Envelope::from_bytes(&[0u8; 10]),
            Err(CodecError::FrameTooShort(10))
        ));
    }

    #[test]
    fn test_envelope_rejects_unknown_type() {
        let mut bytes = sample_envelope().to_bytes().unwrap();
        bytes[1] = 0x7F;
        let body_len = bytes.len() - 2;
        let crc = crc16_ccitt(&bytes[..body_len]);
        bytes[body_len..].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            Envelope::from_bytes(&bytes),
            Err(CodecError::UnknownMessageType(0x7F))
        ));
    }

    #[test]
    fn test_wire_reader_trailing_bytes() {
        let data = [1u8, 2, 3];
        let mut r = WireReader::new(&data);
        assert_eq!(r.u8().unwrap(), 1);
        assert!(matches!(r.finish(), Err(CodecError::TrailingBytes(2))));
    }

    #[test]
    fn test_crc16() {
        let data = b"123456789";
        let crc = crc16_ccitt(data);
        assert_eq!(crc, 0x29B1); // Known CRC-16-CCITT result
    }
}
