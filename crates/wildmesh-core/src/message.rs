//! Typed message payloads
//!
//! One canonical binary schema per [`MessageType`]. Payloads are decoded
//! strictly: short reads, trailing bytes and out-of-range fields are all
//! rejected before a manager ever sees the message.
//!
//! ```text
//! NodeStatus      caps(1) battery(1) signal(1) uptime_s(4) flags(1) coordinator(4)
//! Beacon          NodeStatus count(1) [node(4) quality(1)]*
//! Heartbeat       NodeStatus neighbor_count(1)
//! JoinRequest     NodeStatus
//! JoinReply       accepted(1) reason(1) coordinator(4) hb_ms(4) disc_ms(4) members(1) count(1) [node(4)]*
//! CoordAnnounce   members(1) battery(1)
//! RouteRequest    target(4) path_quality(1)
//! RouteReply      target(4) target_hops(1) path_quality(1)
//! TimeSyncReq     origin(8) stratum(1)
//! TimeSyncResp    origin(8) receive(8) transmit(8) stratum(1) accuracy(1)
//! TimeAnnounce    stratum(1) accuracy(1) network_time(8) send_time(8)
//! Data            opaque
//! ```

use crate::error::CodecError;
use crate::packet::{MessageType, NodeId, WireReader, WireWriter};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest stratum a reference may declare
pub const MAX_STRATUM: u8 = 15;

/// Largest timestamp accepted on the wire, ms (about 285 000 years)
pub const MAX_TIME_MS: u64 = 1 << 53;

/// Most neighbor entries carried in one beacon
pub const MAX_BEACON_NEIGHBORS: usize = 16;

/// Most neighbor ids carried in one join reply
pub const MAX_REPLY_NEIGHBORS: usize = 16;

/// Node capability bitmask
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(u8);

impl Capabilities {
    /// No capabilities
    pub const NONE: Capabilities = Capabilities(0x00);
    /// Mesh participation
    pub const BASIC: Capabilities = Capabilities(0x01);
    /// Image capture
    pub const IMAGE_CAPTURE: Capabilities = Capabilities(0x02);
    /// Environmental sensors
    pub const SENSORS: Capabilities = Capabilities(0x04);
    /// On-device classification
    pub const CLASSIFICATION: Capabilities = Capabilities(0x08);
    /// Uplink gateway
    pub const GATEWAY: Capabilities = Capabilities(0x10);
    /// Mains or large-battery powered
    pub const HIGH_POWER: Capabilities = Capabilities(0x20);

    /// Create from raw bits
    pub fn from_bits(bits: u8) -> Self {
        Capabilities(bits)
    }

    /// Raw bits
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Check whether every bit in `other` is set
    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits in `other`
    pub fn insert(&mut self, other: Capabilities) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capabilities({:#04x})", self.0)
    }
}

/// Status block shared by beacons, heartbeats and join requests
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    pub capabilities: Capabilities,
    /// Battery level, percent
    pub battery_level: u8,
    /// Sender's average link quality (0.0 - 1.0)
    pub signal_quality: f32,
    pub uptime_secs: u32,
    /// Sender is a member of a network
    pub joined: bool,
    /// Sender is itself a coordinator
    pub is_coordinator: bool,
    /// Sender's coordinator (UNKNOWN when unjoined)
    pub coordinator: NodeId,
}

impl NodeStatus {
    const FLAG_JOINED: u8 = 0x01;
    const FLAG_COORDINATOR: u8 = 0x02;

    fn write(&self, w: &mut WireWriter) {
        w.u8(self.capabilities.bits());
        w.u8(self.battery_level);
        w.u8(quality_to_wire(self.signal_quality));
        w.u32(self.uptime_secs);
        let mut flags = 0;
        if self.joined {
            flags |= Self::FLAG_JOINED;
        }
        if self.is_coordinator {
            flags |= Self::FLAG_COORDINATOR;
        }
        w.u8(flags);
        w.node(self.coordinator);
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let capabilities = Capabilities::from_bits(r.u8()?);
        let battery_level = percent(r.u8()?, "battery_level")?;
        let signal_quality = quality_from_wire(r.u8()?)?;
        let uptime_secs = r.u32()?;
        let flags = r.u8()?;
        let coordinator = r.node()?;
        Ok(Self {
            capabilities,
            battery_level,
            signal_quality,
            uptime_secs,
            joined: flags & Self::FLAG_JOINED != 0,
            is_coordinator: flags & Self::FLAG_COORDINATOR != 0,
            coordinator,
        })
    }
}

/// One entry of a beacon's neighbor list
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborLink {
    pub node: NodeId,
    /// Link quality as measured by the beacon sender (0.0 - 1.0)
    pub quality: f32,
}

/// Neighbor discovery beacon
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryBeacon {
    pub status: NodeStatus,
    pub neighbors: Vec<NeighborLink>,
}

/// Liveness heartbeat
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub status: NodeStatus,
    pub neighbor_count: u8,
}

/// Network admission request
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    pub status: NodeStatus,
}

/// Why a coordinator refused admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Node table at capacity
    NetworkFull,
    /// Recipient is not a coordinator
    NotCoordinator,
}

impl RejectReason {
    fn to_wire(reason: Option<RejectReason>) -> u8 {
        match reason {
            None => 0,
            Some(RejectReason::NetworkFull) => 1,
            Some(RejectReason::NotCoordinator) => 2,
        }
    }

    fn from_wire(byte: u8) -> Result<Option<RejectReason>, CodecError> {
        match byte {
            0 => Ok(None),
            1 => Ok(Some(RejectReason::NetworkFull)),
            2 => Ok(Some(RejectReason::NotCoordinator)),
            other => Err(CodecError::OutOfRange {
                field: "reject_reason",
                value: other as u64,
            }),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NetworkFull => f.write_str("network full"),
            RejectReason::NotCoordinator => f.write_str("not a coordinator"),
        }
    }
}

/// Network admission reply
#[derive(Debug, Clone, PartialEq)]
pub struct JoinReply {
    pub accepted: bool,
    pub reason: Option<RejectReason>,
    pub coordinator: NodeId,
    pub heartbeat_interval_ms: u32,
    pub discovery_interval_ms: u32,
    pub member_count: u8,
    /// Coordinator's known nodes, excluding the requester
    pub neighbors: Vec<NodeId>,
}

/// Coordinator presence broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorAnnouncement {
    pub member_count: u8,
    pub battery_level: u8,
}

/// Flooded route request; originator and request id come from the envelope
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    pub target: NodeId,
    /// Product of link qualities along the path so far
    pub path_quality: f32,
}

/// Route reply, unicast back along the reverse path
#[derive(Debug, Clone, PartialEq)]
pub struct RouteReply {
    pub target: NodeId,
    /// Hops from the replier to the target (0 when the replier is the target)
    pub target_hops: u8,
    pub path_quality: f32,
}

/// Follower's timestamped sync request (T1)
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSyncRequest {
    pub origin_time: u64,
    pub stratum: u8,
}

/// Reference node's four-timestamp response
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSyncResponse {
    /// T1, echoed from the request (requester clock)
    pub origin_time: u64,
    /// T2, request arrival (responder network time)
    pub receive_time: u64,
    /// T3, response departure (responder network time)
    pub transmit_time: u64,
    pub stratum: u8,
    /// Declared accuracy, percent
    pub accuracy: u8,
}

/// Reference node's time broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct TimeAnnouncement {
    pub stratum: u8,
    pub accuracy: u8,
    /// Announcer's network time estimate at send
    pub network_time: u64,
    /// Announcer's local clock at send
    pub send_time: u64,
}

/// A decoded payload
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Heartbeat(Heartbeat),
    DiscoveryBeacon(DiscoveryBeacon),
    RouteRequest(RouteRequest),
    RouteReply(RouteReply),
    Data(Vec<u8>),
    TimeSyncRequest(TimeSyncRequest),
    TimeSyncResponse(TimeSyncResponse),
    TimeAnnouncement(TimeAnnouncement),
    JoinRequest(JoinRequest),
    JoinReply(JoinReply),
    CoordinatorAnnouncement(CoordinatorAnnouncement),
}

impl Message {
    /// Envelope tag for this payload
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Heartbeat(_) => MessageType::Heartbeat,
            Message::DiscoveryBeacon(_) => MessageType::DiscoveryBeacon,
            Message::RouteRequest(_) => MessageType::RouteRequest,
            Message::RouteReply(_) => MessageType::RouteReply,
            Message::Data(_) => MessageType::Data,
            Message::TimeSyncRequest(_) => MessageType::TimeSyncRequest,
            Message::TimeSyncResponse(_) => MessageType::TimeSyncResponse,
            Message::TimeAnnouncement(_) => MessageType::TimeAnnouncement,
            Message::JoinRequest(_) => MessageType::JoinRequest,
            Message::JoinReply(_) => MessageType::JoinReply,
            Message::CoordinatorAnnouncement(_) => MessageType::CoordinatorAnnouncement,
        }
    }

    /// Serialize the payload
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        match self {
            Message::Heartbeat(hb) => {
                hb.status.write(&mut w);
                w.u8(hb.neighbor_count);
            }
            Message::DiscoveryBeacon(beacon) => {
                beacon.status.write(&mut w);
                let count = beacon.neighbors.len().min(MAX_BEACON_NEIGHBORS);
                w.u8(count as u8);
                for link in beacon.neighbors.iter().take(count) {
                    w.node(link.node);
                    w.u8(quality_to_wire(link.quality));
                }
            }
            Message::RouteRequest(req) => {
                w.node(req.target);
                w.u8(quality_to_wire(req.path_quality));
            }
            Message::RouteReply(rep) => {
                w.node(rep.target);
                w.u8(rep.target_hops);
                w.u8(quality_to_wire(rep.path_quality));
            }
            Message::Data(bytes) => w.bytes(bytes),
            Message::TimeSyncRequest(req) => {
                w.u64(req.origin_time);
                w.u8(req.stratum);
            }
            Message::TimeSyncResponse(resp) => {
                w.u64(resp.origin_time);
                w.u64(resp.receive_time);
                w.u64(resp.transmit_time);
                w.u8(resp.stratum);
                w.u8(resp.accuracy);
            }
            Message::TimeAnnouncement(ann) => {
                w.u8(ann.stratum);
                w.u8(ann.accuracy);
                w.u64(ann.network_time);
                w.u64(ann.send_time);
            }
            Message::JoinRequest(req) => req.status.write(&mut w),
            Message::JoinReply(rep) => {
                w.u8(rep.accepted as u8);
                w.u8(RejectReason::to_wire(rep.reason));
                w.node(rep.coordinator);
                w.u32(rep.heartbeat_interval_ms);
                w.u32(rep.discovery_interval_ms);
                w.u8(rep.member_count);
                let count = rep.neighbors.len().min(MAX_REPLY_NEIGHBORS);
                w.u8(count as u8);
                for id in rep.neighbors.iter().take(count) {
                    w.node(*id);
                }
            }
            Message::CoordinatorAnnouncement(ann) => {
                w.u8(ann.member_count);
                w.u8(ann.battery_level);
            }
        }
        w.into_inner()
    }

    /// Decode and range-check a payload of the given type
    pub fn decode(message_type: MessageType, payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = WireReader::new(payload);
        let message = match message_type {
            MessageType::Heartbeat => Message::Heartbeat(Heartbeat {
                status: NodeStatus::read(&mut r)?,
                neighbor_count: r.u8()?,
            }),
            MessageType::DiscoveryBeacon => {
                let status = NodeStatus::read(&mut r)?;
                let count = r.u8()? as usize;
                if count > MAX_BEACON_NEIGHBORS {
                    return Err(CodecError::OutOfRange {
                        field: "beacon_neighbors",
                        value: count as u64,
                    });
                }
                let mut neighbors = Vec::with_capacity(count);
                for _ in 0..count {
                    neighbors.push(NeighborLink {
                        node: r.node()?,
                        quality: quality_from_wire(r.u8()?)?,
                    });
                }
                Message::DiscoveryBeacon(DiscoveryBeacon { status, neighbors })
            }
            MessageType::RouteRequest => Message::RouteRequest(RouteRequest {
                target: r.node()?,
                path_quality: quality_from_wire(r.u8()?)?,
            }),
            MessageType::RouteReply => Message::RouteReply(RouteReply {
                target: r.node()?,
                target_hops: r.u8()?,
                path_quality: quality_from_wire(r.u8()?)?,
            }),
            MessageType::Data => {
                let bytes = r.take(r.remaining())?.to_vec();
                Message::Data(bytes)
            }
            MessageType::TimeSyncRequest => Message::TimeSyncRequest(TimeSyncRequest {
                origin_time: timestamp(r.u64()?, "origin_time")?,
                stratum: request_stratum(r.u8()?)?,
            }),
            MessageType::TimeSyncResponse => Message::TimeSyncResponse(TimeSyncResponse {
                origin_time: timestamp(r.u64()?, "origin_time")?,
                receive_time: timestamp(r.u64()?, "receive_time")?,
                transmit_time: timestamp(r.u64()?, "transmit_time")?,
                stratum: reference_stratum(r.u8()?)?,
                accuracy: percent(r.u8()?, "accuracy")?,
            }),
            MessageType::TimeAnnouncement => Message::TimeAnnouncement(TimeAnnouncement {
                stratum: reference_stratum(r.u8()?)?,
                accuracy: percent(r.u8()?, "accuracy")?,
                network_time: timestamp(r.u64()?, "network_time")?,
                send_time: timestamp(r.u64()?, "send_time")?,
            }),
            MessageType::JoinRequest => Message::JoinRequest(JoinRequest {
                status: NodeStatus::read(&mut r)?,
            }),
            MessageType::JoinReply => {
                let accepted = r.u8()? != 0;
                let reason = RejectReason::from_wire(r.u8()?)?;
                let coordinator = r.node()?;
                let heartbeat_interval_ms = r.u32()?;
                let discovery_interval_ms = r.u32()?;
                let member_count = r.u8()?;
                let count = r.u8()? as usize;
                if count > MAX_REPLY_NEIGHBORS {
                    return Err(CodecError::OutOfRange {
                        field: "reply_neighbors",
                        value: count as u64,
                    });
                }
                let mut neighbors = Vec::with_capacity(count);
                for _ in 0..count {
                    neighbors.push(r.node()?);
                }
                Message::JoinReply(JoinReply {
                    accepted,
                    reason,
                    coordinator,
                    heartbeat_interval_ms,
                    discovery_interval_ms,
                    member_count,
                    neighbors,
                })
            }
            MessageType::CoordinatorAnnouncement => {
                Message::CoordinatorAnnouncement(CoordinatorAnnouncement {
                    member_count: r.u8()?,
                    battery_level: percent(r.u8()?, "battery_level")?,
                })
            }
        };
        r.finish()?;
        Ok(message)
    }
}

/// Envelope fields carried over when relaying someone else's frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayInfo {
    pub source: NodeId,
    pub sequence: u16,
    /// Hop count the relayed frame will carry
    pub hop_count: u8,
    pub max_hops: u8,
}

/// A message queued by a manager for the dispatcher to frame and send
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub message: Message,
    /// Link-layer recipient; `None` broadcasts
    pub next_hop: Option<NodeId>,
    /// Final destination written into the envelope
    pub destination: NodeId,
    /// Set when relaying; the dispatcher then keeps the original source
    pub relay: Option<RelayInfo>,
}

impl Outbound {
    /// Originate a broadcast
    pub fn broadcast(message: Message) -> Self {
        Self {
            message,
            next_hop: None,
            destination: NodeId::BROADCAST,
            relay: None,
        }
    }

    /// Originate a frame for a direct neighbor
    pub fn unicast(dest: NodeId, message: Message) -> Self {
        Self {
            message,
            next_hop: Some(dest),
            destination: dest,
            relay: None,
        }
    }

    /// Originate a frame for `dest` through `next_hop`
    pub fn routed(dest: NodeId, next_hop: NodeId, message: Message) -> Self {
        Self {
            message,
            next_hop: Some(next_hop),
            destination: dest,
            relay: None,
        }
    }

    /// Pass on a received frame one hop further, broadcast when `next_hop` is `None`
    pub fn relay(received: &crate::packet::Envelope, next_hop: Option<NodeId>, message: Message) -> Self {
        Self {
            message,
            next_hop,
            destination: received.destination,
            relay: Some(RelayInfo {
                source: received.source,
                sequence: received.sequence,
                hop_count: received.hop_count.saturating_add(1),
                max_hops: received.max_hops,
            }),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.next_hop.is_none()
    }
}

/// Map a 0.0 - 1.0 quality onto a percent byte
pub(crate) fn quality_to_wire(quality: f32) -> u8 {
    (quality.clamp(0.0, 1.0) * 100.0).round() as u8
}

fn quality_from_wire(byte: u8) -> Result<f32, CodecError> {
    Ok(percent(byte, "quality")? as f32 / 100.0)
}

fn percent(byte: u8, field: &'static str) -> Result<u8, CodecError> {
    if byte > 100 {
        return Err(CodecError::OutOfRange {
            field,
            value: byte as u64,
        });
    }
    Ok(byte)
}

fn timestamp(value: u64, field: &'static str) -> Result<u64, CodecError> {
    if value > MAX_TIME_MS {
        return Err(CodecError::OutOfRange { field, value });
    }
    Ok(value)
}

/// References must declare 1..=MAX_STRATUM
fn reference_stratum(byte: u8) -> Result<u8, CodecError> {
    if byte == 0 || byte > MAX_STRATUM {
        return Err(CodecError::OutOfRange {
            field: "stratum",
            value: byte as u64,
        });
    }
    Ok(byte)
}

/// Requesters may be unsynchronized (MAX_STRATUM + 1)
fn request_stratum(byte: u8) -> Result<u8, CodecError> {
    if byte == 0 || byte > MAX_STRATUM + 1 {
        return Err(CodecError::OutOfRange {
            field: "stratum",
            value: byte as u64,
        });
    }
    Ok(byte)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> NodeStatus {
        NodeStatus {
            capabilities: Capabilities::BASIC | Capabilities::SENSORS,
            battery_level: 87,
            signal_quality: 0.75,
            uptime_secs: 3600,
            joined: true,
            is_coordinator: false,
            coordinator: NodeId::from_u32(0x50),
        }
    }

    #[test]
    fn test_capabilities() {
        let mut caps = Capabilities::BASIC;
        assert!(caps.contains(Capabilities::BASIC));
        assert!(!caps.contains(Capabilities::GATEWAY));
        caps.insert(Capabilities::GATEWAY);
        assert!(caps.contains(Capabilities::GATEWAY | Capabilities::BASIC));
        assert_eq!(caps.bits(), 0x11);
    }

    #[test]
    fn test_beacon_schema() {
        let beacon = Message::DiscoveryBeacon(DiscoveryBeacon {
            status: status(),
            neighbors: vec![
                NeighborLink {
                    node: NodeId::from_u32(2),
                    quality: 0.9,
                },
                NeighborLink {
                    node: NodeId::from_u32(3),
                    quality: 0.42,
                },
            ],
        });
        let bytes = beacon.encode();
        // status(12) + count(1) + 2 * 5
        assert_eq!(bytes.len(), 23);
        let decoded = Message::decode(MessageType::DiscoveryBeacon, &bytes).unwrap();
        assert_eq!(decoded, beacon);
    }

    #[test]
    fn test_beacon_neighbor_list_is_capped() {
        let neighbors = (0..40)
            .map(|i| NeighborLink {
                node: NodeId::from_u32(i),
                quality: 0.5,
            })
            .collect();
        let bytes = Message::DiscoveryBeacon(DiscoveryBeacon {
            status: status(),
            neighbors,
        })
        .encode();
        match Message::decode(MessageType::DiscoveryBeacon, &bytes).unwrap() {
            Message::DiscoveryBeacon(b) => assert_eq!(b.neighbors.len(), MAX_BEACON_NEIGHBORS),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_join_reply_rejection() {
        let reply = Message::JoinReply(JoinReply {
            accepted: false,
            reason: Some(RejectReason::NetworkFull),
            coordinator: NodeId::from_u32(9),
            heartbeat_interval_ms: 0,
            discovery_interval_ms: 0,
            member_count: 50,
            neighbors: Vec::new(),
        });
        let decoded = Message::decode(MessageType::JoinReply, &reply.encode()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_stratum_bounds() {
        let mut ann = Message::TimeAnnouncement(TimeAnnouncement {
            stratum: 0,
            accuracy: 95,
            network_time: 1,
            send_time: 1,
        })
        .encode();
        assert!(matches!(
            Message::decode(MessageType::TimeAnnouncement, &ann),
            Err(CodecError::OutOfRange { field: "stratum", .. })
        ));

        ann[0] = MAX_STRATUM + 1;
        assert!(Message::decode(MessageType::TimeAnnouncement, &ann).is_err());

        ann[0] = 3;
        assert!(Message::decode(MessageType::TimeAnnouncement, &ann).is_ok());
    }

    #[test]
    fn test_accuracy_bounds() {
        let bytes = Message::TimeSyncResponse(TimeSyncResponse {
            origin_time: 1000,
            receive_time: 1050,
            transmit_time: 1060,
            stratum: 1,
            accuracy: 101,
        })
        .encode();
        assert!(matches!(
            Message::decode(MessageType::TimeSyncResponse, &bytes),
            Err(CodecError::OutOfRange { field: "accuracy", .. })
        ));
    }

    #[test]
    fn test_timestamp_bounds() {
        let ann = Message::TimeAnnouncement(TimeAnnouncement {
            stratum: 1,
            accuracy: 95,
            network_time: 1 << 63,
            send_time: 1,
        })
        .encode();
        assert!(matches!(
            Message::decode(MessageType::TimeAnnouncement, &ann),
            Err(CodecError::OutOfRange { field: "network_time", .. })
        ));

        let resp = Message::TimeSyncResponse(TimeSyncResponse {
            origin_time: 1000,
            receive_time: u64::MAX,
            transmit_time: 1060,
            stratum: 1,
            accuracy: 90,
        })
        .encode();
        assert!(matches!(
            Message::decode(MessageType::TimeSyncResponse, &resp),
            Err(CodecError::OutOfRange { field: "receive_time", .. })
        ));

        let edge = Message::TimeSyncRequest(TimeSyncRequest {
            origin_time: MAX_TIME_MS,
            stratum: 2,
        })
        .encode();
        assert!(Message::decode(MessageType::TimeSyncRequest, &edge).is_ok());
    }

    #[test]
    fn test_unsynchronized_requester_stratum_allowed() {
        let bytes = Message::TimeSyncRequest(TimeSyncRequest {
            origin_time: 5,
            stratum: MAX_STRATUM + 1,
        })
        .encode();
        assert!(Message::decode(MessageType::TimeSyncRequest, &bytes).is_ok());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Message::CoordinatorAnnouncement(CoordinatorAnnouncement {
            member_count: 3,
            battery_level: 50,
        })
        .encode();
        bytes.push(0);
        assert!(matches!(
            Message::decode(MessageType::CoordinatorAnnouncement, &bytes),
            Err(CodecError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let bytes = Message::Heartbeat(Heartbeat {
            status: status(),
            neighbor_count: 4,
        })
        .encode();
        assert!(matches!(
            Message::decode(MessageType::Heartbeat, &bytes[..5]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_data_is_opaque() {
        let decoded = Message::decode(MessageType::Data, &[0xFF, 0x00, 0x7F]).unwrap();
        assert_eq!(decoded, Message::Data(vec![0xFF, 0x00, 0x7F]));
    }
}
