//! Protocol Dispatcher
//!
//! `MeshNode` owns one instance of each manager and wires them to a
//! [`Transport`] and a [`Clock`]:
//!
//! ```text
//!            ┌──────────────────────── MeshNode ────────────────────────┐
//!  frames ──►│ validate ─► dispatch ─► RouteManager / DiscoveryManager   │
//!            │                        / TimeSynchronizer                 │
//!            │                              │ outboxes                   │
//!            │ events ◄─ EventQueue         ▼                            │
//!  radio  ◄──│────────── MacLayer ◄── frame (envelope + payload)         │
//!            └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on [`MeshNode::tick`]: drain received frames, run each
//! manager's periodic tasks, frame queued messages, and give the MAC one
//! transmit opportunity.

use crate::config::MeshConfig;
use crate::discovery::{DiscoveryManager, DiscoveryStats, NodeInfo};
use crate::error::{CodecError, MeshError, MeshResult};
use crate::events::{EventQueue, MeshEvent};
use crate::mac::{MacLayer, TransmitDecision};
use crate::message::{Message, Outbound};
use crate::packet::{Envelope, MessageType, NodeId};
use crate::routing::{
    relayed_path_reliability, DropReason, DuplicateCache, ForwardDecision, RouteManager,
    RoutingStats,
};
use crate::sync::{SyncStats, TimeSynchronizer};
use crate::traits::{Clock, MeshStats, ReceivedFrame, Transport};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Payloads held while a route discovery runs
const MAX_AWAITING_ROUTE: usize = 8;

/// An application payload delivered to this node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveredPayload {
    pub source: NodeId,
    /// Local id, or BROADCAST
    pub destination: NodeId,
    pub hop_count: u8,
    pub data: Vec<u8>,
    pub received_at: u64,
}

#[derive(Debug, Clone)]
struct AwaitingRoute {
    dest: NodeId,
    data: Vec<u8>,
    since: u64,
}

/// Everything a diagnostics collaborator might print
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node_id: NodeId,
    pub coordinator: NodeId,
    pub network_time: u64,
    pub mesh: MeshStats,
    pub routing: RoutingStats,
    pub discovery: DiscoveryStats,
    pub sync: SyncStats,
}

/// One mesh node: managers, MAC and dispatcher
pub struct MeshNode<T: Transport, C: Clock> {
    config: MeshConfig,
    local: NodeId,
    transport: T,
    clock: C,
    routes: RouteManager,
    discovery: DiscoveryManager,
    sync: TimeSynchronizer,
    mac: MacLayer,
    flood_cache: DuplicateCache,
    events: EventQueue,
    inbox: VecDeque<DeliveredPayload>,
    awaiting_route: VecDeque<AwaitingRoute>,
    next_sequence: u16,
    stats: MeshStats,
}

impl<T: Transport, C: Clock> MeshNode<T, C> {
    /// Build a node from a validated configuration
    pub fn new(config: MeshConfig, transport: T, clock: C) -> MeshResult<Self> {
        config.validate()?;
        let local = config.node_id;
        Ok(Self {
            local,
            transport,
            clock,
            routes: RouteManager::new(local, config.routing.clone()),
            discovery: DiscoveryManager::new(
                local,
                config.capabilities,
                config.discovery.clone(),
            ),
            sync: TimeSynchronizer::new(local, config.sync.clone()),
            mac: MacLayer::new(config.mac.clone(), local.to_u32() as u64),
            flood_cache: DuplicateCache::new(config.dedup_ttl_ms, config.dedup_capacity),
            events: EventQueue::new(config.event_queue_capacity),
            inbox: VecDeque::new(),
            awaiting_route: VecDeque::new(),
            next_sequence: 1,
            stats: MeshStats::default(),
            config,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.local
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn routes(&self) -> &RouteManager {
        &self.routes
    }

    pub fn discovery(&self) -> &DiscoveryManager {
        &self.discovery
    }

    pub fn time_sync(&self) -> &TimeSynchronizer {
        &self.sync
    }

    /// Battery level advertised in beacons (from the power subsystem)
    pub fn set_battery_level(&mut self, percent: u8) {
        self.discovery.set_battery_level(percent);
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Run one cooperative scheduler step. Returns frames received.
    pub fn tick(&mut self) -> usize {
        let now = self.clock.now_ms();

        let mut received = 0;
        while let Some(frame) = self.transport.poll_receive() {
            self.handle_frame(frame, now);
            received += 1;
        }

        let source = self.discovery.is_coordinator() && self.config.sync.coordinator_is_time_source;
        self.sync.set_time_source(source, now);

        self.routes.perform_periodic_tasks(now);
        self.discovery.perform_periodic_tasks(&mut self.routes, now);
        let coordinator = Some(self.discovery.coordinator_id()).filter(|c| !c.is_unknown());
        self.sync.perform_periodic_tasks(coordinator, now);
        self.flood_cache.cleanup(now);
        self.retry_awaiting_route(now);

        self.collect(now);
        self.transmit_once(now);
        received
    }

    /// Validate one frame and hand it to the matching manager
    pub fn handle_frame(&mut self, frame: ReceivedFrame, now: u64) {
        self.stats.frames_rx += 1;
        self.stats.bytes_rx += frame.bytes.len() as u64;
        self.mac.rx_observed(frame.bytes.len(), now);

        let env = match Envelope::from_bytes(&frame.bytes) {
            Ok(env) => env,
            Err(e) => {
                trace!(local = %self.local, error = %e, "dropping malformed frame");
                self.stats.dropped_malformed += 1;
                return;
            }
        };
        if env.source == self.local || env.last_hop == self.local {
            self.stats.dropped_self_echo += 1;
            return;
        }
        if env.hop_count > env.max_hops || env.max_hops > crate::config::MAX_HOP_COUNT {
            trace!(local = %self.local, source = %env.source, hops = env.hop_count, "hop fields out of range");
            self.stats.dropped_out_of_range += 1;
            return;
        }
        let message = match Message::decode(env.message_type, &env.payload) {
            Ok(message) => message,
            Err(CodecError::OutOfRange { field, value }) => {
                debug!(local = %self.local, source = %env.source, field, value, "field out of range");
                self.stats.dropped_out_of_range += 1;
                return;
            }
            Err(e) => {
                trace!(local = %self.local, source = %env.source, error = %e, "dropping malformed payload");
                self.stats.dropped_malformed += 1;
                return;
            }
        };

        self.dispatch(&env, message, frame.signal_quality, now);
        self.collect(now);
    }

    fn dispatch(&mut self, env: &Envelope, message: Message, signal_quality: f32, now: u64) {
        let flooded = matches!(
            env.message_type,
            MessageType::Data | MessageType::CoordinatorAnnouncement
        );
        if flooded && !self.flood_cache.check_and_add(env.source, env.sequence, now) {
            self.stats.duplicates_dropped += 1;
            return;
        }

        // Reverse route toward the originator through whoever relayed this
        let self_routed = matches!(
            env.message_type,
            MessageType::RouteRequest | MessageType::RouteReply
        );
        if env.source != env.last_hop && !self_routed {
            let hops = env.hop_count.saturating_add(1);
            self.routes.offer_route(
                env.source,
                env.last_hop,
                hops,
                relayed_path_reliability(signal_quality, hops),
                now,
            );
        }

        match &message {
            Message::DiscoveryBeacon(beacon) => {
                self.discovery
                    .process_discovery_beacon(env, beacon, signal_quality, &mut self.routes, now);
                return;
            }
            Message::Heartbeat(heartbeat) => {
                self.discovery
                    .process_heartbeat(env, heartbeat, signal_quality, &mut self.routes, now);
                return;
            }
            _ => self
                .discovery
                .observe_frame(env, signal_quality, &mut self.routes, now),
        }

        let for_us = env.destination == self.local;
        match message {
            Message::RouteRequest(req) => self.routes.process_route_request(env, &req, now),
            Message::RouteReply(rep) => self.routes.process_route_reply(env, &rep, now),
            Message::CoordinatorAnnouncement(ann) => {
                self.discovery.process_coordinator_announcement(env, &ann, now);
                self.reflood(env, Message::CoordinatorAnnouncement(ann), now);
            }
            Message::JoinRequest(req) if for_us => self.discovery.process_join_request(env, &req, now),
            Message::JoinReply(reply) if for_us => self.discovery.process_join_reply(env, &reply, now),
            msg @ (Message::TimeSyncRequest(_)
            | Message::TimeSyncResponse(_)
            | Message::TimeAnnouncement(_))
                if for_us || env.is_broadcast() =>
            {
                self.sync
                    .process_time_sync_message(env, &msg, signal_quality, now);
            }
            Message::Data(data) if env.is_broadcast() => {
                self.deliver(env, data.clone(), now);
                self.reflood(env, Message::Data(data), now);
            }
            Message::Data(data) if for_us => self.deliver(env, data, now),
            other => self.forward(env, other, now),
        }
    }

    /// Re-broadcast a flooded frame while it has hops left
    fn reflood(&mut self, env: &Envelope, message: Message, now: u64) {
        let next_hop_count = env.hop_count.saturating_add(1);
        if next_hop_count >= env.max_hops || next_hop_count >= self.config.routing.max_hops {
            return;
        }
        self.stats.frames_forwarded += 1;
        self.send(Outbound::relay(env, None, message), now);
    }

    /// Relay a unicast frame addressed to someone else
    fn forward(&mut self, env: &Envelope, message: Message, now: u64) {
        match self
            .routes
            .forwarding_decision(env.destination, env.hop_count, now)
        {
            ForwardDecision::Forward(next_hop) => {
                trace!(local = %self.local, destination = %env.destination, %next_hop, "forwarding");
                self.stats.frames_forwarded += 1;
                self.send(Outbound::relay(env, Some(next_hop), message), now);
            }
            ForwardDecision::Drop(DropReason::HopLimit) => {
                trace!(local = %self.local, destination = %env.destination, "hop limit reached");
                self.stats.hop_limit_exceeded += 1;
            }
            ForwardDecision::Drop(DropReason::NoRoute) => {
                trace!(local = %self.local, destination = %env.destination, "no route");
                self.stats.dropped_no_route += 1;
            }
            ForwardDecision::Deliver => {}
        }
    }

    fn deliver(&mut self, env: &Envelope, data: Vec<u8>, now: u64) {
        if self.inbox.len() >= self.config.inbox_capacity.max(1) {
            self.inbox.pop_front();
        }
        self.stats.payloads_delivered += 1;
        self.inbox.push_back(DeliveredPayload {
            source: env.source,
            destination: env.destination,
            hop_count: env.hop_count,
            data,
            received_at: now,
        });
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Move manager outboxes into the MAC queue and manager events into
    /// the event queue
    fn collect(&mut self, now: u64) {
        let outbound: Vec<Outbound> = self
            .routes
            .take_outbound()
            .into_iter()
            .chain(self.discovery.take_outbound())
            .chain(self.sync.take_outbound())
            .collect();
        for out in outbound {
            self.send(out, now);
        }

        let events: Vec<MeshEvent> = self
            .routes
            .take_events()
            .into_iter()
            .chain(self.discovery.take_events())
            .chain(self.sync.take_events())
            .collect();
        for event in events {
            self.events.push(event);
        }
    }

    /// Frame a message and queue it for the MAC
    fn send(&mut self, out: Outbound, now: u64) -> bool {
        match self.frame(out, now) {
            Ok((next_hop, bytes)) => match self.mac.queue_tx(next_hop, bytes, now) {
                Ok(()) => true,
                Err(_) => {
                    trace!(local = %self.local, "transmit queue full");
                    self.stats.queue_drops += 1;
                    false
                }
            },
            Err(e) => {
                warn!(local = %self.local, error = %e, "could not frame message");
                false
            }
        }
    }

    fn frame(&mut self, out: Outbound, now: u64) -> MeshResult<(Option<NodeId>, Vec<u8>)> {
        let next_hop = match (out.next_hop, out.relay) {
            // Originated unicast: route it if the destination is not adjacent
            (Some(hop), None) if hop == out.destination => Some(
                self.routes
                    .find_best_route(out.destination, now)
                    .map(|r| r.next_hop)
                    .unwrap_or(hop),
            ),
            (hop, _) => hop,
        };

        let (source, sequence, hop_count, max_hops) = match out.relay {
            Some(relay) => (relay.source, relay.sequence, relay.hop_count, relay.max_hops),
            None => (
                self.local,
                self.next_sequence(),
                0,
                self.config.routing.max_hops,
            ),
        };

        let env = Envelope {
            message_type: out.message.message_type(),
            source,
            last_hop: self.local,
            destination: out.destination,
            sequence,
            hop_count,
            max_hops,
            timestamp: now as u32,
            payload: out.message.encode(),
        };
        if env.message_type == MessageType::Data && source == self.local {
            // Our own floods must not come back as new
            self.flood_cache.check_and_add(source, sequence, now);
        }
        Ok((next_hop, env.to_bytes()?))
    }

    fn next_sequence(&mut self) -> u16 {
        let seq = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        seq
    }

    /// One transmit opportunity per tick
    fn transmit_once(&mut self, now: u64) {
        match self.mac.can_transmit(self.transport.channel_busy(), now) {
            TransmitDecision::TransmitNow => {
                let Some(mut frame) = self.mac.start_tx() else {
                    return;
                };
                frame.bytes = self.stamp_on_transmit(frame.bytes, now);
                let sent = match frame.dest {
                    None => self.transport.broadcast(&frame.bytes),
                    Some(dest) => self.transport.send_to(dest, &frame.bytes),
                };
                if sent {
                    self.stats.frames_tx += 1;
                    self.stats.bytes_tx += frame.bytes.len() as u64;
                    self.mac.tx_complete(frame.bytes.len(), now);
                } else {
                    debug!(local = %self.local, "transport refused frame");
                    self.stats.transport_failures += 1;
                }
            }
            TransmitDecision::Backoff { .. } | TransmitDecision::NothingToSend => {}
        }
        self.stats.backoffs = self.mac.backoffs();
    }

    /// Re-encode our own time-sync frames with clock fields read at
    /// transmit time. Other frames pass through untouched.
    fn stamp_on_transmit(&mut self, bytes: Vec<u8>, now: u64) -> Vec<u8> {
        let mut env = match Envelope::from_bytes(&bytes) {
            Ok(env) if env.message_type.is_time_sync() && env.source == self.local => env,
            _ => return bytes,
        };
        let mut message = match Message::decode(env.message_type, &env.payload) {
            Ok(message) => message,
            Err(_) => return bytes,
        };
        self.sync.stamp_outgoing(&mut message, now);
        env.payload = message.encode();
        env.timestamp = now as u32;
        match env.to_bytes() {
            Ok(stamped) => stamped,
            Err(e) => {
                warn!(local = %self.local, error = %e, "could not restamp time frame");
                bytes
            }
        }
    }

    // ------------------------------------------------------------------
    // Application interface
    // ------------------------------------------------------------------

    /// Queue application data for `dest` (or BROADCAST). A unicast with no
    /// known route is held while a route discovery runs.
    pub fn send_payload(&mut self, dest: NodeId, data: &[u8]) -> MeshResult<()> {
        if data.len() > self.config.max_payload_size {
            return Err(MeshError::PayloadTooLarge {
                size: data.len(),
                limit: self.config.max_payload_size,
            });
        }
        let now = self.clock.now_ms();
        if dest == self.local {
            return Ok(());
        }

        if dest.is_broadcast() {
            self.stats.payloads_sent += 1;
            return self.queue_originated(Outbound::broadcast(Message::Data(data.to_vec())), now);
        }

        match self.routes.find_best_route(dest, now) {
            Some(route) => {
                self.stats.payloads_sent += 1;
                self.queue_originated(
                    Outbound::routed(dest, route.next_hop, Message::Data(data.to_vec())),
                    now,
                )
            }
            None => {
                if self.awaiting_route.len() >= MAX_AWAITING_ROUTE {
                    return Err(MeshError::QueueFull);
                }
                if self.routes.initiate_route_discovery(dest, now) {
                    self.stats.route_discoveries += 1;
                }
                self.stats.payloads_sent += 1;
                self.awaiting_route.push_back(AwaitingRoute {
                    dest,
                    data: data.to_vec(),
                    since: now,
                });
                self.collect(now);
                Ok(())
            }
        }
    }

    /// `send_payload` as a plain accepted/refused flag
    pub fn transmit_payload(&mut self, dest: NodeId, data: &[u8]) -> bool {
        match self.send_payload(dest, data) {
            Ok(()) => true,
            Err(e) => {
                debug!(local = %self.local, %dest, error = %e, "payload refused");
                false
            }
        }
    }

    fn queue_originated(&mut self, out: Outbound, now: u64) -> MeshResult<()> {
        let (next_hop, bytes) = self.frame(out, now)?;
        self.mac.queue_tx(next_hop, bytes, now).map_err(|e| {
            self.stats.queue_drops += 1;
            e
        })
    }

    fn retry_awaiting_route(&mut self, now: u64) {
        let expiry = self.config.routing.route_request_interval_ms * 3;
        let waiting = std::mem::take(&mut self.awaiting_route);
        for item in waiting {
            if let Some(route) = self.routes.route(item.dest, now).cloned() {
                let out = Outbound::routed(item.dest, route.next_hop, Message::Data(item.data));
                if self.queue_originated(out, now).is_err() {
                    trace!(local = %self.local, dest = %item.dest, "held payload lost to full queue");
                }
            } else if now.saturating_sub(item.since) > expiry {
                debug!(local = %self.local, dest = %item.dest, "no route found, payload dropped");
                self.stats.dropped_no_route += 1;
            } else {
                if self.routes.initiate_route_discovery(item.dest, now) {
                    self.stats.route_discoveries += 1;
                }
                self.awaiting_route.push_back(item);
            }
        }
    }

    /// Payloads delivered since the last call, oldest first
    pub fn take_received(&mut self) -> Vec<DeliveredPayload> {
        self.inbox.drain(..).collect()
    }

    /// Pending events, oldest first
    pub fn drain_events(&mut self) -> Vec<MeshEvent> {
        self.events.drain()
    }

    /// Events lost to a full queue
    pub fn events_dropped(&self) -> u64 {
        self.events.dropped()
    }

    // ------------------------------------------------------------------
    // Status queries
    // ------------------------------------------------------------------

    pub fn get_active_neighbors(&self) -> Vec<NodeId> {
        self.discovery.get_active_neighbors(self.clock.now_ms())
    }

    pub fn get_discovered_nodes(&self) -> Vec<NodeInfo> {
        self.discovery.get_discovered_nodes()
    }

    pub fn is_network_joined(&self) -> bool {
        self.discovery.is_network_joined()
    }

    pub fn is_coordinator(&self) -> bool {
        self.discovery.is_coordinator()
    }

    /// Current coordinator; `NodeId::UNKNOWN` when unjoined
    pub fn get_coordinator_id(&self) -> NodeId {
        self.discovery.coordinator_id()
    }

    /// Network time, or local time when unsynchronized
    pub fn get_network_time(&self) -> u64 {
        self.sync.network_time(self.clock.now_ms())
    }

    pub fn is_time_synchronized(&self) -> bool {
        self.sync.is_time_synchronized(self.clock.now_ms())
    }

    pub fn stats(&self) -> MeshStats {
        let now = self.clock.now_ms();
        MeshStats {
            channel_utilization: self.mac.channel_utilization(now),
            neighbor_count: self.discovery.get_active_neighbors(now).len(),
            route_count: self.routes.len(),
            ..self.stats.clone()
        }
    }

    pub fn report(&self) -> NodeReport {
        let now = self.clock.now_ms();
        NodeReport {
            node_id: self.local,
            coordinator: self.discovery.coordinator_id(),
            network_time: self.sync.network_time(now),
            mesh: self.stats(),
            routing: self.routes.statistics(now),
            discovery: self.discovery.statistics(now),
            sync: self.sync.statistics(now),
        }
    }
}

impl<T: Transport, C: Clock> std::fmt::Debug for MeshNode<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("node_id", &self.local)
            .field("joined", &self.discovery.is_network_joined())
            .field("routes", &self.routes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DiscoveryBeacon, Heartbeat, NodeStatus, TimeAnnouncement, TimeSyncResponse};
    use crate::traits::test_impls::{ManualClock, MemoryTransport};

    const LOCAL: NodeId = NodeId::from_u32(0x10);
    const PEER: NodeId = NodeId::from_u32(0x20);
    const FAR: NodeId = NodeId::from_u32(0x30);

    fn node() -> (MeshNode<MemoryTransport, ManualClock>, ManualClock) {
        let clock = ManualClock::at(1_000);
        let node = MeshNode::new(MeshConfig::for_node(LOCAL), MemoryTransport::new(), clock.clone())
            .unwrap();
        (node, clock)
    }

    fn frame(source: NodeId, last_hop: NodeId, dest: NodeId, seq: u16, hops: u8, message: Message) -> Vec<u8> {
        Envelope {
            message_type: message.message_type(),
            source,
            last_hop,
            destination: dest,
            sequence: seq,
            hop_count: hops,
            max_hops: 8,
            timestamp: 0,
            payload: message.encode(),
        }
        .to_bytes()
        .unwrap()
    }

    fn status() -> NodeStatus {
        NodeStatus {
            capabilities: Default::default(),
            battery_level: 80,
            signal_quality: 0.9,
            uptime_secs: 10,
            is_coordinator: false,
            joined: false,
            coordinator: NodeId::UNKNOWN,
        }
    }

    fn decode_sent(bytes: &[u8]) -> (Envelope, Message) {
        let env = Envelope::from_bytes(bytes).unwrap();
        let msg = Message::decode(env.message_type, &env.payload).unwrap();
        (env, msg)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = MeshConfig::for_node(NodeId::BROADCAST);
        assert!(MeshNode::new(config, MemoryTransport::new(), ManualClock::new()).is_err());
    }

    #[test]
    fn test_malformed_and_self_echo_dropped() {
        let (mut node, _) = node();
        let mut bad = frame(PEER, PEER, NodeId::BROADCAST, 1, 0, Message::Data(vec![1]));
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        node.transport_mut().inject_rx(bad, 0.9);
        node.transport_mut()
            .inject_rx(frame(LOCAL, LOCAL, NodeId::BROADCAST, 1, 0, Message::Data(vec![1])), 0.9);
        node.transport_mut().inject_rx(vec![1, 2, 3], 0.9);

        assert_eq!(node.tick(), 3);
        let stats = node.stats();
        assert_eq!(stats.dropped_malformed, 2);
        assert_eq!(stats.dropped_self_echo, 1);
        assert!(node.take_received().is_empty());
    }

    #[test]
    fn test_out_of_range_stratum_dropped() {
        let (mut node, _) = node();
        let mut bytes = frame(
            PEER,
            PEER,
            NodeId::BROADCAST,
            1,
            0,
            Message::TimeAnnouncement(TimeAnnouncement {
                stratum: 1,
                accuracy: 90,
                network_time: 5_000,
                send_time: 5_000,
            }),
        );
        // Patch the stratum byte and re-checksum
        bytes[Envelope::HEADER_SIZE] = 40;
        let body = bytes.len() - 2;
        let crc = crate::packet::crc16_ccitt(&bytes[..body]);
        bytes[body..].copy_from_slice(&crc.to_be_bytes());

        node.handle_frame(ReceivedFrame::new(bytes, 0.9), 1_000);
        assert_eq!(node.stats().dropped_out_of_range, 1);
        assert!(!node.is_time_synchronized());
    }

    #[test]
    fn test_huge_network_time_dropped() {
        let (mut node, _) = node();
        let bytes = frame(
            PEER,
            PEER,
            NodeId::BROADCAST,
            1,
            0,
            Message::TimeAnnouncement(TimeAnnouncement {
                stratum: 1,
                accuracy: 90,
                network_time: 1 << 63,
                send_time: 5_000,
            }),
        );
        node.handle_frame(ReceivedFrame::new(bytes, 0.9), 1_000);
        assert_eq!(node.stats().dropped_out_of_range, 1);
        assert!(!node.is_time_synchronized());
        assert_eq!(node.get_network_time(), 1_000);
    }

    #[test]
    fn test_time_request_stamped_when_sent() {
        let (mut node, clock) = node();
        let ann = Message::TimeAnnouncement(TimeAnnouncement {
            stratum: 1,
            accuracy: 90,
            network_time: 1_000,
            send_time: 1_000,
        });
        node.transport_mut()
            .inject_rx(frame(PEER, PEER, NodeId::BROADCAST, 1, 0, ann), 0.9);
        // Request queued at t=1000 behind a busy channel
        node.transport_mut().set_channel_busy(true);
        node.tick();
        clock.advance(1_000);
        node.tick();
        assert!(node.transport().sent().is_empty());
        node.transport_mut().set_channel_busy(false);

        let mut stamped = None;
        for _ in 0..20 {
            clock.advance(250);
            node.tick();
            for f in node.transport_mut().take_sent() {
                if let (_, Message::TimeSyncRequest(req)) = decode_sent(&f.bytes) {
                    stamped = Some((req.origin_time, clock.now_ms()));
                }
            }
            if stamped.is_some() {
                break;
            }
        }
        let (origin, sent_at) = stamped.expect("request never sent");
        assert_eq!(origin, sent_at);
        assert!(origin > 1_000);

        // Same clock on both ends, 100 ms each way
        let resp = Message::TimeSyncResponse(TimeSyncResponse {
            origin_time: origin,
            receive_time: origin + 100,
            transmit_time: origin + 100,
            stratum: 1,
            accuracy: 90,
        });
        node.handle_frame(ReceivedFrame::new(frame(PEER, PEER, LOCAL, 2, 0, resp), 0.9), origin + 200);
        let reference = node.time_sync().reference(PEER).unwrap();
        assert_eq!(reference.last_rtt_ms, Some(200));
        assert_eq!(reference.clock_offset, 0);
    }

    #[test]
    fn test_beacon_reaches_discovery() {
        let (mut node, _) = node();
        let beacon = Message::DiscoveryBeacon(DiscoveryBeacon {
            status: status(),
            neighbors: Vec::new(),
        });
        node.transport_mut()
            .inject_rx(frame(PEER, PEER, NodeId::BROADCAST, 7, 0, beacon), 0.8);
        node.tick();
        assert_eq!(node.get_active_neighbors(), vec![PEER]);
        assert!(node.routes().route(PEER, 1_000).is_some());
        assert!(node
            .drain_events()
            .contains(&MeshEvent::NodeDiscovered { node: PEER }));
    }

    #[test]
    fn test_broadcast_data_delivered_and_reflooded_once() {
        let (mut node, _) = node();
        let data = frame(FAR, PEER, NodeId::BROADCAST, 9, 1, Message::Data(b"hi".to_vec()));
        node.transport_mut().inject_rx(data.clone(), 0.9);
        node.transport_mut().inject_rx(data, 0.9);
        node.tick();

        let received = node.take_received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].source, FAR);
        assert_eq!(received[0].data, b"hi".to_vec());
        assert_eq!(node.stats().duplicates_dropped, 1);
        assert_eq!(node.stats().frames_forwarded, 1);
        // Reverse route learned through the relay
        assert_eq!(node.routes().route(FAR, 1_000).map(|r| r.next_hop), Some(PEER));
    }

    #[test]
    fn test_reverse_route_reliability_covers_every_hop() {
        let (mut node, _) = node();
        // Three hops from FAR, last link measured at 0.9
        let data = frame(FAR, PEER, NodeId::BROADCAST, 4, 2, Message::Data(b"x".to_vec()));
        node.handle_frame(ReceivedFrame::new(data, 0.9), 1_000);
        let route = node.routes().route(FAR, 1_000).unwrap();
        assert_eq!(route.hop_count, 3);
        assert!((route.reliability - 0.729).abs() < 1e-4, "reliability {}", route.reliability);
    }

    #[test]
    fn test_unicast_forwarded_along_route() {
        let (mut node, clock) = node();
        let hb = Message::Heartbeat(Heartbeat {
            status: status(),
            neighbor_count: 1,
        });
        node.transport_mut()
            .inject_rx(frame(PEER, PEER, NodeId::BROADCAST, 1, 0, hb), 0.9);
        node.tick();
        node.transport_mut().take_sent();

        // Drain the tick's own control traffic before checking the relay
        for _ in 0..8 {
            clock.advance(10_000);
            node.tick();
        }
        node.transport_mut().take_sent();

        node.transport_mut()
            .inject_rx(frame(FAR, FAR, PEER, 3, 0, Message::Data(vec![42])), 0.9);
        node.tick();
        let forwarded: Vec<_> = node
            .transport_mut()
            .take_sent()
            .into_iter()
            .filter(|f| f.dest == Some(PEER))
            .collect();
        assert_eq!(forwarded.len(), 1);
        let (env, msg) = decode_sent(&forwarded[0].bytes);
        assert_eq!(env.source, FAR);
        assert_eq!(env.last_hop, LOCAL);
        assert_eq!(env.hop_count, 1);
        assert_eq!(msg, Message::Data(vec![42]));
    }

    #[test]
    fn test_unroutable_unicast_dropped() {
        let (mut node, _) = node();
        node.handle_frame(
            ReceivedFrame::new(frame(FAR, FAR, PEER, 3, 0, Message::Data(vec![1])), 0.9),
            1_000,
        );
        assert_eq!(node.stats().dropped_no_route, 1);
    }

    #[test]
    fn test_payload_limits() {
        let (mut node, _) = node();
        let big = vec![0u8; 201];
        assert!(matches!(
            node.send_payload(NodeId::BROADCAST, &big),
            Err(MeshError::PayloadTooLarge { size: 201, limit: 200 })
        ));
        assert!(!node.transmit_payload(NodeId::BROADCAST, &big));
        assert!(node.transmit_payload(NodeId::BROADCAST, b"ok"));
    }

    #[test]
    fn test_payload_without_route_starts_discovery() {
        let (mut node, _) = node();
        assert!(node.transmit_payload(FAR, b"later"));
        assert_eq!(node.stats().route_discoveries, 1);

        // Route reply arrives from PEER on behalf of FAR
        let reply = Message::RouteReply(crate::message::RouteReply {
            target: FAR,
            target_hops: 1,
            path_quality: 0.9,
        });
        node.transport_mut()
            .inject_rx(frame(PEER, PEER, LOCAL, 2, 0, reply), 0.9);
        for _ in 0..40 {
            node.tick();
        }
        let sent = node.transport_mut().take_sent();
        let data: Vec<_> = sent
            .iter()
            .map(|f| (f.dest, decode_sent(&f.bytes)))
            .filter(|(_, (_, m))| matches!(m, Message::Data(_)))
            .collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].0, Some(PEER));
        assert_eq!(data[0].1 .0.destination, FAR);
    }

    #[test]
    fn test_one_transmission_per_tick() {
        let (mut node, _) = node();
        node.transmit_payload(NodeId::BROADCAST, b"a");
        node.transmit_payload(NodeId::BROADCAST, b"b");
        node.tick();
        assert_eq!(node.transport().sent().len(), 1);
        node.tick();
        assert_eq!(node.transport().sent().len(), 2);
    }

    #[test]
    fn test_refused_send_counted() {
        let (mut node, _) = node();
        node.transport_mut().set_refuse_sends(true);
        node.tick();
        assert_eq!(node.stats().transport_failures, 1);
        assert_eq!(node.stats().frames_tx, 0);
    }

    #[test]
    fn test_report_serializes() {
        let (mut node, _) = node();
        node.tick();
        let json = serde_json::to_string(&node.report()).unwrap();
        assert!(json.contains("\"routing\""));
    }
}
