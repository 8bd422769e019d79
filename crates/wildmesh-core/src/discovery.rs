//! Discovery Manager
//!
//! Tracks every node heard from and the local node's network membership.
//!
//! ```text
//! per remote node:   Unknown ─heard─▶ Discovered ─direct─▶ Active
//!                                                   ▲   │ no direct frame > stale
//!                                                   └── Stale ─ silent > timeout ─▶ evicted
//!                                                 direct
//!
//! local membership:  Unjoined ─request─▶ Joining ─accepted─▶ Joined
//!                       ▲                  │ rejected/timeout
//!                       └──────────────────┘
//!                    Unjoined ─attempts exhausted─▶ Coordinator
//! ```
//!
//! Beacons carry the sender's status and its neighbor list with link
//! qualities; direct sightings become links in the Route Manager's graph,
//! neighbor lists become 2-hop links. Coordinator conflicts resolve to the
//! higher node id.

use crate::config::DiscoveryConfig;
use crate::events::MeshEvent;
use crate::message::{
    Capabilities, CoordinatorAnnouncement, DiscoveryBeacon, Heartbeat, JoinReply, JoinRequest,
    Message, NeighborLink, NodeStatus, Outbound, RejectReason, MAX_BEACON_NEIGHBORS,
    MAX_REPLY_NEIGHBORS,
};
use crate::packet::{Envelope, NodeId};
use crate::routing::{due, RouteManager};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, trace};

/// Liveness of a known node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    /// Known, but never heard directly
    Discovered,
    /// Heard directly within the stale window
    Active,
    /// Silent past the stale window, not yet evicted
    Stale,
}

/// Everything known about a remote node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub capabilities: Capabilities,
    pub battery_level: u8,
    /// Sender-reported average link quality
    pub signal_quality: f32,
    pub uptime_secs: u32,
    pub first_seen: u64,
    pub last_seen: u64,
    pub is_coordinator: bool,
    /// Sender reports network membership
    pub joined: bool,
    /// Sender's coordinator, UNKNOWN when unjoined
    pub coordinator: NodeId,
    /// Hops from the local node at the latest sighting; 0 until heard
    pub hop_distance: u8,
    /// Latest frame received straight from this node
    pub last_direct_seen: Option<u64>,
    /// Locally measured signal quality of direct frames
    pub link_quality: f32,
    pub neighbor_count: u8,
    last_beacon_sequence: Option<u16>,
}

impl NodeInfo {
    fn new(node_id: NodeId, now: u64) -> Self {
        Self {
            node_id,
            capabilities: Capabilities::NONE,
            battery_level: 0,
            signal_quality: 0.0,
            uptime_secs: 0,
            first_seen: now,
            last_seen: now,
            is_coordinator: false,
            joined: false,
            coordinator: NodeId::UNKNOWN,
            hop_distance: 0,
            last_direct_seen: None,
            link_quality: 0.0,
            neighbor_count: 0,
            last_beacon_sequence: None,
        }
    }

    fn apply_status(&mut self, status: &NodeStatus) {
        self.capabilities = status.capabilities;
        self.battery_level = status.battery_level;
        self.signal_quality = status.signal_quality;
        self.uptime_secs = status.uptime_secs;
        self.joined = status.joined;
        self.is_coordinator = status.is_coordinator;
        self.coordinator = status.coordinator;
    }

    /// Record a sighting; `signal_quality` is `None` when not measured
    fn heard(&mut self, hop_distance: u8, signal_quality: Option<f32>, now: u64) {
        self.last_seen = now;
        if hop_distance == 0 {
            return;
        }
        if hop_distance == 1 {
            if let Some(q) = signal_quality {
                self.link_quality = if self.last_direct_seen.is_some() {
                    0.7 * self.link_quality + 0.3 * q
                } else {
                    q
                };
            }
            self.last_direct_seen = Some(now);
        }
        self.hop_distance = hop_distance;
    }

    /// Active needs a direct frame inside the stale window; relayed
    /// sightings only keep the entry from eviction
    pub fn state(&self, now: u64, stale_ms: u64) -> NodeState {
        match self.last_direct_seen {
            None => NodeState::Discovered,
            Some(t) if now.saturating_sub(t) <= stale_ms => NodeState::Active,
            Some(_) => NodeState::Stale,
        }
    }

    pub fn is_direct_neighbor(&self) -> bool {
        self.hop_distance == 1
    }
}

/// Local network membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Membership {
    Unjoined,
    /// Join request outstanding
    Joining { coordinator: NodeId, since: u64 },
    Joined { coordinator: NodeId },
    /// This node coordinates
    Coordinator,
}

impl Membership {
    /// Joined to some coordinator, possibly itself
    pub fn is_joined(&self) -> bool {
        matches!(self, Membership::Joined { .. } | Membership::Coordinator)
    }
}

/// Result of processing a beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconOutcome {
    /// Our own beacon echoed back
    Ignored,
    /// Same beacon seen before; liveness refreshed only
    Duplicate,
    Updated { new_node: bool },
}

/// Result of a join initiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Requested,
    /// Too soon after the last request to this coordinator
    RateLimited,
    AlreadyJoined,
    /// Attempts exhausted; this node now coordinates
    BecameCoordinator,
    /// Not a valid coordinator id
    Invalid,
}

/// Discovery counters and membership summary
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryStats {
    pub total_nodes: usize,
    pub active_neighbors: usize,
    pub join_attempts: u32,
    pub is_joined: bool,
    pub is_coordinator: bool,
    pub beacons_sent: u64,
    pub beacons_received: u64,
    pub duplicate_beacons: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub joins_accepted: u64,
    pub joins_rejected: u64,
    pub nodes_evicted: u64,
    pub partitions_detected: u64,
}

/// Discovery Manager for one local node
#[derive(Debug)]
pub struct DiscoveryManager {
    local: NodeId,
    config: DiscoveryConfig,
    capabilities: Capabilities,
    battery_level: u8,
    nodes: HashMap<NodeId, NodeInfo>,
    membership: Membership,
    join_attempts: u32,
    last_join_attempt: HashMap<NodeId, u64>,
    /// Coordinators that refused us since the last successful join
    rejected_by: HashSet<NodeId>,
    heartbeat_interval_ms: u64,
    discovery_interval_ms: u64,
    last_beacon: Option<u64>,
    last_heartbeat: Option<u64>,
    last_announcement: Option<u64>,
    last_partition_check: Option<u64>,
    last_discovery_round: Option<u64>,
    /// A join request went out since the last discovery round
    attempted_since_round: bool,
    beacon_requested: bool,
    last_components: usize,
    stats: DiscoveryStats,
    outbox: Vec<Outbound>,
    events: Vec<MeshEvent>,
}

impl DiscoveryManager {
    pub fn new(local: NodeId, capabilities: Capabilities, config: DiscoveryConfig) -> Self {
        Self {
            local,
            capabilities,
            battery_level: 100,
            nodes: HashMap::new(),
            membership: Membership::Unjoined,
            join_attempts: 0,
            last_join_attempt: HashMap::new(),
            rejected_by: HashSet::new(),
            heartbeat_interval_ms: config.heartbeat_interval_ms,
            discovery_interval_ms: config.discovery_interval_ms,
            last_beacon: None,
            last_heartbeat: None,
            last_announcement: None,
            last_partition_check: None,
            last_discovery_round: None,
            attempted_since_round: false,
            beacon_requested: false,
            last_components: 1,
            stats: DiscoveryStats::default(),
            outbox: Vec::new(),
            events: Vec::new(),
            config,
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    /// Battery level reported in beacons, from the power subsystem
    pub fn set_battery_level(&mut self, percent: u8) {
        self.battery_level = percent.min(100);
    }

    pub fn membership(&self) -> Membership {
        self.membership
    }

    pub fn is_network_joined(&self) -> bool {
        self.membership.is_joined()
    }

    pub fn is_coordinator(&self) -> bool {
        self.membership == Membership::Coordinator
    }

    /// Current coordinator; `UNKNOWN` when unjoined
    pub fn coordinator_id(&self) -> NodeId {
        match self.membership {
            Membership::Joined { coordinator } => coordinator,
            Membership::Coordinator => self.local,
            Membership::Unjoined | Membership::Joining { .. } => NodeId::UNKNOWN,
        }
    }

    pub fn join_attempts(&self) -> u32 {
        self.join_attempts
    }

    /// Intervals in effect, possibly adopted from a coordinator
    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval_ms
    }

    pub fn discovery_interval_ms(&self) -> u64 {
        self.discovery_interval_ms
    }

    /// Direct neighbors heard within the stale window, ascending
    pub fn get_active_neighbors(&self, now: u64) -> Vec<NodeId> {
        let mut active: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.state(now, self.config.neighbor_stale_ms) == NodeState::Active)
            .map(|n| n.node_id)
            .collect();
        active.sort();
        active
    }

    /// Every known node, ascending by id
    pub fn get_discovered_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.node_id);
        nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&id)
    }

    pub fn node_state(&self, id: NodeId, now: u64) -> Option<NodeState> {
        self.nodes
            .get(&id)
            .map(|n| n.state(now, self.config.neighbor_stale_ms))
    }

    /// Status block advertised in beacons, heartbeats and join requests
    pub fn local_status(&self, now: u64) -> NodeStatus {
        let active = self.get_active_neighbors(now);
        let signal_quality = if active.is_empty() {
            0.0
        } else {
            active
                .iter()
                .filter_map(|id| self.nodes.get(id))
                .map(|n| n.link_quality)
                .sum::<f32>()
                / active.len() as f32
        };
        NodeStatus {
            capabilities: self.capabilities,
            battery_level: self.battery_level,
            signal_quality,
            uptime_secs: (now / 1000).min(u32::MAX as u64) as u32,
            joined: self.membership.is_joined(),
            is_coordinator: self.is_coordinator(),
            coordinator: self.coordinator_id(),
        }
    }

    // ------------------------------------------------------------------
    // Beacons and heartbeats
    // ------------------------------------------------------------------

    /// Broadcast a beacon unless one went out within the minimum interval
    pub fn start_discovery(&mut self, now: u64) -> bool {
        if let Some(last) = self.last_beacon {
            if now.saturating_sub(last) < self.config.min_beacon_interval_ms {
                return false;
            }
        }

        let mut neighbors: Vec<NeighborLink> = self
            .get_active_neighbors(now)
            .into_iter()
            .filter_map(|id| self.nodes.get(&id))
            .map(|n| NeighborLink {
                node: n.node_id,
                quality: n.link_quality,
            })
            .collect();
        neighbors.sort_by(|a, b| b.quality.total_cmp(&a.quality).then(a.node.cmp(&b.node)));
        neighbors.truncate(MAX_BEACON_NEIGHBORS);

        trace!(local = %self.local, neighbors = neighbors.len(), "discovery beacon");
        self.outbox.push(Outbound::broadcast(Message::DiscoveryBeacon(DiscoveryBeacon {
            status: self.local_status(now),
            neighbors,
        })));
        self.last_beacon = Some(now);
        self.beacon_requested = false;
        self.stats.beacons_sent += 1;
        true
    }

    /// Upsert the sender, record links, and react to its membership
    pub fn process_discovery_beacon(
        &mut self,
        env: &Envelope,
        beacon: &DiscoveryBeacon,
        signal_quality: f32,
        routes: &mut RouteManager,
        now: u64,
    ) -> BeaconOutcome {
        let sender = env.source;
        if sender == self.local {
            return BeaconOutcome::Ignored;
        }
        self.stats.beacons_received += 1;
        let hop_distance = env.hop_count.saturating_add(1);

        if let Some(node) = self.nodes.get_mut(&sender) {
            if node.last_beacon_sequence == Some(env.sequence) {
                node.last_seen = now;
                self.stats.duplicate_beacons += 1;
                return BeaconOutcome::Duplicate;
            }
        }

        let new_node = self.upsert(sender, &beacon.status, hop_distance, Some(signal_quality), now);
        if let Some(node) = self.nodes.get_mut(&sender) {
            node.last_beacon_sequence = Some(env.sequence);
            node.neighbor_count = beacon.neighbors.len().min(u8::MAX as usize) as u8;
        }

        if env.hop_count == 0 {
            routes.observe_neighbor(sender, signal_quality, now);
        }
        for link in &beacon.neighbors {
            if link.node != self.local {
                routes.record_remote_link(sender, link.node, link.quality, now);
            }
        }

        self.react_to_status(sender, &beacon.status, now);
        BeaconOutcome::Updated { new_node }
    }

    /// Broadcast a heartbeat once per heartbeat interval
    pub fn send_heartbeat(&mut self, now: u64) -> bool {
        if !due(self.last_heartbeat, self.heartbeat_interval_ms, now) {
            return false;
        }
        let neighbor_count = self.get_active_neighbors(now).len().min(u8::MAX as usize) as u8;
        self.outbox.push(Outbound::broadcast(Message::Heartbeat(Heartbeat {
            status: self.local_status(now),
            neighbor_count,
        })));
        self.last_heartbeat = Some(now);
        self.stats.heartbeats_sent += 1;
        true
    }

    /// Refresh liveness from a heartbeat; returns false for our own
    pub fn process_heartbeat(
        &mut self,
        env: &Envelope,
        heartbeat: &Heartbeat,
        signal_quality: f32,
        routes: &mut RouteManager,
        now: u64,
    ) -> bool {
        let sender = env.source;
        if sender == self.local {
            return false;
        }
        self.stats.heartbeats_received += 1;
        self.upsert(
            sender,
            &heartbeat.status,
            env.hop_count.saturating_add(1),
            Some(signal_quality),
            now,
        );
        if let Some(node) = self.nodes.get_mut(&sender) {
            node.neighbor_count = heartbeat.neighbor_count;
        }
        if env.hop_count == 0 {
            routes.observe_neighbor(sender, signal_quality, now);
        }
        self.react_to_status(sender, &heartbeat.status, now);
        true
    }

    /// Any other validated frame: refresh a known transmitter's liveness
    pub fn observe_frame(
        &mut self,
        env: &Envelope,
        signal_quality: f32,
        routes: &mut RouteManager,
        now: u64,
    ) {
        if env.last_hop == self.local {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&env.last_hop) {
            node.heard(1, Some(signal_quality), now);
        }
        routes.observe_neighbor(env.last_hop, signal_quality, now);
    }

    fn upsert(
        &mut self,
        id: NodeId,
        status: &NodeStatus,
        hop_distance: u8,
        signal_quality: Option<f32>,
        now: u64,
    ) -> bool {
        let mut new_node = false;
        let node = self.nodes.entry(id).or_insert_with(|| {
            new_node = true;
            NodeInfo::new(id, now)
        });
        node.apply_status(status);
        node.heard(hop_distance, signal_quality, now);
        if new_node {
            debug!(local = %self.local, node = %id, battery = status.battery_level, "node discovered");
            self.events.push(MeshEvent::NodeDiscovered { node: id });
        }
        new_node
    }

    fn react_to_status(&mut self, sender: NodeId, status: &NodeStatus, now: u64) {
        let claimed = if status.is_coordinator {
            Some(sender)
        } else if status.joined && !status.coordinator.is_unknown() {
            Some(status.coordinator)
        } else {
            None
        };
        if let Some(coordinator) = claimed {
            if coordinator != self.local {
                self.handle_coordinator_claim(coordinator, Some(sender), now);
            }
        }
    }

    // ------------------------------------------------------------------
    // Joining
    // ------------------------------------------------------------------

    /// Ask `coordinator` for admission, rate-limited per coordinator.
    /// Self-promotes once the attempt budget is spent and no coordinator
    /// is known; otherwise keeps retrying.
    pub fn initiate_network_join(&mut self, coordinator: NodeId, now: u64) -> JoinOutcome {
        self.request_join(coordinator, None, now)
    }

    fn request_join(&mut self, coordinator: NodeId, via: Option<NodeId>, now: u64) -> JoinOutcome {
        if coordinator == self.local || coordinator.is_broadcast() || coordinator.is_unknown() {
            return JoinOutcome::Invalid;
        }
        if self.membership.is_joined() {
            return JoinOutcome::AlreadyJoined;
        }
        if let Some(last) = self.last_join_attempt.get(&coordinator) {
            if now.saturating_sub(*last) < self.config.join_retry_interval_ms {
                return JoinOutcome::RateLimited;
            }
        }
        if self.join_attempts >= self.config.max_discovery_attempts
            && self.coordinator_candidates().is_empty()
        {
            self.become_coordinator(now);
            return JoinOutcome::BecameCoordinator;
        }

        self.join_attempts = self.join_attempts.saturating_add(1);
        self.attempted_since_round = true;
        self.last_join_attempt.insert(coordinator, now);
        self.membership = Membership::Joining {
            coordinator,
            since: now,
        };
        info!(
            local = %self.local,
            %coordinator,
            attempt = self.join_attempts,
            "requesting network join"
        );
        let message = Message::JoinRequest(JoinRequest {
            status: self.local_status(now),
        });
        self.outbox.push(match via {
            Some(hop) if hop != coordinator => Outbound::routed(coordinator, hop, message),
            _ => Outbound::unicast(coordinator, message),
        });
        JoinOutcome::Requested
    }

    /// Coordinator side of admission
    pub fn process_join_request(&mut self, env: &Envelope, req: &JoinRequest, now: u64) {
        let requester = env.source;
        if requester == self.local {
            return;
        }
        if !self.is_coordinator() {
            self.reply_rejected(requester, RejectReason::NotCoordinator);
            return;
        }

        let member = self
            .nodes
            .get(&requester)
            .map(|n| self.is_member(n))
            .unwrap_or(false);
        if !member && self.member_count() >= self.config.max_nodes.saturating_sub(1) {
            info!(local = %self.local, %requester, "join rejected: network full");
            self.stats.joins_rejected += 1;
            self.reply_rejected(requester, RejectReason::NetworkFull);
            return;
        }

        self.upsert(requester, &req.status, env.hop_count.saturating_add(1), None, now);
        if let Some(node) = self.nodes.get_mut(&requester) {
            node.joined = true;
            node.coordinator = self.local;
        }
        self.stats.joins_accepted += 1;
        let members = self.member_count() + 1;
        info!(local = %self.local, %requester, members, "join accepted");

        let neighbors: Vec<NodeId> = self
            .get_active_neighbors(now)
            .into_iter()
            .filter(|n| *n != requester)
            .take(MAX_REPLY_NEIGHBORS)
            .collect();
        self.outbox.push(Outbound::unicast(
            requester,
            Message::JoinReply(JoinReply {
                accepted: true,
                reason: None,
                coordinator: self.local,
                heartbeat_interval_ms: self.heartbeat_interval_ms.min(u32::MAX as u64) as u32,
                discovery_interval_ms: self.discovery_interval_ms.min(u32::MAX as u64) as u32,
                member_count: members.min(u8::MAX as usize) as u8,
                neighbors,
            }),
        ));
    }

    fn is_member(&self, node: &NodeInfo) -> bool {
        node.joined && node.coordinator == self.local
    }

    /// Known nodes that joined under this node
    pub fn member_count(&self) -> usize {
        self.nodes.values().filter(|n| self.is_member(n)).count()
    }

    fn reply_rejected(&mut self, requester: NodeId, reason: RejectReason) {
        self.outbox.push(Outbound::unicast(
            requester,
            Message::JoinReply(JoinReply {
                accepted: false,
                reason: Some(reason),
                coordinator: self.local,
                heartbeat_interval_ms: 0,
                discovery_interval_ms: 0,
                member_count: 0,
                neighbors: Vec::new(),
            }),
        ));
    }

    /// Requester side of admission
    pub fn process_join_reply(&mut self, env: &Envelope, reply: &JoinReply, now: u64) {
        if self.membership.is_joined() {
            return;
        }
        let coordinator = reply.coordinator;

        if reply.accepted {
            self.membership = Membership::Joined { coordinator };
            self.join_attempts = 0;
            self.rejected_by.clear();
            if reply.heartbeat_interval_ms > 0 {
                self.heartbeat_interval_ms = reply.heartbeat_interval_ms as u64;
            }
            if reply.discovery_interval_ms > 0 {
                self.discovery_interval_ms = reply.discovery_interval_ms as u64;
            }

            let hop_distance = env.hop_count.saturating_add(1);
            let entry = self
                .nodes
                .entry(coordinator)
                .or_insert_with(|| NodeInfo::new(coordinator, now));
            entry.is_coordinator = true;
            entry.joined = true;
            entry.coordinator = coordinator;
            entry.heard(hop_distance, None, now);
            for id in &reply.neighbors {
                if *id != self.local {
                    self.nodes
                        .entry(*id)
                        .or_insert_with(|| NodeInfo::new(*id, now));
                }
            }

            info!(local = %self.local, %coordinator, members = reply.member_count, "joined network");
            self.events.push(MeshEvent::NetworkJoined { coordinator });
            // Announce membership right away
            self.last_heartbeat = None;
            return;
        }

        let reason = reply.reason.unwrap_or(RejectReason::NotCoordinator);
        info!(local = %self.local, %coordinator, %reason, "join rejected");
        self.events.push(MeshEvent::JoinRejected {
            coordinator,
            reason,
        });
        self.rejected_by.insert(coordinator);
        if let Some(node) = self.nodes.get_mut(&coordinator) {
            if reason == RejectReason::NotCoordinator {
                node.is_coordinator = false;
            }
        }
        self.membership = Membership::Unjoined;

        match self.coordinator_candidates().first().copied() {
            Some(next) => {
                self.request_join(next, None, now);
            }
            None => self.become_coordinator(now),
        }
    }

    /// Known coordinators not yet tried-and-refused, highest id first
    pub fn coordinator_candidates(&self) -> Vec<NodeId> {
        let mut candidates: Vec<NodeId> = self
            .nodes
            .values()
            .flat_map(|n| {
                let own = n.is_coordinator.then_some(n.node_id);
                let reported = (n.joined && !n.coordinator.is_unknown()).then_some(n.coordinator);
                own.into_iter().chain(reported)
            })
            .filter(|c| *c != self.local && !self.rejected_by.contains(c))
            .collect();
        candidates.sort_by(|a, b| b.cmp(a));
        candidates.dedup();
        candidates
    }

    // ------------------------------------------------------------------
    // Coordinator role
    // ------------------------------------------------------------------

    /// Take the coordinator role and announce it
    pub fn become_coordinator(&mut self, now: u64) {
        info!(local = %self.local, attempts = self.join_attempts, "becoming network coordinator");
        self.membership = Membership::Coordinator;
        self.join_attempts = 0;
        self.rejected_by.clear();
        self.events.push(MeshEvent::BecameCoordinator);
        self.announce_coordinator(now);
    }

    fn announce_coordinator(&mut self, now: u64) {
        self.outbox
            .push(Outbound::broadcast(Message::CoordinatorAnnouncement(
                CoordinatorAnnouncement {
                    member_count: (self.member_count() + 1).min(u8::MAX as usize) as u8,
                    battery_level: self.battery_level,
                },
            )));
        self.last_announcement = Some(now);
    }

    /// A node announced itself coordinator
    pub fn process_coordinator_announcement(
        &mut self,
        env: &Envelope,
        announcement: &CoordinatorAnnouncement,
        now: u64,
    ) {
        let claimant = env.source;
        if claimant == self.local {
            return;
        }
        // Announcements keep the coordinator's entry alive, so members that
        // never heard it directly still evict it once it goes silent
        let mut new_node = false;
        let node = self.nodes.entry(claimant).or_insert_with(|| {
            new_node = true;
            NodeInfo::new(claimant, now)
        });
        node.is_coordinator = true;
        node.joined = true;
        node.coordinator = claimant;
        node.battery_level = announcement.battery_level;
        node.heard(env.hop_count.saturating_add(1), None, now);
        if new_node {
            debug!(local = %self.local, node = %claimant, "coordinator discovered");
            self.events.push(MeshEvent::NodeDiscovered { node: claimant });
        }
        let via = (env.last_hop != claimant).then_some(env.last_hop);
        self.handle_coordinator_claim(claimant, via, now);
    }

    /// Resolve a coordinator claim: the higher id wins
    fn handle_coordinator_claim(&mut self, claimant: NodeId, via: Option<NodeId>, now: u64) {
        match self.membership {
            Membership::Unjoined => {
                if !self.rejected_by.contains(&claimant) {
                    self.request_join(claimant, via, now);
                }
            }
            Membership::Joining { coordinator, .. } => {
                if claimant > coordinator && !self.rejected_by.contains(&claimant) {
                    self.request_join(claimant, via, now);
                }
            }
            Membership::Joined { coordinator } => {
                if claimant > coordinator {
                    info!(local = %self.local, old = %coordinator, new = %claimant, "coordinator changed");
                    self.membership = Membership::Joined {
                        coordinator: claimant,
                    };
                    self.events.push(MeshEvent::CoordinatorChanged {
                        old: coordinator,
                        new: claimant,
                    });
                }
            }
            Membership::Coordinator => {
                if claimant > self.local {
                    info!(local = %self.local, new = %claimant, "yielding coordinator role");
                    self.membership = Membership::Joined {
                        coordinator: claimant,
                    };
                    self.events.push(MeshEvent::CoordinatorChanged {
                        old: self.local,
                        new: claimant,
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Evict nodes silent past the neighbor timeout. Returns evictions.
    pub fn update_neighbor_status(&mut self, routes: &mut RouteManager, now: u64) -> usize {
        let timeout = self.config.neighbor_timeout_ms;
        let mut expired: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| now.saturating_sub(n.last_seen) > timeout)
            .map(|n| n.node_id)
            .collect();
        expired.sort();

        for id in &expired {
            self.nodes.remove(id);
            routes.remove_node(*id, now);
            debug!(local = %self.local, node = %id, "node lost");
            self.events.push(MeshEvent::NodeLost { node: *id });

            let ours = match self.membership {
                Membership::Joined { coordinator } | Membership::Joining { coordinator, .. } => {
                    coordinator == *id
                }
                _ => false,
            };
            if ours {
                info!(local = %self.local, coordinator = %id, "coordinator lost");
                self.membership = Membership::Unjoined;
                self.join_attempts = 0;
                self.events.push(MeshEvent::CoordinatorLost { coordinator: *id });
            }
        }
        self.stats.nodes_evicted += expired.len() as u64;
        expired.len()
    }

    /// Connected-component check over the link graph; returns the
    /// component count. More than one requests a fresh beacon.
    pub fn check_partitions(&mut self, routes: &RouteManager, now: u64) -> usize {
        self.last_partition_check = Some(now);
        let stale = self.config.neighbor_stale_ms;
        let known: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.hop_distance > 0 && now.saturating_sub(n.last_seen) <= stale)
            .map(|n| n.node_id)
            .collect();
        let components = routes.connected_components(&known, now).len();
        if components > 1 {
            if components != self.last_components {
                info!(local = %self.local, components, "network partition detected");
                self.stats.partitions_detected += 1;
                self.events.push(MeshEvent::PartitionDetected { components });
            }
            self.beacon_requested = true;
        }
        self.last_components = components;
        components
    }

    /// Tick entry point
    pub fn perform_periodic_tasks(&mut self, routes: &mut RouteManager, now: u64) {
        self.update_neighbor_status(routes, now);

        if let Membership::Joining { coordinator, since } = self.membership {
            if now.saturating_sub(since) > self.config.join_timeout_ms {
                debug!(local = %self.local, %coordinator, attempts = self.join_attempts, "join timed out");
                self.membership = Membership::Unjoined;
                if self.join_attempts >= self.config.max_discovery_attempts
                    && self.coordinator_candidates().is_empty()
                {
                    self.become_coordinator(now);
                }
            }
        }

        if due(self.last_discovery_round, self.discovery_interval_ms, now) {
            self.discovery_round(now);
        }
        if self.beacon_requested {
            self.start_discovery(now);
        }

        self.send_heartbeat(now);

        if self.is_coordinator()
            && due(self.last_announcement, self.config.coordinator_announce_interval_ms, now)
        {
            self.announce_coordinator(now);
        }

        if due(self.last_partition_check, self.config.partition_check_interval_ms, now) {
            self.check_partitions(routes, now);
        }
    }

    fn discovery_round(&mut self, now: u64) {
        let first_round = self.last_discovery_round.is_none();
        let attempted = std::mem::take(&mut self.attempted_since_round);
        self.last_discovery_round = Some(now);

        if self.membership == Membership::Unjoined {
            match self.coordinator_candidates().first().copied() {
                Some(candidate) => {
                    self.request_join(candidate, None, now);
                }
                None if !first_round && !attempted => {
                    // A round with no coordinator in sight is a failed attempt
                    self.join_attempts += 1;
                    debug!(local = %self.local, attempts = self.join_attempts, "no coordinator heard");
                    if self.join_attempts >= self.config.max_discovery_attempts {
                        self.become_coordinator(now);
                    }
                }
                None => {}
            }
        }
        self.beacon_requested = true;
        self.start_discovery(now);
    }

    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<MeshEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn statistics(&self, now: u64) -> DiscoveryStats {
        DiscoveryStats {
            total_nodes: self.nodes.len(),
            active_neighbors: self.get_active_neighbors(now).len(),
            join_attempts: self.join_attempts,
            is_joined: self.is_network_joined(),
            is_coordinator: self.is_coordinator(),
            ..self.stats.clone()
        }
    }
}
