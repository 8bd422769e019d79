//! Multi-Node Mesh Simulation
//!
//! Runs many [`MeshNode`]s against a simulated shared medium without
//! hardware. It models:
//!
//! - Topologies: line, ring, grid, random geometric, explicit link lists
//! - Per-link quality (reported to receivers as signal quality) and loss
//! - Optional collisions when a receiver hears two frames in one step
//! - Per-node clock offset and drift over a shared base clock
//! - Partitions, healing and nodes going offline
//!
//! Frames sent during step `k` are heard at step `k + 1`.
//!
//! ## Example
//!
//! ```
//! use wildmesh_core::simulation::{MeshSimulator, SimConfig, Topology};
//!
//! let config = SimConfig::default()
//!     .with_node_count(4)
//!     .with_topology(Topology::Line);
//! let mut sim = MeshSimulator::new(config).unwrap();
//! sim.run_for(60_000);
//! println!("{} frames delivered", sim.stats().frames_delivered);
//! ```

use crate::config::MeshConfig;
use crate::error::MeshResult;
use crate::events::MeshEvent;
use crate::node::{DeliveredPayload, MeshNode};
use crate::packet::NodeId;
use crate::traits::test_impls::{ManualClock, MemoryTransport, SkewedClock};
use crate::traits::Clock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Base clock reading at the start of a run, so negative offsets stay valid
const START_TIME_MS: u64 = 3_600_000;

/// How nodes are connected
#[derive(Debug, Clone, PartialEq)]
pub enum Topology {
    /// 0 - 1 - 2 - ... - n-1
    Line,
    /// A line closed back onto node 0
    Ring,
    /// Row-major grid, 4-neighborhood
    Grid { columns: usize },
    /// Uniform positions in a `sqrt(n)` square; nodes within `radius` link
    /// with quality falling from 1.0 to 0.5 at the edge
    RandomGeometric { radius: f64 },
    /// `(a, b, quality)` triples
    Explicit(Vec<(usize, usize, f32)>),
}

/// Simulation configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub node_count: usize,
    pub topology: Topology,
    /// Simulated time per step
    pub step_ms: u64,
    /// Quality of generated links (line, ring, grid)
    pub link_quality: f32,
    /// Probability a frame is lost on a link
    pub loss_probability: f64,
    /// Receivers hearing two frames in one step decode neither
    pub collisions: bool,
    /// Node clock offsets are drawn from `[-max, max]`
    pub max_clock_offset_ms: i64,
    /// Node clock drift is drawn from `[-max, max]`
    pub max_drift_ppm: f64,
    /// Probability per step that some node sends an application payload
    pub message_rate: f64,
    /// Node `i` gets id `base_node_id + i`
    pub base_node_id: u32,
    pub seed: u64,
    /// Template for every node's configuration; `node_id` is overwritten
    pub node: MeshConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            node_count: 5,
            topology: Topology::Line,
            step_ms: 250,
            link_quality: 0.9,
            loss_probability: 0.0,
            collisions: false,
            max_clock_offset_ms: 0,
            max_drift_ppm: 0.0,
            message_rate: 0.0,
            base_node_id: 0x0A00_0001,
            seed: 42,
            node: MeshConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn with_node_count(mut self, count: usize) -> Self {
        self.node_count = count;
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_loss(mut self, probability: f64) -> Self {
        self.loss_probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn with_collisions(mut self, enabled: bool) -> Self {
        self.collisions = enabled;
        self
    }

    pub fn with_clock_skew(mut self, max_offset_ms: i64, max_drift_ppm: f64) -> Self {
        self.max_clock_offset_ms = max_offset_ms.abs();
        self.max_drift_ppm = max_drift_ppm.abs();
        self
    }

    pub fn with_message_rate(mut self, rate: f64) -> Self {
        self.message_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_step_ms(mut self, step_ms: u64) -> Self {
        self.step_ms = step_ms.max(1);
        self
    }

    pub fn with_node_config(mut self, node: MeshConfig) -> Self {
        self.node = node;
        self
    }
}

/// Medium counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimStats {
    pub steps: u64,
    pub frames_transmitted: u64,
    /// Frame copies handed to receivers
    pub frames_delivered: u64,
    /// Frame copies lost to link loss
    pub frames_lost: u64,
    /// Frame copies lost to collisions
    pub collisions: u64,
    pub payloads_sent: u64,
    pub payloads_delivered: u64,
}

impl SimStats {
    /// Frame copies that reached a receiver (0.0 - 1.0)
    pub fn frame_success_rate(&self) -> f64 {
        let attempted = self.frames_delivered + self.frames_lost + self.collisions;
        if attempted == 0 {
            0.0
        } else {
            self.frames_delivered as f64 / attempted as f64
        }
    }
}

/// One node's state at report time
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub index: usize,
    pub node_id: NodeId,
    pub online: bool,
    pub joined: bool,
    pub is_coordinator: bool,
    pub coordinator: NodeId,
    pub neighbors: usize,
    pub routes: usize,
    pub synchronized: bool,
    pub stratum: u8,
    /// Network time minus true (base) time
    pub time_error_ms: i64,
}

/// End-of-run summary
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub elapsed_ms: u64,
    pub nodes: usize,
    pub joined: usize,
    pub coordinators: Vec<NodeId>,
    pub synchronized: usize,
    /// Largest network-time difference between synchronized nodes
    pub max_time_disagreement_ms: u64,
    pub stats: SimStats,
    pub per_node: Vec<NodeSummary>,
}

/// A node-level event, stamped with base time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimEvent {
    pub at_ms: u64,
    pub node: NodeId,
    pub event: MeshEvent,
}

/// A payload delivery observed by the simulator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimDelivery {
    pub at_ms: u64,
    pub receiver: NodeId,
    pub payload: DeliveredPayload,
}

struct SimNode {
    node: MeshNode<MemoryTransport, SkewedClock>,
    online: bool,
    transmitted: bool,
}

#[derive(Debug, Clone)]
struct InFlight {
    from: usize,
    to: usize,
    bytes: Vec<u8>,
    quality: f32,
}

/// Multi-node mesh simulator
pub struct MeshSimulator {
    config: SimConfig,
    base_clock: ManualClock,
    nodes: Vec<SimNode>,
    /// Symmetric links keyed `(low, high)` index
    links: BTreeMap<(usize, usize), f32>,
    /// Links cut by a partition
    cut: HashSet<(usize, usize)>,
    in_flight: Vec<InFlight>,
    rng: StdRng,
    stats: SimStats,
    deliveries: Vec<SimDelivery>,
    event_log: Vec<SimEvent>,
}

fn key(a: usize, b: usize) -> (usize, usize) {
    (a.min(b), a.max(b))
}

impl MeshSimulator {
    /// Create the nodes and links described by `config`
    pub fn new(config: SimConfig) -> MeshResult<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let base_clock = ManualClock::at(START_TIME_MS);

        let mut nodes = Vec::with_capacity(config.node_count);
        for i in 0..config.node_count {
            let id = NodeId::from_u32(config.base_node_id.wrapping_add(i as u32));
            let mut node_config = config.node.clone();
            node_config.node_id = id;

            let offset = if config.max_clock_offset_ms > 0 {
                rng.gen_range(-config.max_clock_offset_ms..=config.max_clock_offset_ms)
            } else {
                0
            };
            let drift = if config.max_drift_ppm > 0.0 {
                rng.gen_range(-config.max_drift_ppm..=config.max_drift_ppm)
            } else {
                0.0
            };
            let clock = SkewedClock::new(base_clock.clone(), offset, drift);
            debug!(node = %id, offset, drift, "sim node created");
            nodes.push(SimNode {
                node: MeshNode::new(node_config, MemoryTransport::new(), clock)?,
                online: true,
                transmitted: false,
            });
        }

        let links = build_links(&config, &mut rng);
        info!(
            nodes = nodes.len(),
            links = links.len(),
            topology = ?config.topology,
            "simulation initialized"
        );

        Ok(Self {
            config,
            base_clock,
            nodes,
            links,
            cut: HashSet::new(),
            in_flight: Vec::new(),
            rng,
            stats: SimStats::default(),
            deliveries: Vec::new(),
            event_log: Vec::new(),
        })
    }

    // ------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------

    /// Advance one step: deliver last step's frames, tick every node,
    /// collect new transmissions
    pub fn step(&mut self) {
        self.base_clock.advance(self.config.step_ms);
        self.stats.steps += 1;
        let now = self.base_clock.now_ms();

        self.deliver_in_flight();
        self.generate_messages();

        let busy: Vec<bool> = (0..self.nodes.len())
            .map(|i| {
                self.neighbors_of(i)
                    .into_iter()
                    .any(|(j, _)| self.nodes[j].transmitted)
            })
            .collect();

        for i in 0..self.nodes.len() {
            let sim_node = &mut self.nodes[i];
            sim_node.transmitted = false;
            if !sim_node.online {
                continue;
            }
            sim_node.node.transport_mut().set_channel_busy(busy[i]);
            sim_node.node.tick();

            let id = sim_node.node.node_id();
            for event in sim_node.node.drain_events() {
                self.event_log.push(SimEvent {
                    at_ms: now,
                    node: id,
                    event,
                });
            }
            for payload in sim_node.node.take_received() {
                self.stats.payloads_delivered += 1;
                self.deliveries.push(SimDelivery {
                    at_ms: now,
                    receiver: id,
                    payload,
                });
            }

            let sent = sim_node.node.transport_mut().take_sent();
            if !sent.is_empty() {
                sim_node.transmitted = true;
            }
            for frame in sent {
                self.stats.frames_transmitted += 1;
                for (j, quality) in self.neighbors_of(i) {
                    let addressed = match frame.dest {
                        None => true,
                        Some(dest) => self.nodes[j].node.node_id() == dest,
                    };
                    if addressed {
                        self.in_flight.push(InFlight {
                            from: i,
                            to: j,
                            bytes: frame.bytes.clone(),
                            quality,
                        });
                    }
                }
            }
        }
    }

    /// Run whole steps covering `duration_ms`
    pub fn run_for(&mut self, duration_ms: u64) {
        let steps = duration_ms.div_ceil(self.config.step_ms);
        for _ in 0..steps {
            self.step();
        }
    }

    /// Step until `done` holds or `max_ms` elapses; returns whether it held
    pub fn run_until<F>(&mut self, max_ms: u64, mut done: F) -> bool
    where
        F: FnMut(&MeshSimulator) -> bool,
    {
        let deadline = self.base_clock.now_ms() + max_ms;
        while self.base_clock.now_ms() < deadline {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    fn deliver_in_flight(&mut self) {
        let frames = std::mem::take(&mut self.in_flight);
        let mut per_receiver: BTreeMap<usize, HashSet<usize>> = BTreeMap::new();
        for f in &frames {
            per_receiver.entry(f.to).or_default().insert(f.from);
        }

        for f in frames {
            if !self.nodes[f.to].online {
                continue;
            }
            if self.config.collisions
                && per_receiver.get(&f.to).map(|s| s.len()).unwrap_or(0) > 1
            {
                self.stats.collisions += 1;
                continue;
            }
            if self.config.loss_probability > 0.0
                && self.rng.gen_bool(self.config.loss_probability)
            {
                self.stats.frames_lost += 1;
                continue;
            }
            self.stats.frames_delivered += 1;
            self.nodes[f.to]
                .node
                .transport_mut()
                .inject_rx(f.bytes, f.quality);
        }
    }

    fn generate_messages(&mut self) {
        if self.config.message_rate <= 0.0 || self.nodes.len() < 2 {
            return;
        }
        if !self.rng.gen_bool(self.config.message_rate) {
            return;
        }
        let from = self.rng.gen_range(0..self.nodes.len());
        let to = if self.rng.gen_bool(0.2) {
            None
        } else {
            let mut to = self.rng.gen_range(0..self.nodes.len() - 1);
            if to >= from {
                to += 1;
            }
            Some(to)
        };
        let data = format!("sim {} step {}", from, self.stats.steps).into_bytes();
        self.send_payload(from, to, &data);
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    /// Application send from node `from` to node `to` (None broadcasts)
    pub fn send_payload(&mut self, from: usize, to: Option<usize>, data: &[u8]) -> bool {
        let Some(dest) = (match to {
            None => Some(NodeId::BROADCAST),
            Some(j) => self.nodes.get(j).map(|n| n.node.node_id()),
        }) else {
            return false;
        };
        let Some(sim_node) = self.nodes.get_mut(from) else {
            return false;
        };
        if !sim_node.online {
            return false;
        }
        let accepted = sim_node.node.transmit_payload(dest, data);
        if accepted {
            self.stats.payloads_sent += 1;
        }
        accepted
    }

    /// Cut every link between `group` and the rest
    pub fn partition(&mut self, group: &[usize]) {
        let inside: HashSet<usize> = group.iter().copied().collect();
        for &(a, b) in self.links.keys() {
            if inside.contains(&a) != inside.contains(&b) {
                self.cut.insert((a, b));
            }
        }
        info!(group = ?group, cut = self.cut.len(), "partitioned");
    }

    /// Restore every cut link
    pub fn heal(&mut self) {
        info!(restored = self.cut.len(), "partition healed");
        self.cut.clear();
    }

    /// Take a node off the air or bring it back
    pub fn set_online(&mut self, index: usize, online: bool) {
        if let Some(n) = self.nodes.get_mut(index) {
            n.online = online;
        }
    }

    pub fn set_link(&mut self, a: usize, b: usize, quality: f32) {
        if a != b && a < self.nodes.len() && b < self.nodes.len() {
            self.links.insert(key(a, b), quality.clamp(0.0, 1.0));
        }
    }

    pub fn remove_link(&mut self, a: usize, b: usize) {
        self.links.remove(&key(a, b));
    }

    /// Usable links from `i`: present, not cut, both ends online
    pub fn neighbors_of(&self, i: usize) -> Vec<(usize, f32)> {
        self.links
            .iter()
            .filter(|(k, _)| !self.cut.contains(k))
            .filter_map(|(&(a, b), &q)| {
                if a == i {
                    Some((b, q))
                } else if b == i {
                    Some((a, q))
                } else {
                    None
                }
            })
            .filter(|(j, _)| self.nodes[*j].online)
            .collect()
    }

    pub fn linked(&self, a: usize, b: usize) -> bool {
        let k = key(a, b);
        self.links.contains_key(&k) && !self.cut.contains(&k)
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// True (base) time
    pub fn now_ms(&self) -> u64 {
        self.base_clock.now_ms()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&MeshNode<MemoryTransport, SkewedClock>> {
        self.nodes.get(index).map(|n| &n.node)
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut MeshNode<MemoryTransport, SkewedClock>> {
        self.nodes.get_mut(index).map(|n| &mut n.node)
    }

    pub fn node_id(&self, index: usize) -> Option<NodeId> {
        self.nodes.get(index).map(|n| n.node.node_id())
    }

    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.node.node_id() == id)
    }

    pub fn is_online(&self, index: usize) -> bool {
        self.nodes.get(index).map(|n| n.online).unwrap_or(false)
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    pub fn deliveries(&self) -> &[SimDelivery] {
        &self.deliveries
    }

    pub fn events(&self) -> &[SimEvent] {
        &self.event_log
    }

    /// Online coordinators, ascending id
    pub fn coordinators(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.online && n.node.is_coordinator())
            .map(|n| n.node.node_id())
            .collect();
        ids.sort();
        ids
    }

    /// Every online node is joined
    pub fn all_joined(&self) -> bool {
        self.nodes
            .iter()
            .filter(|n| n.online)
            .all(|n| n.node.is_network_joined())
    }

    /// Every online node is time-synchronized
    pub fn all_synchronized(&self) -> bool {
        self.nodes
            .iter()
            .filter(|n| n.online)
            .all(|n| n.node.is_time_synchronized())
    }

    /// Largest network-time difference among synchronized online nodes
    pub fn max_time_disagreement_ms(&self) -> u64 {
        let times: Vec<u64> = self
            .nodes
            .iter()
            .filter(|n| n.online && n.node.is_time_synchronized())
            .map(|n| n.node.get_network_time())
            .collect();
        match (times.iter().min(), times.iter().max()) {
            (Some(lo), Some(hi)) => hi - lo,
            _ => 0,
        }
    }

    pub fn report(&self) -> SimReport {
        let now = self.base_clock.now_ms();
        let per_node: Vec<NodeSummary> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(index, n)| {
                let local_now = n.node.now_ms();
                let sync = n.node.time_sync();
                NodeSummary {
                    index,
                    node_id: n.node.node_id(),
                    online: n.online,
                    joined: n.node.is_network_joined(),
                    is_coordinator: n.node.is_coordinator(),
                    coordinator: n.node.get_coordinator_id(),
                    neighbors: n.node.get_active_neighbors().len(),
                    routes: n.node.routes().len(),
                    synchronized: n.node.is_time_synchronized(),
                    stratum: sync.local_stratum(local_now),
                    time_error_ms: n.node.get_network_time() as i64 - now as i64,
                }
            })
            .collect();

        SimReport {
            elapsed_ms: now - START_TIME_MS,
            nodes: self.nodes.len(),
            joined: per_node.iter().filter(|s| s.online && s.joined).count(),
            coordinators: self.coordinators(),
            synchronized: per_node.iter().filter(|s| s.online && s.synchronized).count(),
            max_time_disagreement_ms: self.max_time_disagreement_ms(),
            stats: self.stats.clone(),
            per_node,
        }
    }
}

fn build_links(config: &SimConfig, rng: &mut StdRng) -> BTreeMap<(usize, usize), f32> {
    let n = config.node_count;
    let q = config.link_quality.clamp(0.0, 1.0);
    let mut links = BTreeMap::new();
    match &config.topology {
        Topology::Line => {
            for i in 1..n {
                links.insert(key(i - 1, i), q);
            }
        }
        Topology::Ring => {
            for i in 1..n {
                links.insert(key(i - 1, i), q);
            }
            if n > 2 {
                links.insert(key(n - 1, 0), q);
            }
        }
        Topology::Grid { columns } => {
            let columns = (*columns).max(1);
            for i in 0..n {
                if (i + 1) % columns != 0 && i + 1 < n {
                    links.insert(key(i, i + 1), q);
                }
                if i + columns < n {
                    links.insert(key(i, i + columns), q);
                }
            }
        }
        Topology::RandomGeometric { radius } => {
            let side = (n as f64).sqrt().max(1.0);
            let positions: Vec<(f64, f64)> = (0..n)
                .map(|_| (rng.gen_range(0.0..side), rng.gen_range(0.0..side)))
                .collect();
            for a in 0..n {
                for b in (a + 1)..n {
                    let dx = positions[a].0 - positions[b].0;
                    let dy = positions[a].1 - positions[b].1;
                    let d = (dx * dx + dy * dy).sqrt();
                    if d <= *radius {
                        let quality = 1.0 - 0.5 * (d / radius.max(f64::EPSILON));
                        links.insert(key(a, b), quality as f32);
                    }
                }
            }
        }
        Topology::Explicit(list) => {
            for &(a, b, quality) in list {
                if a != b && a < n && b < n {
                    links.insert(key(a, b), quality.clamp(0.0, 1.0));
                }
            }
        }
    }
    links
}
