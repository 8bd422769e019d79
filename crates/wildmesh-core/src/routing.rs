//! Route Manager
//!
//! Owns the destination → next-hop table and everything derived from it:
//!
//! - **Cost-based selection**: `cost = hops + (1 - reliability) * K`, lower wins
//! - **Shortest paths**: periodic Dijkstra over the [`LinkGraph`]
//! - **Failover**: up to `max_candidates` distinct next hops per destination
//! - **Load balancing**: routes move off a next hop carrying more than the
//!   threshold share of routes, with hysteresis
//! - **On-demand discovery**: flooded route requests, replies unicast back
//!   along the reverse path
//! - **Forwarding decisions** and stale-route sweeps
//!
//! A missing route is always a normal answer (`None`, [`ForwardDecision::Drop`]),
//! never an error.

use crate::config::RoutingConfig;
use crate::events::MeshEvent;
use crate::message::{Message, Outbound, RouteReply, RouteRequest};
use crate::packet::{Envelope, NodeId};
use crate::topology::LinkGraph;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Costs closer than this are equal
const COST_EPSILON: f32 = 1e-4;

/// A route to a destination node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteEntry {
    /// Destination node ID
    pub destination: NodeId,
    /// Next hop node ID (same as destination if direct)
    pub next_hop: NodeId,
    /// Total hop count to destination
    pub hop_count: u8,
    /// Path reliability (0.0 - 1.0)
    pub reliability: f32,
    /// Derived from hop count and reliability
    pub cost: f32,
    /// Local time the route was last confirmed
    pub last_updated: u64,
    /// Local time the route was last selected
    pub last_used: u64,
}

impl RouteEntry {
    pub fn new(
        destination: NodeId,
        next_hop: NodeId,
        hop_count: u8,
        reliability: f32,
        cost_penalty: f32,
        now: u64,
    ) -> Self {
        let hop_count = hop_count.max(1);
        let reliability = reliability.clamp(0.0, 1.0);
        Self {
            destination,
            next_hop,
            hop_count,
            reliability,
            cost: Self::compute_cost(hop_count, reliability, cost_penalty),
            last_updated: now,
            last_used: now,
        }
    }

    /// `hops + (1 - reliability) * penalty`
    pub fn compute_cost(hop_count: u8, reliability: f32, cost_penalty: f32) -> f32 {
        hop_count as f32 + (1.0 - reliability.clamp(0.0, 1.0)) * cost_penalty
    }

    /// Check if the route has gone unconfirmed for longer than `timeout_ms`
    pub fn is_stale(&self, now: u64, timeout_ms: u64) -> bool {
        now.saturating_sub(self.last_updated) > timeout_ms
    }

    fn set_metrics(&mut self, hop_count: u8, reliability: f32, cost_penalty: f32, now: u64) {
        self.hop_count = hop_count.max(1);
        self.reliability = reliability.clamp(0.0, 1.0);
        self.cost = Self::compute_cost(self.hop_count, self.reliability, cost_penalty);
        self.last_updated = now;
    }
}

/// Outcome of offering a route to the table
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RouteUpdate {
    /// No previous entry for the destination
    Inserted,
    /// Replaced a stale or costlier entry
    Replaced { previous_next_hop: NodeId },
    /// Same next hop re-confirmed; timestamps refreshed only
    Refreshed,
    /// Existing entry is at least as good, or the route was invalid
    Rejected,
}

impl RouteUpdate {
    /// Whether the installed entry changed
    pub fn changed(&self) -> bool {
        matches!(self, RouteUpdate::Inserted | RouteUpdate::Replaced { .. })
    }
}

/// Why a frame will not be forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Frame has crossed the maximum number of links
    HopLimit,
    /// No fresh route to the destination
    NoRoute,
}

/// What to do with a frame addressed to `dest`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecision {
    /// Addressed to this node
    Deliver,
    /// Relay through this next hop
    Forward(NodeId),
    /// Drop silently
    Drop(DropReason),
}

/// Routing table summary for diagnostics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutingStats {
    pub route_count: usize,
    pub fresh_routes: usize,
    pub average_hop_count: f32,
    pub average_reliability: f32,
    pub link_count: usize,
    pub network_diameter: u8,
    pub route_discoveries: u64,
    pub route_replies_sent: u64,
    pub load_balance_switches: u64,
    pub routes_evicted: u64,
    pub failovers: u64,
}

/// Duplicate packet detection cache
#[derive(Debug)]
pub struct DuplicateCache {
    /// Seen packet keys: (source_id, sequence) -> first-seen time
    seen: HashMap<(NodeId, u16), u64>,
    /// TTL for cache entries
    ttl_ms: u64,
    /// Maximum cache size
    max_size: usize,
    /// Time of last cleanup
    last_cleanup: u64,
}

impl DuplicateCache {
    /// Create a new duplicate cache
    pub fn new(ttl_ms: u64, max_size: usize) -> Self {
        Self {
            seen: HashMap::new(),
            ttl_ms,
            max_size: max_size.max(1),
            last_cleanup: 0,
        }
    }

    /// Check if packet is a duplicate, and add to cache if not
    /// Returns true if this is a NEW packet (not a duplicate)
    pub fn check_and_add(&mut self, source: NodeId, sequence: u16, now: u64) -> bool {
        if now.saturating_sub(self.last_cleanup) > self.ttl_ms / 2 {
            self.cleanup(now);
        }

        let key = (source, sequence);
        if let Some(seen_at) = self.seen.get(&key) {
            if now.saturating_sub(*seen_at) < self.ttl_ms {
                return false; // Duplicate
            }
        }

        if self.seen.len() >= self.max_size {
            self.cleanup(now);
            if self.seen.len() >= self.max_size {
                self.evict_oldest();
            }
        }
        self.seen.insert(key, now);
        true
    }

    /// Check if packet is a duplicate without adding
    pub fn is_duplicate(&self, source: NodeId, sequence: u16, now: u64) -> bool {
        self.seen
            .get(&(source, sequence))
            .map(|t| now.saturating_sub(*t) < self.ttl_ms)
            .unwrap_or(false)
    }

    /// Remove expired entries
    pub fn cleanup(&mut self, now: u64) {
        let ttl = self.ttl_ms;
        self.seen.retain(|_, t| now.saturating_sub(*t) < ttl);
        self.last_cleanup = now;
    }

    fn evict_oldest(&mut self) {
        if let Some(key) = self.seen.iter().min_by_key(|(_, t)| **t).map(|(k, _)| *k) {
            self.seen.remove(&key);
        }
    }

    /// Number of entries in cache
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for DuplicateCache {
    fn default() -> Self {
        Self::new(60_000, 256)
    }
}

/// Route Manager for one local node
#[derive(Debug)]
pub struct RouteManager {
    local: NodeId,
    config: RoutingConfig,
    /// Installed route per destination
    routes: HashMap<NodeId, RouteEntry>,
    /// Known alternatives per destination, one per next hop
    candidates: HashMap<NodeId, Vec<RouteEntry>>,
    links: LinkGraph,
    /// Last route request time per destination
    pending_requests: HashMap<NodeId, u64>,
    seen_requests: DuplicateCache,
    last_recompute: Option<u64>,
    last_balance: Option<u64>,
    last_sweep: Option<u64>,
    stats: RoutingStats,
    outbox: Vec<Outbound>,
    events: Vec<MeshEvent>,
}

impl RouteManager {
    /// Create a Route Manager for `local`
    pub fn new(local: NodeId, config: RoutingConfig) -> Self {
        Self {
            local,
            links: LinkGraph::new(
                config.link_half_life_ms,
                config.min_link_quality,
                config.link_timeout_ms,
            ),
            seen_requests: DuplicateCache::new(config.route_timeout_ms, 128),
            config,
            routes: HashMap::new(),
            candidates: HashMap::new(),
            pending_requests: HashMap::new(),
            last_recompute: None,
            last_balance: None,
            last_sweep: None,
            stats: RoutingStats::default(),
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// The link graph routes are computed from
    pub fn links(&self) -> &LinkGraph {
        &self.links
    }

    // ------------------------------------------------------------------
    // Table maintenance
    // ------------------------------------------------------------------

    /// Offer a route; it is installed only if strictly cheaper than the
    /// current entry (or the current entry is stale)
    pub fn offer_route(
        &mut self,
        dest: NodeId,
        next_hop: NodeId,
        hop_count: u8,
        reliability: f32,
        now: u64,
    ) -> RouteUpdate {
        if dest == self.local || dest.is_broadcast() || next_hop == self.local || next_hop.is_broadcast() {
            return RouteUpdate::Rejected;
        }
        let entry = RouteEntry::new(
            dest,
            next_hop,
            hop_count,
            reliability,
            self.config.cost_penalty,
            now,
        );
        self.record_candidate(entry.clone());

        let timeout = self.config.route_timeout_ms;
        match self.routes.get_mut(&dest) {
            None => {
                if self.routes.len() >= self.config.max_routes && !self.evict_worst(now) {
                    return RouteUpdate::Rejected;
                }
                self.routes.insert(dest, entry);
                self.note_change(dest, next_hop);
                RouteUpdate::Inserted
            }
            Some(existing) => {
                if existing.is_stale(now, timeout) || entry.cost + COST_EPSILON < existing.cost {
                    let previous_next_hop = existing.next_hop;
                    let last_used = existing.last_used;
                    *existing = RouteEntry { last_used, ..entry };
                    if previous_next_hop != next_hop {
                        self.note_change(dest, next_hop);
                    }
                    RouteUpdate::Replaced { previous_next_hop }
                } else if existing.next_hop == next_hop && (entry.cost - existing.cost).abs() <= COST_EPSILON {
                    existing.last_updated = now;
                    RouteUpdate::Refreshed
                } else {
                    RouteUpdate::Rejected
                }
            }
        }
    }

    /// Insert or replace the route to `dest` if strictly cheaper.
    /// Returns whether the table changed.
    pub fn add_route(
        &mut self,
        dest: NodeId,
        next_hop: NodeId,
        hop_count: u8,
        reliability: f32,
        now: u64,
    ) -> bool {
        self.offer_route(dest, next_hop, hop_count, reliability, now).changed()
    }

    /// Re-measure a route through a known next hop.
    ///
    /// When the installed route already uses `next_hop`, its metrics are
    /// overwritten even if worse: the measurement supersedes the old one.
    /// Otherwise this is an ordinary [`offer_route`](Self::offer_route).
    fn refresh_route(
        &mut self,
        dest: NodeId,
        next_hop: NodeId,
        hop_count: u8,
        reliability: f32,
        now: u64,
    ) -> RouteUpdate {
        let penalty = self.config.cost_penalty;
        match self.routes.get_mut(&dest) {
            Some(existing) if existing.next_hop == next_hop && dest != self.local => {
                existing.set_metrics(hop_count, reliability, penalty, now);
                let updated = existing.clone();
                self.record_candidate(updated);
                RouteUpdate::Refreshed
            }
            _ => self.offer_route(dest, next_hop, hop_count, reliability, now),
        }
    }

    fn record_candidate(&mut self, entry: RouteEntry) {
        let max = self.config.max_candidates;
        let list = self.candidates.entry(entry.destination).or_default();
        match list.iter_mut().find(|c| c.next_hop == entry.next_hop) {
            Some(slot) => *slot = entry,
            None => {
                list.push(entry);
                if list.len() > max {
                    list.sort_by(|a, b| a.cost.total_cmp(&b.cost));
                    list.truncate(max);
                }
            }
        }
    }

    fn note_change(&mut self, destination: NodeId, next_hop: NodeId) {
        trace!(local = %self.local, %destination, %next_hop, "route installed");
        self.events.push(MeshEvent::RouteChanged {
            destination,
            next_hop,
        });
    }

    /// Evict a stale route, or failing that the costliest one
    fn evict_worst(&mut self, now: u64) -> bool {
        let timeout = self.config.route_timeout_ms;
        let victim = self
            .routes
            .values()
            .max_by(|a, b| {
                a.is_stale(now, timeout)
                    .cmp(&b.is_stale(now, timeout))
                    .then(a.cost.total_cmp(&b.cost))
            })
            .map(|r| r.destination);
        match victim {
            Some(dest) => {
                self.routes.remove(&dest);
                self.candidates.remove(&dest);
                self.stats.routes_evicted += 1;
                true
            }
            None => false,
        }
    }

    /// Remove the route to `dest`
    pub fn remove_route(&mut self, dest: NodeId) -> Option<RouteEntry> {
        self.candidates.remove(&dest);
        self.routes.remove(&dest)
    }

    /// Forget a node entirely: its links, routes to it, and routes through it.
    /// Routes through it fail over to the best fresh alternative.
    pub fn remove_node(&mut self, node: NodeId, now: u64) -> usize {
        self.links.remove_node(node);
        let mut affected = usize::from(self.remove_route(node).is_some());

        for list in self.candidates.values_mut() {
            list.retain(|c| c.next_hop != node);
        }

        let via: Vec<NodeId> = self
            .routes
            .values()
            .filter(|r| r.next_hop == node)
            .map(|r| r.destination)
            .collect();
        for dest in via {
            affected += 1;
            self.routes.remove(&dest);
            if let Some(alt) = self.best_candidate(dest, now, None) {
                self.stats.failovers += 1;
                debug!(local = %self.local, destination = %dest, next_hop = %alt.next_hop, "route failover");
                self.note_change(dest, alt.next_hop);
                self.routes.insert(dest, alt);
            }
        }
        affected
    }

    fn best_candidate(&self, dest: NodeId, now: u64, exclude: Option<NodeId>) -> Option<RouteEntry> {
        let timeout = self.config.route_timeout_ms;
        self.candidates.get(&dest).and_then(|list| {
            list.iter()
                .filter(|c| !c.is_stale(now, timeout) && Some(c.next_hop) != exclude)
                .min_by(|a, b| a.cost.total_cmp(&b.cost).then(a.next_hop.cmp(&b.next_hop)))
                .cloned()
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Fresh route to `dest`, marking it used
    pub fn find_best_route(&mut self, dest: NodeId, now: u64) -> Option<RouteEntry> {
        let timeout = self.config.route_timeout_ms;
        let route = self.routes.get_mut(&dest)?;
        if route.is_stale(now, timeout) {
            return None;
        }
        route.last_used = now;
        Some(route.clone())
    }

    /// Fresh route to `dest` without touching it
    pub fn route(&self, dest: NodeId, now: u64) -> Option<&RouteEntry> {
        self.routes
            .get(&dest)
            .filter(|r| !r.is_stale(now, self.config.route_timeout_ms))
    }

    /// The installed route plus up to `max - 1` alternatives through
    /// other next hops, ascending by cost
    pub fn find_alternative_routes(&self, dest: NodeId, max: usize, now: u64) -> Vec<RouteEntry> {
        if max == 0 {
            return Vec::new();
        }
        let timeout = self.config.route_timeout_ms;
        let primary = self.route(dest, now).cloned();
        let mut alternatives: Vec<RouteEntry> = self
            .candidates
            .get(&dest)
            .map(|list| {
                list.iter()
                    .filter(|c| !c.is_stale(now, timeout))
                    .filter(|c| primary.as_ref().map(|p| p.next_hop != c.next_hop).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        alternatives.sort_by(|a, b| a.cost.total_cmp(&b.cost).then(a.next_hop.cmp(&b.next_hop)));

        let mut result: Vec<RouteEntry> = primary.into_iter().collect();
        result.extend(alternatives);
        result.truncate(max);
        result
    }

    /// Every installed route, stale included
    pub fn routes(&self) -> Vec<&RouteEntry> {
        let mut all: Vec<_> = self.routes.values().collect();
        all.sort_by_key(|r| r.destination);
        all
    }

    /// Number of installed routes, stale included
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Decide whether a frame for `dest` that has already been relayed
    /// `hop_count` times may be forwarded. A frame crosses at most
    /// `max_hops` links.
    pub fn forwarding_decision(&mut self, dest: NodeId, hop_count: u8, now: u64) -> ForwardDecision {
        if dest == self.local {
            return ForwardDecision::Deliver;
        }
        if hop_count.saturating_add(1) >= self.config.max_hops {
            return ForwardDecision::Drop(DropReason::HopLimit);
        }
        match self.find_best_route(dest, now) {
            Some(route) => ForwardDecision::Forward(route.next_hop),
            None => ForwardDecision::Drop(DropReason::NoRoute),
        }
    }

    // ------------------------------------------------------------------
    // Topology inputs
    // ------------------------------------------------------------------

    /// A frame was heard directly from `neighbor`
    pub fn observe_neighbor(&mut self, neighbor: NodeId, quality: f32, now: u64) {
        if neighbor == self.local || neighbor.is_broadcast() || neighbor.is_unknown() {
            return;
        }
        self.links.update_link(self.local, neighbor, quality, None, now);
        let q = self
            .links
            .get(self.local, neighbor)
            .map(|l| l.quality)
            .unwrap_or(quality);
        self.refresh_route(neighbor, neighbor, 1, q, now);
    }

    /// A link between two other nodes, learned second-hand
    pub fn record_remote_link(&mut self, a: NodeId, b: NodeId, quality: f32, now: u64) {
        if a == self.local || b == self.local {
            return;
        }
        self.links.update_link(a, b, quality, None, now);
    }

    /// Record a latency measurement to a direct neighbor
    pub fn record_latency(&mut self, neighbor: NodeId, latency_ms: f32, now: u64) {
        if let Some(link) = self.links.get(self.local, neighbor) {
            let quality = link.quality;
            self.links
                .update_link(self.local, neighbor, quality, Some(latency_ms), now);
        }
    }

    /// Connected components of the known link graph, `known` nodes included
    pub fn connected_components(&self, known: &[NodeId], now: u64) -> Vec<Vec<NodeId>> {
        let mut extra = known.to_vec();
        extra.push(self.local);
        self.links.connected_components(now, &extra)
    }

    // ------------------------------------------------------------------
    // Algorithms
    // ------------------------------------------------------------------

    /// Dijkstra from the local node; installs next hops that beat the
    /// current entries. Returns the number of changed routes.
    pub fn recompute_routes(&mut self, now: u64) -> usize {
        let paths = self
            .links
            .shortest_paths(self.local, now, self.config.latency_normalizer_ms);
        let mut destinations: Vec<_> = paths.into_iter().collect();
        destinations.sort_by_key(|(dest, _)| *dest);

        let mut changed = 0;
        for (dest, path) in destinations {
            if path.hop_count > self.config.max_hops {
                continue;
            }
            if self
                .refresh_route(dest, path.next_hop, path.hop_count, path.reliability, now)
                .changed()
            {
                changed += 1;
            }
        }
        self.last_recompute = Some(now);
        if changed > 0 {
            debug!(local = %self.local, changed, "shortest-path recomputation");
        }
        changed
    }

    /// Next hop load: share of fresh routes using each next hop
    pub fn next_hop_loads(&self, now: u64) -> HashMap<NodeId, f32> {
        let (counts, total) = self.next_hop_counts(now);
        counts
            .into_iter()
            .map(|(hop, n)| (hop, n as f32 / total.max(1) as f32))
            .collect()
    }

    fn next_hop_counts(&self, now: u64) -> (HashMap<NodeId, usize>, usize) {
        let timeout = self.config.route_timeout_ms;
        let mut counts = HashMap::new();
        let mut total = 0;
        for route in self.routes.values().filter(|r| !r.is_stale(now, timeout)) {
            *counts.entry(route.next_hop).or_insert(0) += 1;
            total += 1;
        }
        (counts, total)
    }

    /// Move routes off overloaded next hops. Returns the number of switches.
    ///
    /// A route leaves next hop H only for an alternative whose load after
    /// the switch is at most `hysteresis × load(H)`, so a lone route never
    /// flaps between two equally loaded hops.
    pub fn balance_load(&mut self, now: u64) -> usize {
        self.last_balance = Some(now);
        let (mut counts, total) = self.next_hop_counts(now);
        if total < 2 {
            return 0;
        }
        let timeout = self.config.route_timeout_ms;
        let threshold = self.config.load_balance_threshold;
        let hysteresis = self.config.load_balance_hysteresis;

        let mut destinations: Vec<NodeId> = self
            .routes
            .values()
            .filter(|r| !r.is_stale(now, timeout))
            .map(|r| r.destination)
            .collect();
        destinations.sort();

        let mut switches = 0;
        for dest in destinations {
            let Some(current) = self.routes.get(&dest) else {
                continue;
            };
            // Direct neighbors stay direct
            if current.next_hop == dest {
                continue;
            }
            let current_hop = current.next_hop;
            let current_load = counts.get(&current_hop).copied().unwrap_or(0) as f32 / total as f32;
            if current_load <= threshold {
                continue;
            }

            let choice = self.candidates.get(&dest).and_then(|list| {
                list.iter()
                    .filter(|c| c.next_hop != current_hop && !c.is_stale(now, timeout))
                    .filter(|c| {
                        let after = (counts.get(&c.next_hop).copied().unwrap_or(0) + 1) as f32 / total as f32;
                        after <= hysteresis * current_load
                    })
                    .min_by(|a, b| a.cost.total_cmp(&b.cost).then(a.next_hop.cmp(&b.next_hop)))
                    .cloned()
            });

            if let Some(alt) = choice {
                if let Some(n) = counts.get_mut(&current_hop) {
                    *n = n.saturating_sub(1);
                }
                *counts.entry(alt.next_hop).or_insert(0) += 1;
                debug!(
                    local = %self.local,
                    destination = %dest,
                    from = %current_hop,
                    to = %alt.next_hop,
                    "load balancing switch"
                );
                self.note_change(dest, alt.next_hop);
                self.routes.insert(dest, alt);
                switches += 1;
            }
        }
        self.stats.load_balance_switches += switches as u64;
        switches
    }

    /// Evict stale routes; a stale route with a fresh alternative fails
    /// over instead. Decayed links go too. Returns routes evicted.
    pub fn cleanup_stale_routes(&mut self, now: u64) -> usize {
        self.last_sweep = Some(now);
        let timeout = self.config.route_timeout_ms;

        for list in self.candidates.values_mut() {
            list.retain(|c| !c.is_stale(now, timeout));
        }
        self.candidates.retain(|_, list| !list.is_empty());

        let stale: Vec<NodeId> = self
            .routes
            .values()
            .filter(|r| r.is_stale(now, timeout))
            .map(|r| r.destination)
            .collect();

        let mut evicted = 0;
        for dest in stale {
            match self.best_candidate(dest, now, None) {
                Some(alt) => {
                    self.stats.failovers += 1;
                    self.note_change(dest, alt.next_hop);
                    self.routes.insert(dest, alt);
                }
                None => {
                    self.routes.remove(&dest);
                    evicted += 1;
                }
            }
        }

        let links = self.links.sweep(now);
        let cutoff = self.config.route_request_interval_ms;
        self.pending_requests
            .retain(|_, sent| now.saturating_sub(*sent) < cutoff);

        if evicted > 0 || links > 0 {
            debug!(local = %self.local, evicted, links, "routing sweep");
        }
        self.stats.routes_evicted += evicted as u64;
        evicted
    }

    /// Tick entry point: recomputation, balancing and sweeping on their own periods
    pub fn perform_periodic_tasks(&mut self, now: u64) {
        if due(self.last_recompute, self.config.recompute_interval_ms, now) {
            self.recompute_routes(now);
        }
        if due(self.last_balance, self.config.load_balance_interval_ms, now) {
            self.balance_load(now);
        }
        if due(self.last_sweep, self.config.sweep_interval_ms, now) {
            self.cleanup_stale_routes(now);
        }
    }

    // ------------------------------------------------------------------
    // On-demand discovery
    // ------------------------------------------------------------------

    /// Flood a route request for `dest`, rate-limited per destination.
    /// Returns whether a request was queued.
    pub fn initiate_route_discovery(&mut self, dest: NodeId, now: u64) -> bool {
        if dest == self.local || dest.is_broadcast() || self.route(dest, now).is_some() {
            return false;
        }
        if let Some(sent) = self.pending_requests.get(&dest) {
            if now.saturating_sub(*sent) < self.config.route_request_interval_ms {
                return false;
            }
        }
        self.pending_requests.insert(dest, now);
        self.stats.route_discoveries += 1;
        debug!(local = %self.local, destination = %dest, "route discovery");
        self.outbox.push(Outbound::broadcast(Message::RouteRequest(RouteRequest {
            target: dest,
            path_quality: 1.0,
        })));
        true
    }

    /// Handle a flooded route request
    pub fn process_route_request(&mut self, env: &Envelope, req: &RouteRequest, now: u64) {
        if env.source == self.local {
            return;
        }
        if !self.seen_requests.check_and_add(env.source, env.sequence, now) {
            return;
        }

        let link_quality = self.links.quality(self.local, env.last_hop, now).unwrap_or(1.0);
        let path_quality = req.path_quality * link_quality;
        let hops_back = env.hop_count.saturating_add(1);
        self.offer_route(env.source, env.last_hop, hops_back, path_quality, now);

        let answer = if req.target == self.local {
            Some((0, 1.0))
        } else {
            self.route(req.target, now)
                .filter(|r| r.next_hop != env.last_hop)
                .map(|r| (r.hop_count, r.reliability))
        };

        if let Some((target_hops, quality)) = answer {
            self.stats.route_replies_sent += 1;
            trace!(local = %self.local, originator = %env.source, target = %req.target, "route reply");
            self.outbox.push(Outbound::routed(
                env.source,
                env.last_hop,
                Message::RouteReply(RouteReply {
                    target: req.target,
                    target_hops,
                    path_quality: quality,
                }),
            ));
        } else if hops_back < self.config.max_hops && hops_back < env.max_hops {
            self.outbox.push(Outbound::relay(
                env,
                None,
                Message::RouteRequest(RouteRequest {
                    target: req.target,
                    path_quality,
                }),
            ));
        }
    }

    /// Handle a route reply: learn the forward route, pass the reply on
    /// toward the originator
    pub fn process_route_reply(&mut self, env: &Envelope, rep: &RouteReply, now: u64) {
        let link_quality = self.links.quality(self.local, env.last_hop, now).unwrap_or(1.0);
        let hops_to_replier = env.hop_count.saturating_add(1);
        let quality = rep.path_quality * link_quality;

        self.offer_route(env.source, env.last_hop, hops_to_replier, link_quality, now);
        if rep.target != env.source {
            self.offer_route(
                rep.target,
                env.last_hop,
                hops_to_replier.saturating_add(rep.target_hops),
                quality,
                now,
            );
        }

        if env.destination == self.local {
            self.pending_requests.remove(&rep.target);
            return;
        }

        match self.forwarding_decision(env.destination, env.hop_count, now) {
            ForwardDecision::Forward(next_hop) => {
                self.outbox.push(Outbound::relay(
                    env,
                    Some(next_hop),
                    Message::RouteReply(RouteReply {
                        target: rep.target,
                        target_hops: rep.target_hops,
                        path_quality: quality,
                    }),
                ));
            }
            ForwardDecision::Deliver | ForwardDecision::Drop(_) => {
                trace!(local = %self.local, originator = %env.destination, "route reply dropped");
            }
        }
    }

    // ------------------------------------------------------------------
    // Outputs
    // ------------------------------------------------------------------

    /// Messages waiting for the dispatcher
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Events waiting for the dispatcher
    pub fn take_events(&mut self) -> Vec<MeshEvent> {
        std::mem::take(&mut self.events)
    }

    /// Table and link summary
    pub fn statistics(&self, now: u64) -> RoutingStats {
        let timeout = self.config.route_timeout_ms;
        let fresh: Vec<&RouteEntry> = self
            .routes
            .values()
            .filter(|r| !r.is_stale(now, timeout))
            .collect();
        let n = fresh.len().max(1) as f32;
        RoutingStats {
            route_count: self.routes.len(),
            fresh_routes: fresh.len(),
            average_hop_count: fresh.iter().map(|r| r.hop_count as f32).sum::<f32>() / n,
            average_reliability: fresh.iter().map(|r| r.reliability).sum::<f32>() / n,
            link_count: self.links.len(),
            network_diameter: self.links.diameter(now),
            ..self.stats.clone()
        }
    }
}

/// Reliability of a path learned from a relayed frame. Only the last link
/// was measured; the hops before it are taken to be no better.
pub fn relayed_path_reliability(last_link_quality: f32, hop_count: u8) -> f32 {
    last_link_quality.clamp(0.0, 1.0).powi(hop_count.max(1) as i32)
}

/// Periodic task is due: never run, or period elapsed
pub(crate) fn due(last: Option<u64>, period_ms: u64, now: u64) -> bool {
    match last {
        None => true,
        Some(t) => now.saturating_sub(t) >= period_ms,
    }
}
