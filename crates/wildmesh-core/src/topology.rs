//! Link graph: measured links, quality decay, shortest paths and partitions
//!
//! Links are undirected and keyed by the ordered pair `(min, max)`, so a
//! link reported by either endpoint lands in the same slot. Quality decays
//! exponentially while a link goes unrefreshed:
//!
//! ```text
//! effective = quality * 0.5 ^ (age / half_life)
//! ```
//!
//! Per-link cost for shortest-path routing is `1 / effective + latency / normalizer`.

use crate::packet::NodeId;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

/// Weight for new quality measurements
const QUALITY_ALPHA: f32 = 0.3;

/// Unordered node pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkKey(NodeId, NodeId);

impl LinkKey {
    pub fn new(a: NodeId, b: NodeId) -> Self {
        if a <= b {
            LinkKey(a, b)
        } else {
            LinkKey(b, a)
        }
    }

    /// Lower endpoint
    pub fn low(&self) -> NodeId {
        self.0
    }

    /// Higher endpoint
    pub fn high(&self) -> NodeId {
        self.1
    }
}

/// A measured radio link between two nodes
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkLink {
    pub node_a: NodeId,
    pub node_b: NodeId,
    /// Quality at last measurement (0.0 - 1.0)
    pub quality: f32,
    /// Estimated one-way latency
    pub latency_ms: f32,
    /// Local time of last measurement
    pub last_measured: u64,
}

impl NetworkLink {
    pub fn key(&self) -> LinkKey {
        LinkKey::new(self.node_a, self.node_b)
    }

    /// Quality after decay since the last measurement
    pub fn effective_quality(&self, now: u64, half_life_ms: u64) -> f32 {
        let age = now.saturating_sub(self.last_measured) as f32;
        let half_life = half_life_ms.max(1) as f32;
        self.quality * 0.5f32.powf(age / half_life)
    }

    /// The endpoint opposite `node`
    pub fn other(&self, node: NodeId) -> Option<NodeId> {
        if self.node_a == node {
            Some(self.node_b)
        } else if self.node_b == node {
            Some(self.node_a)
        } else {
            None
        }
    }
}

/// Result of a shortest-path pass for one destination
#[derive(Debug, Clone, PartialEq)]
pub struct PathInfo {
    /// First hop out of the source
    pub next_hop: NodeId,
    pub hop_count: u8,
    /// Sum of per-link costs
    pub cost: f32,
    /// Product of effective link qualities along the path
    pub reliability: f32,
}

/// Min-heap entry; ties broken on node id for determinism
#[derive(Debug, Clone, Copy)]
struct Frontier {
    cost: f32,
    node: NodeId,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (BinaryHeap is max-heap).
        match other.cost.total_cmp(&self.cost) {
            Ordering::Equal => other.node.cmp(&self.node),
            ord => ord,
        }
    }
}

/// All links this node knows about
#[derive(Debug)]
pub struct LinkGraph {
    links: HashMap<LinkKey, NetworkLink>,
    half_life_ms: u64,
    min_quality: f32,
    link_timeout_ms: u64,
}

impl LinkGraph {
    pub fn new(half_life_ms: u64, min_quality: f32, link_timeout_ms: u64) -> Self {
        Self {
            links: HashMap::new(),
            half_life_ms,
            min_quality,
            link_timeout_ms,
        }
    }

    /// Record a measurement. Returns `true` if the link is new.
    ///
    /// Repeated measurements are smoothed against the decayed quality;
    /// `latency_ms` of `None` keeps the previous estimate.
    pub fn update_link(
        &mut self,
        a: NodeId,
        b: NodeId,
        quality: f32,
        latency_ms: Option<f32>,
        now: u64,
    ) -> bool {
        if a == b {
            return false;
        }
        let quality = quality.clamp(0.0, 1.0);
        let key = LinkKey::new(a, b);
        match self.links.get_mut(&key) {
            Some(link) => {
                let decayed = link.effective_quality(now, self.half_life_ms);
                link.quality = QUALITY_ALPHA * quality + (1.0 - QUALITY_ALPHA) * decayed;
                if let Some(latency) = latency_ms {
                    link.latency_ms = QUALITY_ALPHA * latency + (1.0 - QUALITY_ALPHA) * link.latency_ms;
                }
                link.last_measured = now;
                false
            }
            None => {
                self.links.insert(
                    key,
                    NetworkLink {
                        node_a: key.low(),
                        node_b: key.high(),
                        quality,
                        latency_ms: latency_ms.unwrap_or(0.0),
                        last_measured: now,
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, a: NodeId, b: NodeId) -> Option<&NetworkLink> {
        self.links.get(&LinkKey::new(a, b))
    }

    /// Effective quality of a link, if known and usable
    pub fn quality(&self, a: NodeId, b: NodeId, now: u64) -> Option<f32> {
        self.get(a, b)
            .map(|l| l.effective_quality(now, self.half_life_ms))
            .filter(|q| *q >= self.min_quality)
    }

    /// Remove the link between two nodes
    pub fn remove_link(&mut self, a: NodeId, b: NodeId) -> Option<NetworkLink> {
        self.links.remove(&LinkKey::new(a, b))
    }

    /// Remove every link touching `node`
    pub fn remove_node(&mut self, node: NodeId) -> usize {
        let before = self.links.len();
        self.links.retain(|k, _| k.low() != node && k.high() != node);
        before - self.links.len()
    }

    pub fn links(&self) -> impl Iterator<Item = &NetworkLink> {
        self.links.values()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Usable neighbors of `node` with their effective quality
    pub fn neighbors_of(&self, node: NodeId, now: u64) -> Vec<(NodeId, f32)> {
        let mut out: Vec<_> = self
            .links
            .values()
            .filter_map(|l| {
                let q = l.effective_quality(now, self.half_life_ms);
                if q < self.min_quality {
                    return None;
                }
                l.other(node).map(|n| (n, q))
            })
            .collect();
        out.sort_by_key(|(n, _)| *n);
        out
    }

    /// Every node that appears in a usable link
    pub fn nodes(&self, now: u64) -> HashSet<NodeId> {
        let mut nodes = HashSet::new();
        for (key, link) in &self.links {
            if link.effective_quality(now, self.half_life_ms) >= self.min_quality {
                nodes.insert(key.low());
                nodes.insert(key.high());
            }
        }
        nodes
    }

    fn adjacency(&self, now: u64, latency_normalizer_ms: f32) -> HashMap<NodeId, Vec<(NodeId, f32, f32)>> {
        let mut adj: HashMap<NodeId, Vec<(NodeId, f32, f32)>> = HashMap::new();
        for link in self.links.values() {
            let q = link.effective_quality(now, self.half_life_ms);
            if q < self.min_quality || q <= 0.0 {
                continue;
            }
            let cost = 1.0 / q + link.latency_ms / latency_normalizer_ms;
            adj.entry(link.node_a).or_default().push((link.node_b, cost, q));
            adj.entry(link.node_b).or_default().push((link.node_a, cost, q));
        }
        adj
    }

    /// Dijkstra from `source` over usable links
    ///
    /// Returns an entry for every reachable node other than `source`.
    /// Unreachable nodes are simply absent.
    pub fn shortest_paths(
        &self,
        source: NodeId,
        now: u64,
        latency_normalizer_ms: f32,
    ) -> HashMap<NodeId, PathInfo> {
        let adj = self.adjacency(now, latency_normalizer_ms);
        let mut best: HashMap<NodeId, PathInfo> = HashMap::new();
        let mut settled: HashSet<NodeId> = HashSet::new();
        let mut heap = BinaryHeap::new();

        heap.push(Frontier {
            cost: 0.0,
            node: source,
        });

        while let Some(Frontier { cost, node }) = heap.pop() {
            if !settled.insert(node) {
                continue;
            }
            let (first_hop, hops, reliability) = match best.get(&node) {
                Some(p) => (Some(p.next_hop), p.hop_count, p.reliability),
                None => (None, 0, 1.0),
            };
            let Some(edges) = adj.get(&node) else {
                continue;
            };
            for &(next, link_cost, q) in edges {
                if next == source || settled.contains(&next) {
                    continue;
                }
                let candidate = cost + link_cost;
                let improves = best
                    .get(&next)
                    .map(|p| candidate < p.cost)
                    .unwrap_or(true);
                if improves {
                    best.insert(
                        next,
                        PathInfo {
                            next_hop: first_hop.unwrap_or(next),
                            hop_count: hops.saturating_add(1),
                            cost: candidate,
                            reliability: reliability * q,
                        },
                    );
                    heap.push(Frontier {
                        cost: candidate,
                        node: next,
                    });
                }
            }
        }

        best
    }

    /// Connected components over usable links, plus `extra` nodes as singletons
    ///
    /// Components are sorted internally and by their smallest member.
    pub fn connected_components(&self, now: u64, extra: &[NodeId]) -> Vec<Vec<NodeId>> {
        let mut members: Vec<NodeId> = self.nodes(now).into_iter().collect();
        members.extend(extra.iter().copied());
        members.sort();
        members.dedup();

        let index: HashMap<NodeId, usize> =
            members.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let mut parent: Vec<usize> = (0..members.len()).collect();
        let mut rank: Vec<usize> = vec![0; members.len()];

        fn find(parent: &mut [usize], mut x: usize) -> usize {
            let mut root = x;
            while parent[root] != root {
                root = parent[root];
            }
            // Path compression
            while parent[x] != root {
                let next = parent[x];
                parent[x] = root;
                x = next;
            }
            root
        }

        // Union by rank
        fn union(parent: &mut [usize], rank: &mut [usize], x: usize, y: usize) {
            let px = find(parent, x);
            let py = find(parent, y);
            if px == py {
                return;
            }
            match rank[px].cmp(&rank[py]) {
                Ordering::Less => parent[px] = py,
                Ordering::Greater => parent[py] = px,
                Ordering::Equal => {
                    parent[py] = px;
                    rank[px] += 1;
                }
            }
        }

        for link in self.links.values() {
            if link.effective_quality(now, self.half_life_ms) < self.min_quality {
                continue;
            }
            if let (Some(&a), Some(&b)) = (index.get(&link.node_a), index.get(&link.node_b)) {
                union(&mut parent, &mut rank, a, b);
            }
        }

        let mut groups: HashMap<usize, Vec<NodeId>> = HashMap::new();
        for (i, node) in members.iter().enumerate() {
            let root = find(&mut parent, i);
            groups.entry(root).or_default().push(*node);
        }
        let mut components: Vec<Vec<NodeId>> = groups.into_values().collect();
        for c in &mut components {
            c.sort();
        }
        components.sort_by_key(|c| c.first().copied());
        components
    }

    /// Largest hop-count eccentricity over the usable graph
    pub fn diameter(&self, now: u64) -> u8 {
        let nodes = self.nodes(now);
        let mut diameter = 0u8;
        for start in &nodes {
            let mut depth: HashMap<NodeId, u8> = HashMap::new();
            let mut queue = VecDeque::new();
            depth.insert(*start, 0);
            queue.push_back(*start);
            while let Some(node) = queue.pop_front() {
                let d = depth.get(&node).copied().unwrap_or(0);
                diameter = diameter.max(d);
                for (next, _) in self.neighbors_of(node, now) {
                    if !depth.contains_key(&next) {
                        depth.insert(next, d.saturating_add(1));
                        queue.push_back(next);
                    }
                }
            }
        }
        diameter
    }

    /// Evict decayed or expired links
    pub fn sweep(&mut self, now: u64) -> usize {
        let half_life = self.half_life_ms;
        let min_quality = self.min_quality;
        let timeout = self.link_timeout_ms;
        let before = self.links.len();
        self.links.retain(|_, l| {
            now.saturating_sub(l.last_measured) <= timeout
                && l.effective_quality(now, half_life) >= min_quality
        });
        before - self.links.len()
    }

    pub fn clear(&mut self) {
        self.links.clear();
    }
}

impl Default for LinkGraph {
    fn default() -> Self {
        Self::new(120_000, 0.05, 600_000)
    }
}
