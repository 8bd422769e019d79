//! Configuration for mesh network behavior
//!
//! All intervals and timeouts are milliseconds of local clock. Every section
//! is `#[serde(default)]`, so a JSON file only needs the fields it changes:
//!
//! ```json
//! { "node_id": 4096, "discovery": { "max_nodes": 20 } }
//! ```

use crate::error::ConfigError;
use crate::message::Capabilities;
use crate::packet::NodeId;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Hard upper bound on hop count for any frame
pub const MAX_HOP_COUNT: u8 = 8;

/// Default node-table capacity of a coordinator
pub const MAX_MESH_NODES: usize = 50;

/// Route Manager tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Routes untouched this long are stale
    pub route_timeout_ms: u64,
    /// Weight K of the unreliability term in `hops + (1 - reliability) * K`
    pub cost_penalty: f32,
    /// Latency that adds one unit of link cost
    pub latency_normalizer_ms: f32,
    /// Next-hop load above which routes are rebalanced
    pub load_balance_threshold: f32,
    /// An alternative must carry at most this fraction of the current load
    pub load_balance_hysteresis: f32,
    /// Frames at this hop count are no longer forwarded
    pub max_hops: u8,
    /// Route table capacity
    pub max_routes: usize,
    /// Candidate next hops remembered per destination
    pub max_candidates: usize,
    /// Link quality halves after this long without a refresh
    pub link_half_life_ms: u64,
    /// Links decayed below this are ignored and swept
    pub min_link_quality: f32,
    /// Links unrefreshed this long are evicted regardless of quality
    pub link_timeout_ms: u64,
    /// Shortest-path recomputation period
    pub recompute_interval_ms: u64,
    /// Load-balancing pass period
    pub load_balance_interval_ms: u64,
    /// Stale-route sweep period
    pub sweep_interval_ms: u64,
    /// Minimum spacing of route requests for one destination
    pub route_request_interval_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            route_timeout_ms: 300_000, // 5 minutes
            cost_penalty: 10.0,
            latency_normalizer_ms: 1000.0,
            load_balance_threshold: 0.7,
            load_balance_hysteresis: 0.8,
            max_hops: MAX_HOP_COUNT,
            max_routes: 64,
            max_candidates: 4,
            link_half_life_ms: 120_000, // 2 minutes
            min_link_quality: 0.05,
            link_timeout_ms: 600_000, // 10 minutes
            recompute_interval_ms: 30_000,
            load_balance_interval_ms: 60_000,
            sweep_interval_ms: 60_000,
            route_request_interval_ms: 10_000,
        }
    }
}

/// Discovery Manager tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Regular beacon period
    pub discovery_interval_ms: u64,
    /// Floor between any two beacons, including partition-triggered ones
    pub min_beacon_interval_ms: u64,
    /// Heartbeat period
    pub heartbeat_interval_ms: u64,
    /// Silent this long: no longer an active neighbor
    pub neighbor_stale_ms: u64,
    /// Silent this long: evicted
    pub neighbor_timeout_ms: u64,
    /// Minimum spacing of join requests to one coordinator
    pub join_retry_interval_ms: u64,
    /// Pending join abandoned after this long without a reply
    pub join_timeout_ms: u64,
    /// Failed attempts before self-promotion to coordinator
    pub max_discovery_attempts: u32,
    /// Coordinator admission capacity, coordinator included
    pub max_nodes: usize,
    /// Coordinator announcement period
    pub coordinator_announce_interval_ms: u64,
    /// Connected-component check period
    pub partition_check_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_interval_ms: 60_000, // 1 minute
            min_beacon_interval_ms: 5_000,
            heartbeat_interval_ms: 30_000,
            neighbor_stale_ms: 90_000,
            neighbor_timeout_ms: 600_000, // 10 minutes
            join_retry_interval_ms: 30_000,
            join_timeout_ms: 10_000,
            max_discovery_attempts: 5,
            max_nodes: MAX_MESH_NODES,
            coordinator_announce_interval_ms: 120_000,
            partition_check_interval_ms: 60_000,
        }
    }
}

/// Time Synchronizer tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Follower request period
    pub sync_interval_ms: u64,
    /// Unsynchronized after 2x this without a refresh
    pub sync_timeout_ms: u64,
    /// Pending request abandoned after this long
    pub request_timeout_ms: u64,
    /// Smallest averaged offset change worth applying
    pub offset_threshold_ms: i64,
    /// Offset samples kept per source
    pub offset_history: usize,
    /// Drift recalibration window
    pub drift_window_ms: u64,
    /// Drift estimates beyond this are discarded as bogus
    pub max_drift_ppm: f64,
    /// Candidate references kept besides the primary
    pub max_candidates: usize,
    /// Reference-node announcement period
    pub announce_interval_ms: u64,
    /// Accuracy (percent) declared by the authoritative source
    pub source_accuracy: u8,
    /// The coordinator acts as stratum-1 source
    pub coordinator_is_time_source: bool,
    /// Synchronized nodes re-announce at their own stratum
    pub relay_announcements: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 120_000, // 2 minutes
            sync_timeout_ms: 120_000,
            request_timeout_ms: 5_000,
            offset_threshold_ms: 10,
            offset_history: 10,
            drift_window_ms: 300_000, // 5 minutes
            max_drift_ppm: 500.0,
            max_candidates: 4,
            announce_interval_ms: 60_000,
            source_accuracy: 95,
            coordinator_is_time_source: true,
            relay_announcements: true,
        }
    }
}

/// Channel access tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacConfig {
    /// Backoff window floor
    pub min_backoff_ms: u64,
    /// Backoff window ceiling
    pub max_backoff_ms: u64,
    /// Channel utilization above which transmissions back off
    pub load_threshold: f32,
    /// Sliding window for the utilization estimate
    pub utilization_window_ms: u64,
    /// Estimated airtime per frame byte
    pub airtime_per_byte_ms: f32,
    /// Transmit queue capacity
    pub max_queue: usize,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            min_backoff_ms: 100,
            max_backoff_ms: 5_000,
            load_threshold: 0.3,
            utilization_window_ms: 60_000,
            airtime_per_byte_ms: 2.0,
            max_queue: 32,
        }
    }
}

/// Complete node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// This node's hardware-derived ID
    pub node_id: NodeId,
    /// Advertised capabilities
    pub capabilities: Capabilities,
    /// Largest application payload accepted by `transmit_payload`
    pub max_payload_size: usize,
    /// Pending events kept before the oldest is dropped
    pub event_queue_capacity: usize,
    /// Duplicate-suppression entry lifetime
    pub dedup_ttl_ms: u64,
    /// Duplicate-suppression capacity
    pub dedup_capacity: usize,
    /// Delivered payloads kept for the application
    pub inbox_capacity: usize,
    pub routing: RoutingConfig,
    pub discovery: DiscoveryConfig,
    pub sync: SyncConfig,
    pub mac: MacConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from_u32(0x0000_0001),
            capabilities: Capabilities::BASIC,
            max_payload_size: 200,
            event_queue_capacity: 64,
            dedup_ttl_ms: 60_000,
            dedup_capacity: 256,
            inbox_capacity: 32,
            routing: RoutingConfig::default(),
            discovery: DiscoveryConfig::default(),
            sync: SyncConfig::default(),
            mac: MacConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Default configuration for the given node
    pub fn for_node(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Self::default()
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.discovery.max_nodes = max_nodes;
        self
    }

    pub fn with_max_discovery_attempts(mut self, attempts: u32) -> Self {
        self.discovery.max_discovery_attempts = attempts;
        self
    }

    pub fn with_time_source(mut self, enabled: bool) -> Self {
        self.sync.coordinator_is_time_source = enabled;
        self
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Pretty JSON rendering
    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check ranges and cross-field ordering
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_broadcast() || self.node_id.is_unknown() {
            return Err(ConfigError::invalid("node_id", "reserved address"));
        }
        if self.max_payload_size == 0 {
            return Err(ConfigError::invalid("max_payload_size", "must be non-zero"));
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::invalid("event_queue_capacity", "must be non-zero"));
        }

        let r = &self.routing;
        if r.cost_penalty <= 0.0 {
            return Err(ConfigError::invalid("routing.cost_penalty", "must be positive"));
        }
        if r.latency_normalizer_ms <= 0.0 {
            return Err(ConfigError::invalid(
                "routing.latency_normalizer_ms",
                "must be positive",
            ));
        }
        unit_interval("routing.load_balance_threshold", r.load_balance_threshold)?;
        unit_interval("routing.load_balance_hysteresis", r.load_balance_hysteresis)?;
        unit_interval("routing.min_link_quality", r.min_link_quality)?;
        if r.max_hops == 0 || r.max_hops > MAX_HOP_COUNT {
            return Err(ConfigError::invalid(
                "routing.max_hops",
                format!("must be within 1..={}", MAX_HOP_COUNT),
            ));
        }
        if r.max_routes == 0 || r.max_candidates == 0 {
            return Err(ConfigError::invalid("routing.max_routes", "tables must hold entries"));
        }
        if r.link_half_life_ms == 0 {
            return Err(ConfigError::invalid("routing.link_half_life_ms", "must be non-zero"));
        }

        let d = &self.discovery;
        if d.neighbor_timeout_ms <= r.route_timeout_ms {
            return Err(ConfigError::invalid(
                "discovery.neighbor_timeout_ms",
                "must exceed routing.route_timeout_ms",
            ));
        }
        if d.neighbor_stale_ms >= d.neighbor_timeout_ms {
            return Err(ConfigError::invalid(
                "discovery.neighbor_stale_ms",
                "must be shorter than neighbor_timeout_ms",
            ));
        }
        if d.min_beacon_interval_ms > d.discovery_interval_ms {
            return Err(ConfigError::invalid(
                "discovery.min_beacon_interval_ms",
                "must not exceed discovery_interval_ms",
            ));
        }
        if d.max_discovery_attempts == 0 {
            return Err(ConfigError::invalid(
                "discovery.max_discovery_attempts",
                "must be at least 1",
            ));
        }
        if d.max_nodes < 2 || d.max_nodes > u8::MAX as usize {
            return Err(ConfigError::invalid("discovery.max_nodes", "must be within 2..=255"));
        }

        let s = &self.sync;
        if s.offset_history == 0 || s.max_candidates == 0 {
            return Err(ConfigError::invalid("sync.offset_history", "must be non-zero"));
        }
        if s.offset_threshold_ms < 0 {
            return Err(ConfigError::invalid("sync.offset_threshold_ms", "must not be negative"));
        }
        if s.source_accuracy > 100 {
            return Err(ConfigError::invalid("sync.source_accuracy", "percent above 100"));
        }
        if s.drift_window_ms == 0 || s.max_drift_ppm <= 0.0 {
            return Err(ConfigError::invalid("sync.drift_window_ms", "must be positive"));
        }

        let m = &self.mac;
        if m.min_backoff_ms == 0 || m.min_backoff_ms > m.max_backoff_ms {
            return Err(ConfigError::invalid(
                "mac.min_backoff_ms",
                "must be non-zero and not exceed max_backoff_ms",
            ));
        }
        unit_interval("mac.load_threshold", m.load_threshold)?;
        if m.utilization_window_ms == 0 || m.max_queue == 0 {
            return Err(ConfigError::invalid("mac.utilization_window_ms", "must be non-zero"));
        }

        Ok(())
    }
}

fn unit_interval(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::invalid(field, format!("{} outside [0, 1]", value)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_config_default() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.routing.route_timeout_ms, 300_000);
        assert_eq!(config.routing.max_hops, MAX_HOP_COUNT);
        assert_eq!(config.discovery.max_nodes, MAX_MESH_NODES);
        assert_eq!(config.sync.offset_history, 10);
        assert!(config.discovery.neighbor_timeout_ms > config.routing.route_timeout_ms);
    }

    #[test]
    fn test_partial_json() {
        let config = MeshConfig::from_json_str(
            r#"{ "node_id": 4096, "discovery": { "max_nodes": 20 } }"#,
        )
        .unwrap();
        assert_eq!(config.node_id, NodeId::from_u32(4096));
        assert_eq!(config.discovery.max_nodes, 20);
        assert_eq!(config.discovery.heartbeat_interval_ms, 30_000);
    }

    #[test]
    fn test_json_round_trip() {
        let config = MeshConfig::for_node(NodeId::from_u32(77)).with_max_nodes(10);
        let json = config.to_json_pretty().unwrap();
        assert_eq!(MeshConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_rejects_neighbor_timeout_below_route_timeout() {
        let mut config = MeshConfig::default();
        config.discovery.neighbor_timeout_ms = 200_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("neighbor_timeout_ms"));
    }

    #[test]
    fn test_rejects_reserved_node_id() {
        let config = MeshConfig::for_node(NodeId::BROADCAST);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_probability() {
        let mut config = MeshConfig::default();
        config.routing.load_balance_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "routing.load_balance_threshold",
                ..
            })
        ));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            MeshConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
