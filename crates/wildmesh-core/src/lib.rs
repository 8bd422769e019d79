//! # Wildmesh Core
//!
//! Self-organizing mesh protocol stack for battery-powered radio sensor
//! nodes. Nodes find each other, elect a coordinator, learn multi-hop
//! routes and agree on a shared network time, all over a single
//! half-duplex broadcast channel.
//!
//! ## Overview
//!
//! - **Packet**: binary envelope with CRC-16 framing ([`packet`])
//! - **Messages**: typed payloads for every protocol exchange ([`message`])
//! - **Routing**: link-quality tracking, Dijkstra routes, on-demand
//!   discovery, load balancing ([`routing`], [`topology`])
//! - **Discovery**: beacons, heartbeats, join handshake, coordinator
//!   election and partition detection ([`discovery`])
//! - **Time sync**: four-timestamp offset estimation, stratum hierarchy,
//!   drift compensation ([`sync`])
//! - **MAC**: congestion-aware randomized backoff ([`mac`])
//! - **Node**: the dispatcher tying the managers to a transport ([`node`])
//! - **Simulation**: many nodes over a simulated medium ([`simulation`])
//!
//! ## Layering
//!
//! ```text
//! Application  ── transmit_payload / take_received / drain_events
//!      │
//!   MeshNode   ── validate, dedup, dispatch, forward, frame
//!      │
//!  ┌───┴────────────┬─────────────────┬──────────────────┐
//!  RouteManager  DiscoveryManager  TimeSynchronizer   MacLayer
//!      │
//!  Transport (broadcast / send_to / poll)   Clock (now_ms)
//! ```
//!
//! Managers never touch the radio. They queue [`Outbound`] messages and
//! [`MeshEvent`]s; the node frames, queues and transmits at most one frame
//! per [`MeshNode::tick`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use wildmesh_core::prelude::*;
//! use wildmesh_core::traits::test_impls::{ManualClock, MemoryTransport};
//!
//! let config = MeshConfig::for_node(NodeId::from_u32(0x1000));
//! let clock = ManualClock::at(0);
//! let mut node = MeshNode::new(config, MemoryTransport::new(), clock.clone())?;
//!
//! for _ in 0..100 {
//!     clock.advance(1_000);
//!     node.tick();
//!     for event in node.drain_events() {
//!         println!("{:?}", event);
//!     }
//! }
//! # Ok::<(), wildmesh_core::MeshError>(())
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod mac;
pub mod message;
pub mod node;
pub mod packet;
pub mod routing;
pub mod simulation;
pub mod sync;
pub mod topology;
pub mod traits;

// Re-export main types
pub use config::{DiscoveryConfig, MacConfig, MeshConfig, RoutingConfig, SyncConfig};
pub use discovery::{DiscoveryManager, Membership, NodeInfo, NodeState};
pub use error::{CodecError, ConfigError, MeshError, MeshResult};
pub use events::MeshEvent;
pub use message::{Capabilities, Message, Outbound};
pub use node::{DeliveredPayload, MeshNode, NodeReport};
pub use packet::{Envelope, MessageType, NodeId};
pub use routing::{ForwardDecision, RouteEntry, RouteManager};
pub use sync::{TimeReference, TimeSynchronizer};
pub use traits::{Clock, MeshStats, ReceivedFrame, SystemClock, Transport};

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::MeshConfig;
    pub use crate::error::{MeshError, MeshResult};
    pub use crate::events::MeshEvent;
    pub use crate::node::MeshNode;
    pub use crate::packet::NodeId;
    pub use crate::traits::{Clock, ReceivedFrame, Transport};
}
