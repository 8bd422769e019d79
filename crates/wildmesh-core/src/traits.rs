//! Core traits for the radio transport and the time source
//!
//! The protocol core never touches hardware or the OS clock directly. A
//! deployment supplies a [`Transport`] (LoRa driver, UDP bridge, simulator
//! medium) and a [`Clock`]; tests use the in-memory implementations in
//! [`test_impls`].

use crate::packet::NodeId;
use serde::Serialize;
use std::time::Instant;

/// A frame delivered by the radio
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    /// Raw frame bytes, owned for the duration of one tick
    pub bytes: Vec<u8>,
    /// Per-frame link quality reported by the radio (0.0 - 1.0)
    pub signal_quality: f32,
}

impl ReceivedFrame {
    pub fn new(bytes: Vec<u8>, signal_quality: f32) -> Self {
        Self {
            bytes,
            signal_quality: signal_quality.clamp(0.0, 1.0),
        }
    }
}

/// Half-duplex, single-channel radio as seen by the mesh core
///
/// Sends return `false` when the radio refused the frame; the core treats
/// that as a lost transmission, not an error.
pub trait Transport {
    /// Send to every node in range
    fn broadcast(&mut self, frame: &[u8]) -> bool;

    /// Send to one node in range
    fn send_to(&mut self, dest: NodeId, frame: &[u8]) -> bool;

    /// Take the next received frame, if any
    fn poll_receive(&mut self) -> Option<ReceivedFrame>;

    /// Carrier sense. Radios without CAD report an idle channel.
    fn channel_busy(&self) -> bool {
        false
    }
}

/// Monotonic millisecond clock since boot
pub trait Clock {
    /// Current local time in milliseconds
    fn now_ms(&self) -> u64;
}

/// Clock backed by `std::time::Instant`
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Statistics for mesh network operation
#[derive(Debug, Clone, Default, Serialize)]
pub struct MeshStats {
    /// Frames handed to the transport
    pub frames_tx: u64,
    /// Frames received from the transport
    pub frames_rx: u64,
    /// Bytes handed to the transport
    pub bytes_tx: u64,
    /// Bytes received from the transport
    pub bytes_rx: u64,
    /// Frames relayed on behalf of other nodes
    pub frames_forwarded: u64,
    /// Application payloads delivered locally
    pub payloads_delivered: u64,
    /// Application payloads accepted from collaborators
    pub payloads_sent: u64,
    /// Frames dropped for a bad checksum or malformed layout
    pub dropped_malformed: u64,
    /// Frames dropped because we originated them
    pub dropped_self_echo: u64,
    /// Frames dropped for out-of-range stratum/accuracy/quality fields
    pub dropped_out_of_range: u64,
    /// Flooded frames seen before
    pub duplicates_dropped: u64,
    /// Frames dropped for lack of a fresh route
    pub dropped_no_route: u64,
    /// Frames dropped at the hop limit
    pub hop_limit_exceeded: u64,
    /// Frames refused by a full transmit queue
    pub queue_drops: u64,
    /// Transmissions the radio refused
    pub transport_failures: u64,
    /// Transmit opportunities deferred by backoff
    pub backoffs: u64,
    /// Route discoveries started
    pub route_discoveries: u64,
    /// Current channel utilization estimate (0.0 - 1.0)
    pub channel_utilization: f32,
    /// Known active neighbors
    pub neighbor_count: usize,
    /// Known routes, stale included
    pub route_count: usize,
}

impl MeshStats {
    /// Frames dropped during validation, all causes
    pub fn total_dropped(&self) -> u64 {
        self.dropped_malformed
            + self.dropped_self_echo
            + self.dropped_out_of_range
            + self.duplicates_dropped
            + self.dropped_no_route
            + self.hop_limit_exceeded
    }
}

pub mod test_impls {
    //! In-memory implementations for tests and the simulator.

    use super::*;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Manually advanced clock; clones share the same time
    #[derive(Debug, Clone, Default)]
    pub struct ManualClock {
        current: Rc<Cell<u64>>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn at(time_ms: u64) -> Self {
            let clock = Self::default();
            clock.set(time_ms);
            clock
        }

        /// Jump to the given time
        pub fn set(&self, time_ms: u64) {
            self.current.set(time_ms);
        }

        /// Advance by the given number of milliseconds
        pub fn advance(&self, ms: u64) {
            self.current.set(self.current.get() + ms);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.current.get()
        }
    }

    /// A node-local clock that runs offset and drifting from a shared base
    #[derive(Debug, Clone)]
    pub struct SkewedClock {
        base: ManualClock,
        offset_ms: i64,
        drift_ppm: f64,
    }

    impl SkewedClock {
        pub fn new(base: ManualClock, offset_ms: i64, drift_ppm: f64) -> Self {
            Self {
                base,
                offset_ms,
                drift_ppm,
            }
        }
    }

    impl Clock for SkewedClock {
        fn now_ms(&self) -> u64 {
            let base = self.base.now_ms() as f64;
            let local = base + self.offset_ms as f64 + base * self.drift_ppm / 1_000_000.0;
            local.max(0.0) as u64
        }
    }

    /// A frame captured by [`MemoryTransport`]
    #[derive(Debug, Clone, PartialEq)]
    pub struct SentFrame {
        /// `None` for broadcasts
        pub dest: Option<NodeId>,
        pub bytes: Vec<u8>,
    }

    /// Loopback transport: records sends, replays injected frames
    #[derive(Debug, Default)]
    pub struct MemoryTransport {
        inbound: VecDeque<ReceivedFrame>,
        sent: Vec<SentFrame>,
        refuse_sends: bool,
        busy: bool,
    }

    impl MemoryTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a frame as if it had been received
        pub fn inject_rx(&mut self, bytes: Vec<u8>, signal_quality: f32) {
            self.inbound.push_back(ReceivedFrame::new(bytes, signal_quality));
        }

        /// Take everything sent so far
        pub fn take_sent(&mut self) -> Vec<SentFrame> {
            std::mem::take(&mut self.sent)
        }

        /// Frames sent so far, oldest first
        pub fn sent(&self) -> &[SentFrame] {
            &self.sent
        }

        /// Make subsequent sends fail
        pub fn set_refuse_sends(&mut self, refuse: bool) {
            self.refuse_sends = refuse;
        }

        /// Report the channel as busy
        pub fn set_channel_busy(&mut self, busy: bool) {
            self.busy = busy;
        }
    }

    impl Transport for MemoryTransport {
        fn broadcast(&mut self, frame: &[u8]) -> bool {
            if self.refuse_sends {
                return false;
            }
            self.sent.push(SentFrame {
                dest: None,
                bytes: frame.to_vec(),
            });
            true
        }

        fn send_to(&mut self, dest: NodeId, frame: &[u8]) -> bool {
            if self.refuse_sends {
                return false;
            }
            self.sent.push(SentFrame {
                dest: Some(dest),
                bytes: frame.to_vec(),
            });
            true
        }

        fn poll_receive(&mut self) -> Option<ReceivedFrame> {
            self.inbound.pop_front()
        }

        fn channel_busy(&self) -> bool {
            self.busy
        }
    }
}
