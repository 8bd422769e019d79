//! Medium access for a half-duplex, single-channel radio
//!
//! Congestion-aware randomized backoff in front of the transport:
//!
//! 1. Frames wait in a bounded FIFO transmit queue
//! 2. Before each transmission the channel is sensed and the recent
//!    airtime load is estimated
//! 3. Busy or loaded (> `load_threshold`): the backoff window doubles and
//!    the frame is deferred by a random delay in `[w, 3w)`
//! 4. Clear: the window halves toward its floor and one frame goes out
//!
//! ## Channel Utilization
//!
//! Airtime is estimated from frame length (`airtime_per_byte_ms`) for both
//! our transmissions and frames we hear, over a sliding window.

use crate::config::MacConfig;
use crate::error::{MeshError, MeshResult};
use crate::packet::NodeId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use tracing::trace;

/// Sliding-window airtime tracker
#[derive(Debug)]
pub struct ChannelUtilization {
    /// (start time, airtime) per frame on the air
    history: VecDeque<(u64, u64)>,
    window_ms: u64,
}

impl ChannelUtilization {
    pub fn new(window_ms: u64) -> Self {
        Self {
            history: VecDeque::new(),
            window_ms: window_ms.max(1),
        }
    }

    /// Record a frame occupying the channel
    pub fn record(&mut self, now: u64, airtime_ms: u64) {
        self.history.push_back((now, airtime_ms));
        self.prune(now);
    }

    /// Fraction of the window the channel was occupied (0.0 - 1.0)
    pub fn utilization(&self, now: u64) -> f32 {
        let cutoff = now.saturating_sub(self.window_ms);
        let airtime: u64 = self
            .history
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .map(|(_, d)| *d)
            .sum();
        (airtime as f32 / self.window_ms as f32).min(1.0)
    }

    fn prune(&mut self, now: u64) {
        let cutoff = now.saturating_sub(self.window_ms);
        while let Some((time, _)) = self.history.front() {
            if *time < cutoff {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }
}

/// A frame waiting for the channel
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedFrame {
    /// `None` for broadcasts
    pub dest: Option<NodeId>,
    pub bytes: Vec<u8>,
    pub queued_at: u64,
}

/// Transmission decision from the MAC layer
#[derive(Debug, Clone, PartialEq)]
pub enum TransmitDecision {
    /// Transmit the head of the queue now
    TransmitNow,
    /// Deferred until the given local time
    Backoff { until: u64 },
    /// Nothing in queue to send
    NothingToSend,
}

/// MAC layer state for one node
#[derive(Debug)]
pub struct MacLayer {
    config: MacConfig,
    utilization: ChannelUtilization,
    backoff_window_ms: u64,
    backoff_until: Option<u64>,
    tx_queue: VecDeque<QueuedFrame>,
    rng: StdRng,
    backoffs: u64,
}

impl MacLayer {
    /// `seed` drives the backoff jitter; seed per node for reproducible runs
    pub fn new(config: MacConfig, seed: u64) -> Self {
        Self {
            utilization: ChannelUtilization::new(config.utilization_window_ms),
            backoff_window_ms: config.min_backoff_ms,
            backoff_until: None,
            tx_queue: VecDeque::new(),
            rng: StdRng::seed_from_u64(seed),
            backoffs: 0,
            config,
        }
    }

    /// Queue a frame for transmission
    pub fn queue_tx(&mut self, dest: Option<NodeId>, bytes: Vec<u8>, now: u64) -> MeshResult<()> {
        if self.tx_queue.len() >= self.config.max_queue {
            return Err(MeshError::QueueFull);
        }
        self.tx_queue.push_back(QueuedFrame {
            dest,
            bytes,
            queued_at: now,
        });
        Ok(())
    }

    /// Decide whether the head of the queue may go out at `now`
    pub fn can_transmit(&mut self, channel_busy: bool, now: u64) -> TransmitDecision {
        if self.tx_queue.is_empty() {
            return TransmitDecision::NothingToSend;
        }
        if let Some(until) = self.backoff_until {
            if now < until {
                return TransmitDecision::Backoff { until };
            }
            self.backoff_until = None;
        }

        let load = self.utilization.utilization(now);
        if channel_busy || load > self.config.load_threshold {
            self.backoff_window_ms = (self.backoff_window_ms * 2)
                .clamp(self.config.min_backoff_ms, self.config.max_backoff_ms);
            let w = self.backoff_window_ms.max(1);
            let until = now + self.rng.gen_range(w..w * 3);
            self.backoff_until = Some(until);
            self.backoffs += 1;
            trace!(load, channel_busy, window = w, until, "mac backoff");
            return TransmitDecision::Backoff { until };
        }

        self.backoff_window_ms = (self.backoff_window_ms / 2).max(self.config.min_backoff_ms);
        TransmitDecision::TransmitNow
    }

    /// Take the head of the queue (call after `TransmitNow`)
    pub fn start_tx(&mut self) -> Option<QueuedFrame> {
        self.tx_queue.pop_front()
    }

    /// Account for our own transmission
    pub fn tx_complete(&mut self, frame_len: usize, now: u64) {
        let airtime = self.airtime_ms(frame_len);
        self.utilization.record(now, airtime);
    }

    /// Account for a frame heard on the channel
    pub fn rx_observed(&mut self, frame_len: usize, now: u64) {
        let airtime = self.airtime_ms(frame_len);
        self.utilization.record(now, airtime);
    }

    /// Estimated airtime of a frame
    pub fn airtime_ms(&self, frame_len: usize) -> u64 {
        (frame_len as f32 * self.config.airtime_per_byte_ms).ceil() as u64
    }

    pub fn channel_utilization(&self, now: u64) -> f32 {
        self.utilization.utilization(now)
    }

    pub fn backoff_window_ms(&self) -> u64 {
        self.backoff_window_ms
    }

    /// Deferrals so far
    pub fn backoffs(&self) -> u64 {
        self.backoffs
    }

    pub fn queue_depth(&self) -> usize {
        self.tx_queue.len()
    }

    pub fn clear_queue(&mut self) {
        self.tx_queue.clear();
    }
}
