//! Time Synchronizer
//!
//! Hierarchical, NTP-style clock correction over a half-duplex mesh.
//!
//! - The time source (the coordinator by default) announces at stratum 1
//! - Synchronized nodes relay announcements at their own stratum + 1
//! - Followers measure offsets with request/response exchanges
//!   (`((T2-T1)+(T3-T4))/2`) and from announcements (`network + rtt/2 - rx`)
//! - Offsets are averaged per source before a correction is applied, and
//!   small corrections are skipped
//! - Drift (ppm) is recalibrated from the slope of averaged offsets
//!
//! Network time is derived, never stored:
//!
//! ```text
//! network_time(now) = anchor_network + (now - anchor_local) + drift(now - anchor_local)
//! ```
//!
//! where `anchor_network = anchor_local + applied_offset` at the last applied
//! correction.

use crate::config::SyncConfig;
use crate::events::MeshEvent;
use crate::message::{
    Message, Outbound, TimeAnnouncement, TimeSyncRequest, TimeSyncResponse, MAX_STRATUM,
};
use crate::packet::{Envelope, NodeId};
use crate::routing::due;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, trace};

/// Stratum declared by a node with no usable reference
pub const UNSYNCHRONIZED_STRATUM: u8 = MAX_STRATUM + 1;

/// Weight of a new signal-quality reading in a reference's reliability
const RELIABILITY_ALPHA: f32 = 0.2;

/// Four-timestamp clock offset: `((T2 - T1) + (T3 - T4)) / 2`
///
/// T1/T4 are requester clock, T2/T3 responder clock. `None` when the
/// result does not fit an `i64`.
pub fn compute_offset(t1: u64, t2: u64, t3: u64, t4: u64) -> Option<i64> {
    let forward = t2 as i128 - t1 as i128;
    let backward = t3 as i128 - t4 as i128;
    i64::try_from((forward + backward).div_euclid(2)).ok()
}

/// Round trip excluding responder hold time: `(T4 - T1) - (T3 - T2)`
pub fn round_trip(t1: u64, t2: u64, t3: u64, t4: u64) -> Option<u64> {
    let total = t4 as i128 - t1 as i128;
    let hold = t3 as i128 - t2 as i128;
    u64::try_from((total - hold).max(0)).ok()
}

/// Announcement offset: `network + rtt/2 - now`
pub fn announcement_offset(network_time: u64, rtt_ms: u64, now: u64) -> Option<i64> {
    let estimate = network_time as i128 + (rtt_ms / 2) as i128;
    i64::try_from(estimate - now as i128).ok()
}

/// One offset measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OffsetSample {
    /// Local time of the measurement
    pub local_time: u64,
    /// Reference minus local, ms
    pub offset_ms: i64,
}

/// A node whose clock we measure against
#[derive(Debug, Clone, Serialize)]
pub struct TimeReference {
    pub node_id: NodeId,
    /// Reference's network time as last reported
    pub reference_time: u64,
    pub local_time_at_capture: u64,
    /// Averaged offset at the last sample
    pub clock_offset: i64,
    pub stratum: u8,
    /// Declared accuracy, percent
    pub accuracy: u8,
    pub last_sync: u64,
    /// Smoothed signal quality of frames from this reference
    pub reliability: f32,
    pub last_rtt_ms: Option<u64>,
    samples: VecDeque<OffsetSample>,
}

impl TimeReference {
    fn new(node_id: NodeId, stratum: u8, accuracy: u8, signal_quality: f32, now: u64) -> Self {
        Self {
            node_id,
            reference_time: 0,
            local_time_at_capture: now,
            clock_offset: 0,
            stratum,
            accuracy,
            last_sync: now,
            reliability: signal_quality.clamp(0.0, 1.0),
            last_rtt_ms: None,
            samples: VecDeque::new(),
        }
    }

    /// Selection score among equal strata
    pub fn score(&self) -> f32 {
        self.accuracy as f32 / 100.0 * self.reliability
    }

    /// Whether this reference should replace `other` as primary
    pub fn better_than(&self, other: &TimeReference) -> bool {
        self.stratum < other.stratum
            || (self.stratum == other.stratum && self.score() > other.score())
    }

    pub fn samples(&self) -> impl Iterator<Item = &OffsetSample> {
        self.samples.iter()
    }

    /// Mean offset, each sample projected to `now` with the drift estimate
    pub fn averaged_offset(&self, now: u64, drift_ppm: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f64 = self
            .samples
            .iter()
            .map(|s| {
                let age = now.saturating_sub(s.local_time) as f64;
                s.offset_ms as f64 + age * drift_ppm / 1_000_000.0
            })
            .sum();
        Some(sum / self.samples.len() as f64)
    }

    fn push_sample(&mut self, sample: OffsetSample, capacity: usize) {
        self.samples.push_back(sample);
        while self.samples.len() > capacity.max(1) {
            self.samples.pop_front();
        }
    }

    fn is_stale(&self, now: u64, limit_ms: u64) -> bool {
        now.saturating_sub(self.last_sync) > limit_ms
    }
}

/// Result of handling a time-sync message
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncOutcome {
    /// Own message, unsolicited response, or we are the source
    Ignored,
    /// A response to a request was queued
    Responded,
    /// An offset sample was recorded
    Sample { offset_ms: i64, applied: bool },
    /// Timestamps produced an offset outside the representable range
    Rejected,
}

/// Synchronizer status for diagnostics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub synchronized: bool,
    pub is_time_source: bool,
    pub stratum: u8,
    pub primary: Option<NodeId>,
    pub candidates: usize,
    /// Currently applied correction, ms
    pub offset_ms: i64,
    pub drift_ppm: f64,
    pub last_rtt_ms: Option<u64>,
    pub samples_recorded: u64,
    pub corrections_applied: u64,
    pub requests_sent: u64,
    pub responses_sent: u64,
    pub request_timeouts: u64,
    pub announcements_sent: u64,
    pub source_changes: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    target: NodeId,
    sent_at: u64,
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    local: u64,
    network: i64,
}

/// Time Synchronizer for one local node
#[derive(Debug)]
pub struct TimeSynchronizer {
    local: NodeId,
    config: SyncConfig,
    is_time_source: bool,
    references: HashMap<NodeId, TimeReference>,
    primary: Option<NodeId>,
    anchor: Option<Anchor>,
    drift_ppm: f64,
    /// (local time, averaged offset) of the last drift recalibration
    calibration: Option<(u64, f64)>,
    /// Local time of the last sample from the primary
    last_refresh: Option<u64>,
    /// Pending requests keyed by their T1
    pending: HashMap<u64, PendingRequest>,
    last_request: Option<u64>,
    last_announcement: Option<u64>,
    reported_synced: bool,
    stats: SyncStats,
    outbox: Vec<Outbound>,
    events: Vec<MeshEvent>,
}

impl TimeSynchronizer {
    pub fn new(local: NodeId, config: SyncConfig) -> Self {
        Self {
            local,
            config,
            is_time_source: false,
            references: HashMap::new(),
            primary: None,
            anchor: None,
            drift_ppm: 0.0,
            calibration: None,
            last_refresh: None,
            pending: HashMap::new(),
            last_request: None,
            last_announcement: None,
            reported_synced: false,
            stats: SyncStats::default(),
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    /// Take or give up the stratum-1 role. The current network time
    /// estimate carries over so the mesh does not see a jump.
    pub fn set_time_source(&mut self, enabled: bool, now: u64) {
        if enabled == self.is_time_source {
            return;
        }
        self.is_time_source = enabled;
        if enabled {
            info!(local = %self.local, "acting as time source");
            let network = self.network_time(now) as i64;
            self.anchor = Some(Anchor {
                local: now,
                network,
            });
            self.primary = None;
            self.references.clear();
            self.pending.clear();
        } else {
            info!(local = %self.local, "no longer time source");
            self.last_refresh = Some(now);
            self.reported_synced = true;
        }
    }

    pub fn is_time_source(&self) -> bool {
        self.is_time_source
    }

    /// Fresh reference within `2 × sync_timeout`, or we are the source
    pub fn is_time_synchronized(&self, now: u64) -> bool {
        if self.is_time_source {
            return true;
        }
        match self.last_refresh {
            Some(t) => now.saturating_sub(t) <= self.config.sync_timeout_ms * 2,
            None => false,
        }
    }

    /// Synchronized network time; local time when unsynchronized
    pub fn network_time(&self, now: u64) -> u64 {
        match self.anchor {
            Some(anchor) if self.is_time_synchronized(now) => {
                let elapsed = now.saturating_sub(anchor.local);
                let drift = (elapsed as f64 * self.drift_ppm / 1_000_000.0).round() as i64;
                anchor
                    .network
                    .saturating_add(elapsed as i64)
                    .saturating_add(drift)
                    .max(0) as u64
            }
            _ => now,
        }
    }

    /// Correction currently applied at `now`, ms
    pub fn current_offset(&self, now: u64) -> i64 {
        let offset = self.network_time(now) as i128 - now as i128;
        offset.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// 1 for the source, primary + 1 when synchronized, otherwise 16
    pub fn local_stratum(&self, now: u64) -> u8 {
        if self.is_time_source {
            return 1;
        }
        if !self.is_time_synchronized(now) {
            return UNSYNCHRONIZED_STRATUM;
        }
        self.primary_reference()
            .map(|r| r.stratum.saturating_add(1).min(UNSYNCHRONIZED_STRATUM))
            .unwrap_or(UNSYNCHRONIZED_STRATUM)
    }

    fn local_accuracy(&self) -> u8 {
        if self.is_time_source {
            return self.config.source_accuracy.min(100);
        }
        self.primary_reference()
            .map(|r| r.accuracy.saturating_sub(5).max(1))
            .unwrap_or(0)
    }

    pub fn drift_ppm(&self) -> f64 {
        self.drift_ppm
    }

    pub fn primary(&self) -> Option<NodeId> {
        self.primary
    }

    pub fn primary_reference(&self) -> Option<&TimeReference> {
        self.primary.and_then(|id| self.references.get(&id))
    }

    pub fn reference(&self, id: NodeId) -> Option<&TimeReference> {
        self.references.get(&id)
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Broadcast our time, as source or relay. Returns false when we
    /// have nothing trustworthy to announce.
    pub fn broadcast_time_announcement(&mut self, now: u64) -> bool {
        let stratum = self.local_stratum(now);
        if stratum > MAX_STRATUM {
            return false;
        }
        if !self.is_time_source && !self.config.relay_announcements {
            return false;
        }
        let announcement = TimeAnnouncement {
            stratum,
            accuracy: self.local_accuracy().max(1),
            network_time: self.network_time(now),
            send_time: now,
        };
        trace!(local = %self.local, stratum, network_time = announcement.network_time, "time announcement");
        self.outbox
            .push(Outbound::broadcast(Message::TimeAnnouncement(announcement)));
        self.last_announcement = Some(now);
        self.stats.announcements_sent += 1;
        true
    }

    /// Send a timestamped request to `target`; one outstanding per target
    pub fn request_time_sync(&mut self, target: NodeId, now: u64) -> bool {
        if target == self.local || target.is_broadcast() || target.is_unknown() || self.is_time_source {
            return false;
        }
        if self.pending.values().any(|p| p.target == target) {
            return false;
        }
        // T1 doubles as the request key
        if self.pending.contains_key(&now) {
            return false;
        }
        self.pending.insert(
            now,
            PendingRequest {
                target,
                sent_at: now,
            },
        );
        self.outbox.push(Outbound::unicast(
            target,
            Message::TimeSyncRequest(TimeSyncRequest {
                origin_time: now,
                stratum: self.local_stratum(now),
            }),
        ));
        self.last_request = Some(now);
        self.stats.requests_sent += 1;
        debug!(local = %self.local, %target, "time sync request");
        true
    }

    /// Refresh the clock fields of an outgoing time message to the moment
    /// it leaves the radio. Queueing and backoff delay would otherwise be
    /// read as clock offset by the receiver.
    pub fn stamp_outgoing(&mut self, message: &mut Message, now: u64) {
        match message {
            Message::TimeAnnouncement(ann) => {
                ann.network_time = self.network_time(now);
                ann.send_time = now;
            }
            Message::TimeSyncResponse(resp) => {
                resp.transmit_time = self.network_time(now).max(resp.receive_time);
            }
            Message::TimeSyncRequest(req) => {
                let queued_at = req.origin_time;
                if queued_at == now || self.pending.contains_key(&now) {
                    return;
                }
                if let Some(mut pending) = self.pending.remove(&queued_at) {
                    pending.sent_at = now;
                    self.pending.insert(now, pending);
                    req.origin_time = now;
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Dispatch a time-sync message by subtype
    pub fn process_time_sync_message(
        &mut self,
        env: &Envelope,
        message: &Message,
        signal_quality: f32,
        now: u64,
    ) -> SyncOutcome {
        if env.source == self.local {
            return SyncOutcome::Ignored;
        }
        match message {
            Message::TimeAnnouncement(ann) => {
                self.process_announcement(env.source, ann, signal_quality, now)
            }
            Message::TimeSyncRequest(req) => self.process_request(env.source, req, now),
            Message::TimeSyncResponse(resp) => {
                self.process_response(env.source, resp, signal_quality, now)
            }
            _ => SyncOutcome::Ignored,
        }
    }

    fn process_announcement(
        &mut self,
        sender: NodeId,
        ann: &TimeAnnouncement,
        signal_quality: f32,
        now: u64,
    ) -> SyncOutcome {
        if self.is_time_source {
            return SyncOutcome::Ignored;
        }
        let rtt = self.references.get(&sender).and_then(|r| r.last_rtt_ms);
        let Some(offset) = announcement_offset(ann.network_time, rtt.unwrap_or(0), now) else {
            debug!(local = %self.local, %sender, "announcement time out of range");
            return SyncOutcome::Rejected;
        };

        let outcome = self.record_sample(
            sender,
            offset,
            ann.stratum,
            ann.accuracy,
            signal_quality,
            ann.network_time,
            now,
        );
        // Without a round trip the delay estimate is zero; measure one
        if rtt.is_none() && self.primary == Some(sender) {
            self.request_time_sync(sender, now);
        }
        outcome
    }

    fn process_request(&mut self, requester: NodeId, req: &TimeSyncRequest, now: u64) -> SyncOutcome {
        let stratum = self.local_stratum(now);
        if stratum > MAX_STRATUM || stratum >= req.stratum {
            return SyncOutcome::Ignored;
        }
        let t2 = self.network_time(now);
        self.outbox.push(Outbound::unicast(
            requester,
            Message::TimeSyncResponse(TimeSyncResponse {
                origin_time: req.origin_time,
                receive_time: t2,
                transmit_time: self.network_time(now),
                stratum,
                accuracy: self.local_accuracy().max(1),
            }),
        ));
        self.stats.responses_sent += 1;
        trace!(local = %self.local, %requester, "time sync response");
        SyncOutcome::Responded
    }

    fn process_response(
        &mut self,
        responder: NodeId,
        resp: &TimeSyncResponse,
        signal_quality: f32,
        now: u64,
    ) -> SyncOutcome {
        let matches = self
            .pending
            .get(&resp.origin_time)
            .map(|p| p.target == responder)
            .unwrap_or(false);
        if !matches || self.is_time_source {
            return SyncOutcome::Ignored;
        }
        self.pending.remove(&resp.origin_time);

        let (t1, t2, t3, t4) = (resp.origin_time, resp.receive_time, resp.transmit_time, now);
        let (Some(offset), Some(rtt)) = (compute_offset(t1, t2, t3, t4), round_trip(t1, t2, t3, t4))
        else {
            debug!(local = %self.local, %responder, "time sync exchange out of range");
            return SyncOutcome::Rejected;
        };
        debug!(local = %self.local, %responder, offset, rtt, "time sync exchange");

        // Announcement samples taken before the first round trip assumed zero
        // delay; start this reference over from the exchange
        if let Some(reference) = self.references.get_mut(&responder) {
            if reference.last_rtt_ms.is_none() {
                reference.samples.clear();
                if self.primary == Some(responder) {
                    self.calibration = None;
                }
            }
        }

        let outcome = self.record_sample(
            responder,
            offset,
            resp.stratum,
            resp.accuracy,
            signal_quality,
            resp.transmit_time,
            now,
        );
        if let Some(reference) = self.references.get_mut(&responder) {
            reference.last_rtt_ms = Some(rtt);
        }
        self.stats.last_rtt_ms = Some(rtt);
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn record_sample(
        &mut self,
        source: NodeId,
        offset_ms: i64,
        stratum: u8,
        accuracy: u8,
        signal_quality: f32,
        reference_time: u64,
        now: u64,
    ) -> SyncOutcome {
        let capacity = self.config.offset_history;
        let reference = self
            .references
            .entry(source)
            .or_insert_with(|| TimeReference::new(source, stratum, accuracy, signal_quality, now));
        reference.stratum = stratum;
        reference.accuracy = accuracy;
        reference.reliability = (1.0 - RELIABILITY_ALPHA) * reference.reliability
            + RELIABILITY_ALPHA * signal_quality.clamp(0.0, 1.0);
        reference.reference_time = reference_time;
        reference.local_time_at_capture = now;
        reference.last_sync = now;
        reference.push_sample(
            OffsetSample {
                local_time: now,
                offset_ms,
            },
            capacity,
        );
        if let Some(avg) = reference.averaged_offset(now, self.drift_ppm) {
            reference.clock_offset = avg.round() as i64;
        }
        self.stats.samples_recorded += 1;

        self.limit_candidates();
        self.select_primary(now);

        if self.primary != Some(source) {
            return SyncOutcome::Sample {
                offset_ms,
                applied: false,
            };
        }
        let applied = self.apply_primary(now);
        SyncOutcome::Sample { offset_ms, applied }
    }

    fn select_primary(&mut self, now: u64) {
        let stale_limit = self.config.sync_timeout_ms * 2;
        let current = self.primary_reference().cloned();
        let best = self
            .references
            .values()
            .filter(|r| !r.is_stale(now, stale_limit))
            .min_by(|a, b| {
                a.stratum
                    .cmp(&b.stratum)
                    .then(b.score().total_cmp(&a.score()))
                    .then(b.node_id.cmp(&a.node_id))
            })
            .cloned();
        let Some(best) = best else {
            return;
        };

        let switch = match &current {
            None => true,
            Some(cur) if cur.node_id == best.node_id => false,
            Some(cur) => cur.is_stale(now, stale_limit) || best.better_than(cur),
        };
        if switch {
            let old = current.map(|c| c.node_id);
            info!(
                local = %self.local,
                old = ?old,
                new = %best.node_id,
                stratum = best.stratum,
                "time source changed"
            );
            self.primary = Some(best.node_id);
            self.stats.source_changes += 1;
            self.events.push(MeshEvent::TimeSourceChanged {
                old,
                new: best.node_id,
            });
        }
    }

    /// Apply the primary's averaged offset if it moved past the threshold
    fn apply_primary(&mut self, now: u64) -> bool {
        let Some(reference) = self.primary_reference() else {
            return false;
        };
        let source = reference.node_id;
        let Some(avg) = reference.averaged_offset(now, self.drift_ppm) else {
            return false;
        };

        let was_synced = self.is_time_synchronized(now);
        let current = if was_synced && self.anchor.is_some() {
            Some(self.current_offset(now) as f64)
        } else {
            None
        };
        let applied = match current {
            Some(cur) => (avg - cur).abs() > self.config.offset_threshold_ms as f64,
            None => true,
        };

        if applied {
            let offset_ms = avg.round() as i64;
            self.anchor = Some(Anchor {
                local: now,
                network: (now as i64).saturating_add(offset_ms),
            });
            self.stats.corrections_applied += 1;
            debug!(local = %self.local, %source, offset_ms, "clock correction applied");
            self.events.push(MeshEvent::TimeSynchronized { source, offset_ms });
        }
        self.last_refresh = Some(now);
        self.reported_synced = true;
        self.recalibrate_drift(avg, now);
        applied
    }

    fn recalibrate_drift(&mut self, avg: f64, now: u64) {
        match self.calibration {
            None => self.calibration = Some((now, avg)),
            Some((t0, avg0)) => {
                let elapsed = now.saturating_sub(t0);
                if elapsed < self.config.drift_window_ms {
                    return;
                }
                let ppm = (avg - avg0) / elapsed as f64 * 1_000_000.0;
                if ppm.abs() <= self.config.max_drift_ppm {
                    debug!(local = %self.local, drift_ppm = ppm, "drift recalibrated");
                    self.drift_ppm = ppm;
                }
                self.calibration = Some((now, avg));
            }
        }
    }

    /// Keep the primary plus the best `max_candidates` others
    fn limit_candidates(&mut self) {
        let limit = self.config.max_candidates + 1;
        while self.references.len() > limit {
            let primary = self.primary;
            let worst = self
                .references
                .values()
                .filter(|r| Some(r.node_id) != primary)
                .max_by(|a, b| {
                    a.stratum
                        .cmp(&b.stratum)
                        .then(b.score().total_cmp(&a.score()))
                })
                .map(|r| r.node_id);
            match worst {
                Some(id) => {
                    self.references.remove(&id);
                }
                None => break,
            }
        }
    }

    // ------------------------------------------------------------------
    // Periodic
    // ------------------------------------------------------------------

    /// Tick entry point. `coordinator` is the request target of last
    /// resort when no reference is known.
    pub fn perform_periodic_tasks(&mut self, coordinator: Option<NodeId>, now: u64) {
        let timeout = self.config.request_timeout_ms;
        let before = self.pending.len();
        self.pending
            .retain(|_, p| now.saturating_sub(p.sent_at) <= timeout);
        let expired = before - self.pending.len();
        if expired > 0 {
            trace!(local = %self.local, expired, "time sync requests timed out");
            self.stats.request_timeouts += expired as u64;
        }

        let stale_limit = self.config.sync_timeout_ms * 2;
        self.references.retain(|_, r| !r.is_stale(now, stale_limit));
        if let Some(primary) = self.primary {
            if !self.references.contains_key(&primary) {
                self.primary = None;
                self.select_primary(now);
            }
        }

        if self.reported_synced && !self.is_time_synchronized(now) {
            info!(local = %self.local, "time synchronization lost");
            self.reported_synced = false;
            self.primary = None;
            self.events.push(MeshEvent::SyncLost);
        }

        if due(self.last_announcement, self.config.announce_interval_ms, now)
            && (self.is_time_source || self.is_time_synchronized(now))
        {
            self.broadcast_time_announcement(now);
        }

        if !self.is_time_source && due(self.last_request, self.config.sync_interval_ms, now) {
            let target = self
                .primary
                .or(coordinator)
                .filter(|c| *c != self.local && !c.is_unknown());
            match target {
                Some(target) => {
                    self.request_time_sync(target, now);
                }
                None => self.last_request = Some(now),
            }
        }
    }

    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<MeshEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn statistics(&self, now: u64) -> SyncStats {
        SyncStats {
            synchronized: self.is_time_synchronized(now),
            is_time_source: self.is_time_source,
            stratum: self.local_stratum(now),
            primary: self.primary,
            candidates: self.references.len(),
            offset_ms: self.current_offset(now),
            drift_ppm: self.drift_ppm,
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MessageType;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const A: NodeId = NodeId::from_u32(0xA);
    const B: NodeId = NodeId::from_u32(0xB);
    const C: NodeId = NodeId::from_u32(0xC);

    fn env(message_type: MessageType, source: NodeId, dest: NodeId) -> Envelope {
        Envelope {
            message_type,
            source,
            last_hop: source,
            destination: dest,
            sequence: 1,
            hop_count: 0,
            max_hops: 8,
            timestamp: 0,
            payload: Vec::new(),
        }
    }

    fn response(t1: u64, t2: u64, t3: u64, stratum: u8, accuracy: u8) -> Message {
        Message::TimeSyncResponse(TimeSyncResponse {
            origin_time: t1,
            receive_time: t2,
            transmit_time: t3,
            stratum,
            accuracy,
        })
    }

    fn announce(stratum: u8, accuracy: u8, network_time: u64) -> Message {
        Message::TimeAnnouncement(TimeAnnouncement {
            stratum,
            accuracy,
            network_time,
            send_time: 0,
        })
    }

    #[test]
    fn test_four_timestamp_offset() {
        assert_eq!(compute_offset(1000, 1050, 1060, 1120), Some(-5));
        assert_eq!(round_trip(1000, 1050, 1060, 1120), Some(110));
        assert_eq!(compute_offset(0, u64::MAX, u64::MAX, 0), None);
        assert_eq!(announcement_offset(2_000, 500, 1_000), Some(1_250));
        assert_eq!(announcement_offset(u64::MAX, u64::MAX, 0), None);
    }

    #[test]
    fn test_exchange_scenario() {
        let mut b = TimeSynchronizer::new(B, SyncConfig::default());
        assert!(b.request_time_sync(A, 1000));
        let out = b.take_outbound();
        assert_eq!(out[0].destination, A);

        let outcome = b.process_time_sync_message(
            &env(MessageType::TimeSyncResponse, A, B),
            &response(1000, 1050, 1060, 1, 95),
            0.9,
            1120,
        );
        assert_eq!(
            outcome,
            SyncOutcome::Sample {
                offset_ms: -5,
                applied: true
            }
        );
        assert!(b.is_time_synchronized(1120));
        assert_eq!(b.network_time(1120), 1115);
        assert_eq!(b.local_stratum(1120), 2);
        assert_eq!(b.reference(A).unwrap().last_rtt_ms, Some(110));
    }

    #[test]
    fn test_unsolicited_response_ignored() {
        let mut b = TimeSynchronizer::new(B, SyncConfig::default());
        let outcome = b.process_time_sync_message(
            &env(MessageType::TimeSyncResponse, A, B),
            &response(1000, 1050, 1060, 1, 95),
            0.9,
            1120,
        );
        assert_eq!(outcome, SyncOutcome::Ignored);
        assert!(!b.is_time_synchronized(1120));
    }

    #[test]
    fn test_source_answers_requests() {
        let mut a = TimeSynchronizer::new(A, SyncConfig::default());
        a.set_time_source(true, 0);
        let req = Message::TimeSyncRequest(TimeSyncRequest {
            origin_time: 500,
            stratum: UNSYNCHRONIZED_STRATUM,
        });
        let outcome = a.process_time_sync_message(&env(MessageType::TimeSyncRequest, B, A), &req, 0.9, 700);
        assert_eq!(outcome, SyncOutcome::Responded);
        match &a.take_outbound()[0].message {
            Message::TimeSyncResponse(resp) => {
                assert_eq!(resp.origin_time, 500);
                assert_eq!(resp.receive_time, 700);
                assert_eq!(resp.stratum, 1);
                assert_eq!(resp.accuracy, 95);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unsynced_node_does_not_answer() {
        let mut b = TimeSynchronizer::new(B, SyncConfig::default());
        let req = Message::TimeSyncRequest(TimeSyncRequest {
            origin_time: 500,
            stratum: UNSYNCHRONIZED_STRATUM,
        });
        let outcome = b.process_time_sync_message(&env(MessageType::TimeSyncRequest, C, B), &req, 0.9, 700);
        assert_eq!(outcome, SyncOutcome::Ignored);
    }

    #[test]
    fn test_offset_convergence_with_jitter() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut config = SyncConfig::default();
        config.drift_window_ms = 3_600_000;
        let mut b = TimeSynchronizer::new(B, config);
        let true_offset: i64 = 250;
        let mut now = 10_000u64;
        for _ in 0..10 {
            let t1 = now;
            let d1 = rng.gen_range(10..30u64);
            let d2 = rng.gen_range(10..30u64);
            let t2 = (t1 as i64 + d1 as i64 + true_offset) as u64;
            let t3 = t2 + 5;
            let t4 = (t3 as i64 - true_offset) as u64 + d2;
            assert!(b.request_time_sync(A, t1));
            b.process_time_sync_message(
                &env(MessageType::TimeSyncResponse, A, B),
                &response(t1, t2, t3, 1, 95),
                0.9,
                t4,
            );
            now += 120_000;
        }
        let avg = b.reference(A).unwrap().clock_offset;
        assert!((avg - true_offset).abs() <= 10, "averaged offset {}", avg);
        let applied = b.current_offset(now - 120_000 + 50);
        assert!((applied - true_offset).abs() <= 10, "applied offset {}", applied);
    }

    #[test]
    fn test_small_correction_skipped() {
        let mut b = TimeSynchronizer::new(B, SyncConfig::default());
        b.process_time_sync_message(&env(MessageType::TimeAnnouncement, A, NodeId::BROADCAST), &announce(1, 95, 1_100), 0.9, 1_000);
        assert_eq!(b.current_offset(1_000), 100);
        // Average moves to 102: under the threshold
        let outcome = b.process_time_sync_message(&env(MessageType::TimeAnnouncement, A, NodeId::BROADCAST), &announce(1, 95, 2_104), 0.9, 2_000);
        assert_eq!(
            outcome,
            SyncOutcome::Sample {
                offset_ms: 104,
                applied: false
            }
        );
        assert_eq!(b.current_offset(2_000), 100);
        // A large jump is applied
        b.process_time_sync_message(&env(MessageType::TimeAnnouncement, A, NodeId::BROADCAST), &announce(1, 95, 3_400), 0.9, 3_000);
        assert_eq!(b.current_offset(3_000), 201);
    }

    #[test]
    fn test_reference_selection() {
        let mut c = TimeSynchronizer::new(C, SyncConfig::default());
        c.process_time_sync_message(&env(MessageType::TimeAnnouncement, B, NodeId::BROADCAST), &announce(2, 90, 1_000), 0.9, 1_000);
        assert_eq!(c.primary(), Some(B));
        // Lower stratum wins
        c.process_time_sync_message(&env(MessageType::TimeAnnouncement, A, NodeId::BROADCAST), &announce(1, 50, 1_000), 0.5, 1_000);
        assert_eq!(c.primary(), Some(A));
        // Higher stratum never does, however accurate
        c.process_time_sync_message(&env(MessageType::TimeAnnouncement, B, NodeId::BROADCAST), &announce(2, 100, 1_000), 1.0, 1_100);
        assert_eq!(c.primary(), Some(A));
        let events = c.take_events();
        assert!(events.contains(&MeshEvent::TimeSourceChanged { old: Some(B), new: A }));
    }

    #[test]
    fn test_equal_stratum_prefers_score() {
        let mut c = TimeSynchronizer::new(C, SyncConfig::default());
        c.process_time_sync_message(&env(MessageType::TimeAnnouncement, A, NodeId::BROADCAST), &announce(2, 50, 1_000), 0.5, 1_000);
        c.process_time_sync_message(&env(MessageType::TimeAnnouncement, B, NodeId::BROADCAST), &announce(2, 50, 1_000), 0.5, 1_000);
        assert_eq!(c.primary(), Some(A));
        c.process_time_sync_message(&env(MessageType::TimeAnnouncement, B, NodeId::BROADCAST), &announce(2, 99, 1_000), 1.0, 1_000);
        assert_eq!(c.primary(), Some(B));
    }

    #[test]
    fn test_sync_lost_after_timeout() {
        let config = SyncConfig::default();
        let limit = config.sync_timeout_ms * 2;
        let mut b = TimeSynchronizer::new(B, config);
        b.process_time_sync_message(&env(MessageType::TimeAnnouncement, A, NodeId::BROADCAST), &announce(1, 95, 5_000), 0.9, 1_000);
        assert!(b.is_time_synchronized(1_000 + limit));
        assert_eq!(b.network_time(1_000 + limit), 5_000 + limit);

        let later = 1_001 + limit;
        assert!(!b.is_time_synchronized(later));
        assert_eq!(b.network_time(later), later);
        assert_eq!(b.local_stratum(later), UNSYNCHRONIZED_STRATUM);

        b.take_events();
        b.perform_periodic_tasks(None, later);
        assert!(b.take_events().contains(&MeshEvent::SyncLost));
    }

    #[test]
    fn test_drift_recalibration() {
        let mut config = SyncConfig::default();
        config.offset_history = 1;
        let window = config.drift_window_ms;
        let mut b = TimeSynchronizer::new(B, config);
        // Offset grows by 30 ms over the window: 100 ppm
        b.process_time_sync_message(&env(MessageType::TimeAnnouncement, A, NodeId::BROADCAST), &announce(1, 95, 1_000 + 100), 0.9, 1_000);
        let t = 1_000 + window;
        b.process_time_sync_message(&env(MessageType::TimeAnnouncement, A, NodeId::BROADCAST), &announce(1, 95, t + 130), 0.9, t);
        assert!((b.drift_ppm() - 100.0).abs() < 1e-6);
        // Drift keeps accumulating between corrections
        assert_eq!(b.current_offset(t + 100_000), 140);
    }

    #[test]
    fn test_bogus_drift_discarded() {
        let mut config = SyncConfig::default();
        config.offset_history = 1;
        let window = config.drift_window_ms;
        let mut b = TimeSynchronizer::new(B, config);
        b.process_time_sync_message(&env(MessageType::TimeAnnouncement, A, NodeId::BROADCAST), &announce(1, 95, 1_000), 0.9, 1_000);
        let t = 1_000 + window;
        b.process_time_sync_message(&env(MessageType::TimeAnnouncement, A, NodeId::BROADCAST), &announce(1, 95, t + 10_000), 0.9, t);
        assert_eq!(b.drift_ppm(), 0.0);
    }

    #[test]
    fn test_relay_announces_next_stratum() {
        let mut b = TimeSynchronizer::new(B, SyncConfig::default());
        assert!(!b.broadcast_time_announcement(0));
        b.process_time_sync_message(&env(MessageType::TimeAnnouncement, A, NodeId::BROADCAST), &announce(1, 95, 1_000), 0.9, 1_000);
        b.take_outbound();
        assert!(b.broadcast_time_announcement(1_000));
        match &b.take_outbound()[0].message {
            Message::TimeAnnouncement(ann) => {
                assert_eq!(ann.stratum, 2);
                assert_eq!(ann.accuracy, 90);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_first_announcement_requests_round_trip() {
        let mut b = TimeSynchronizer::new(B, SyncConfig::default());
        b.process_time_sync_message(&env(MessageType::TimeAnnouncement, A, NodeId::BROADCAST), &announce(1, 95, 1_000), 0.9, 1_000);
        let out = b.take_outbound();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].message, Message::TimeSyncRequest(_)));
    }

    #[test]
    fn test_exchange_replaces_zero_delay_samples() {
        let mut b = TimeSynchronizer::new(B, SyncConfig::default());
        // True offset 200 ms, 100 ms each way: the announcement reads 100
        b.process_time_sync_message(&env(MessageType::TimeAnnouncement, A, NodeId::BROADCAST), &announce(1, 95, 1_100), 0.9, 1_000);
        assert_eq!(b.current_offset(1_000), 100);
        assert!(matches!(b.take_outbound()[0].message, Message::TimeSyncRequest(_)));

        b.process_time_sync_message(
            &env(MessageType::TimeSyncResponse, A, B),
            &response(1_000, 1_300, 1_300, 1, 95),
            0.9,
            1_200,
        );
        assert_eq!(b.reference(A).unwrap().clock_offset, 200);
        assert_eq!(b.current_offset(1_200), 200);
        assert_eq!(b.reference(A).unwrap().samples().count(), 1);
    }

    #[test]
    fn test_out_of_range_exchange_rejected() {
        let mut b = TimeSynchronizer::new(B, SyncConfig::default());
        assert!(b.request_time_sync(A, 1_000));
        let outcome = b.process_time_sync_message(
            &env(MessageType::TimeSyncResponse, A, B),
            &response(1_000, u64::MAX, u64::MAX, 1, 95),
            0.9,
            1_120,
        );
        assert_eq!(outcome, SyncOutcome::Rejected);
        assert!(!b.is_time_synchronized(1_120));

        let outcome = b.process_time_sync_message(
            &env(MessageType::TimeAnnouncement, A, NodeId::BROADCAST),
            &announce(1, 95, u64::MAX),
            0.9,
            2_000,
        );
        assert_eq!(outcome, SyncOutcome::Rejected);
        assert!(b.primary().is_none());
    }

    #[test]
    fn test_request_stamped_at_transmit() {
        let mut b = TimeSynchronizer::new(B, SyncConfig::default());
        assert!(b.request_time_sync(A, 1_000));
        let mut message = b.take_outbound().remove(0).message;
        // Waited 600 ms in the transmit queue
        b.stamp_outgoing(&mut message, 1_600);
        match &message {
            Message::TimeSyncRequest(req) => assert_eq!(req.origin_time, 1_600),
            other => panic!("unexpected {:?}", other),
        }

        let stale = b.process_time_sync_message(
            &env(MessageType::TimeSyncResponse, A, B),
            &response(1_000, 1_700, 1_700, 1, 95),
            0.9,
            1_800,
        );
        assert_eq!(stale, SyncOutcome::Ignored);
        let outcome = b.process_time_sync_message(
            &env(MessageType::TimeSyncResponse, A, B),
            &response(1_600, 1_700, 1_700, 1, 95),
            0.9,
            1_800,
        );
        assert_eq!(
            outcome,
            SyncOutcome::Sample {
                offset_ms: 0,
                applied: true
            }
        );
        assert_eq!(b.reference(A).unwrap().last_rtt_ms, Some(200));
    }

    #[test]
    fn test_announcement_and_response_stamped_at_transmit() {
        let mut a = TimeSynchronizer::new(A, SyncConfig::default());
        a.set_time_source(true, 0);
        assert!(a.broadcast_time_announcement(1_000));
        let mut message = a.take_outbound().remove(0).message;
        a.stamp_outgoing(&mut message, 1_750);
        match &message {
            Message::TimeAnnouncement(ann) => {
                assert_eq!(ann.network_time, 1_750);
                assert_eq!(ann.send_time, 1_750);
            }
            other => panic!("unexpected {:?}", other),
        }

        let req = Message::TimeSyncRequest(TimeSyncRequest {
            origin_time: 500,
            stratum: UNSYNCHRONIZED_STRATUM,
        });
        a.process_time_sync_message(&env(MessageType::TimeSyncRequest, B, A), &req, 0.9, 2_000);
        let mut message = a.take_outbound().remove(0).message;
        a.stamp_outgoing(&mut message, 2_500);
        match &message {
            Message::TimeSyncResponse(resp) => {
                assert_eq!(resp.origin_time, 500);
                assert_eq!(resp.receive_time, 2_000);
                assert_eq!(resp.transmit_time, 2_500);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pending_requests_expire() {
        let mut b = TimeSynchronizer::new(B, SyncConfig::default());
        assert!(b.request_time_sync(A, 0));
        assert!(!b.request_time_sync(A, 1_000));
        b.perform_periodic_tasks(None, 5_001);
        assert_eq!(b.statistics(5_001).request_timeouts, 1);
        assert!(b.request_time_sync(A, 6_000));
    }

    #[test]
    fn test_time_source_keeps_network_time() {
        let mut b = TimeSynchronizer::new(B, SyncConfig::default());
        b.process_time_sync_message(&env(MessageType::TimeAnnouncement, A, NodeId::BROADCAST), &announce(1, 95, 1_500), 0.9, 1_000);
        b.set_time_source(true, 2_000);
        assert_eq!(b.network_time(2_000), 2_500);
        assert_eq!(b.network_time(1_002_000), 1_002_500);
        assert_eq!(b.local_stratum(2_000), 1);
    }
}
