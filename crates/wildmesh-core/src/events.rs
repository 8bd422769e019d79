//! Mesh events and the bounded queue that carries them to the application

use crate::message::RejectReason;
use crate::packet::NodeId;
use serde::Serialize;
use std::collections::VecDeque;

/// Something collaborators may want to react to
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MeshEvent {
    /// First sighting of a node
    NodeDiscovered { node: NodeId },
    /// Node evicted after the neighbor timeout
    NodeLost { node: NodeId },
    /// Join accepted by a coordinator
    NetworkJoined { coordinator: NodeId },
    /// Join attempts exhausted, this node now coordinates
    BecameCoordinator,
    /// Allegiance moved to a higher-id coordinator
    CoordinatorChanged { old: NodeId, new: NodeId },
    /// Our coordinator was evicted; membership reset
    CoordinatorLost { coordinator: NodeId },
    /// A coordinator refused admission
    JoinRejected { coordinator: NodeId, reason: RejectReason },
    /// Link graph split into several components
    PartitionDetected { components: usize },
    /// Installed next hop for a destination changed
    RouteChanged { destination: NodeId, next_hop: NodeId },
    /// A clock correction was applied
    TimeSynchronized { source: NodeId, offset_ms: i64 },
    /// A different reference became primary
    TimeSourceChanged { old: Option<NodeId>, new: NodeId },
    /// No reference refreshed within the sync timeout
    SyncLost,
}

/// FIFO of pending events; the oldest is dropped when full
#[derive(Debug)]
pub struct EventQueue {
    events: VecDeque<MeshEvent>,
    capacity: usize,
    dropped: u64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, event: MeshEvent) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
            self.dropped += 1;
        }
        self.events.push_back(event);
    }

    /// Take the oldest pending event
    pub fn pop(&mut self) -> Option<MeshEvent> {
        self.events.pop_front()
    }

    /// Take every pending event, oldest first
    pub fn drain(&mut self) -> Vec<MeshEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_queue_fifo() {
        let mut queue = EventQueue::new(4);
        queue.push(MeshEvent::BecameCoordinator);
        queue.push(MeshEvent::SyncLost);
        assert_eq!(queue.pop(), Some(MeshEvent::BecameCoordinator));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_event_queue_drops_oldest() {
        let mut queue = EventQueue::new(2);
        for i in 0..3 {
            queue.push(MeshEvent::NodeLost {
                node: NodeId::from_u32(i),
            });
        }
        assert_eq!(queue.dropped(), 1);
        let events = queue.drain();
        assert_eq!(
            events,
            vec![
                MeshEvent::NodeLost { node: NodeId::from_u32(1) },
                MeshEvent::NodeLost { node: NodeId::from_u32(2) },
            ]
        );
        assert!(queue.is_empty());
    }
}
