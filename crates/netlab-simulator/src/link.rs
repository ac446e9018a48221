//! Point-to-point links and the drop-tail queue in front of each device.

use netlab_abstract::{DataRate, Packet, SimTime};
use serde::Serialize;
use std::collections::VecDeque;

use crate::node::InterfaceId;

/// Framing added by a point-to-point device on top of the IPv4 datagram.
pub const PPP_HEADER_BYTES: u32 = 2;

#[derive(Debug, Clone)]
pub struct Link {
    pub endpoints: [InterfaceId; 2],
    pub data_rate: DataRate,
    pub delay: SimTime,
}

impl Link {
    /// The interface at the other end of the link.
    pub fn peer(&self, iface: InterfaceId) -> InterfaceId {
        if self.endpoints[0] == iface {
            self.endpoints[1]
        } else {
            self.endpoints[0]
        }
    }

    /// Serialization time of a packet on this link.
    pub fn transmission_time(&self, packet: &Packet) -> SimTime {
        self.data_rate
            .transmission_time(packet.wire_size() + PPP_HEADER_BYTES)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub transmitted_packets: u64,
    pub transmitted_bytes: u64,
    pub max_backlog: usize,
}

/// Bounded FIFO that refuses new arrivals when full.
///
/// An accepted packet occupies its slot until it reaches the peer, so a
/// packet still propagating counts against the capacity.
#[derive(Debug)]
pub struct DropTailQueue {
    capacity: usize,
    /// (uid, wire bytes) of packets waiting or in transmission
    backlog: VecDeque<(u64, u32)>,
    pub stats: QueueStats,
}

impl DropTailQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            backlog: VecDeque::with_capacity(capacity.min(1024)),
            stats: QueueStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backlog.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.backlog.len() >= self.capacity
    }

    pub fn push(&mut self, uid: u64, bytes: u32) -> bool {
        if self.is_full() {
            self.stats.dropped += 1;
            return false;
        }
        self.backlog.push_back((uid, bytes));
        self.stats.enqueued += 1;
        self.stats.max_backlog = self.stats.max_backlog.max(self.backlog.len());
        true
    }

    pub fn pop(&mut self) -> Option<u64> {
        let (uid, bytes) = self.backlog.pop_front()?;
        self.stats.transmitted_packets += 1;
        self.stats.transmitted_bytes += bytes as u64;
        Some(uid)
    }
}

/// Timing of an accepted packet, fixed at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transmission {
    /// Serialization finishes and the transmitter is free again.
    pub tx_end: SimTime,
    /// The last bit reaches the peer interface and the queue slot is released.
    pub arrival: SimTime,
}

/// Transmit side of a device: its queue and the time its transmitter frees up.
#[derive(Debug)]
pub struct TxQueue {
    pub queue: DropTailQueue,
    busy_until: SimTime,
}

impl TxQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: DropTailQueue::new(capacity),
            busy_until: SimTime::ZERO,
        }
    }

    /// Admit `packet` onto `link` at `now`, or refuse it if the queue is full.
    pub fn enqueue(&mut self, now: SimTime, packet: &Packet, link: &Link) -> Option<Transmission> {
        if !self.queue.push(packet.uid, packet.wire_size()) {
            return None;
        }
        let start = now.max(self.busy_until);
        let tx_end = start + link.transmission_time(packet);
        self.busy_until = tx_end;
        Some(Transmission {
            tx_end,
            arrival: tx_end + link.delay,
        })
    }

    /// Release the slot of the packet that just reached the peer.
    pub fn complete_delivery(&mut self) -> Option<u64> {
        self.queue.pop()
    }
}
