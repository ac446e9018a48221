//! Hooks on the packet event stream.
//!
//! The flow monitor is one observer; trace or visualization sinks attach the
//! same way without the engine knowing what they do with the events.

use netlab_abstract::{Packet, SimTime};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::trace;

use crate::flow::DropReason;

pub trait PacketObserver {
    /// The origin node handed `packet` to the network layer.
    fn on_tx(&mut self, _now: SimTime, _packet: &Packet) {}

    /// `packet` reached the node it is addressed to.
    fn on_rx(&mut self, _now: SimTime, _packet: &Packet) {}

    /// `packet` was discarded inside the network.
    fn on_drop(&mut self, _now: SimTime, _packet: &Packet, _reason: DropReason) {}

    /// An intermediate node relayed `packet` towards its destination.
    fn on_forward(&mut self, _now: SimTime, _packet: &Packet) {}
}

/// A compact textual summary of one packet event.
#[derive(Debug, Clone, Serialize)]
pub struct LinkEventSummary {
    pub time: SimTime,
    pub description: String,
}

/// Shared, bounded timeline of packet events.
///
/// Clones share the same buffer, so a handle kept by the caller sees what the
/// copy attached to the simulator recorded.
#[derive(Debug, Clone)]
pub struct LinkEventLog {
    events: Rc<RefCell<VecDeque<LinkEventSummary>>>,
    capacity: usize,
}

impl Default for LinkEventLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl LinkEventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Rc::new(RefCell::new(VecDeque::new())),
            capacity,
        }
    }

    fn push(&self, time: SimTime, description: String) {
        if self.capacity == 0 {
            return;
        }
        let mut events = self.events.borrow_mut();
        // Keep the most recent `capacity` entries
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(LinkEventSummary { time, description });
    }

    pub fn events(&self) -> Vec<LinkEventSummary> {
        self.events.borrow().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }
}

impl PacketObserver for LinkEventLog {
    fn on_tx(&mut self, now: SimTime, packet: &Packet) {
        self.push(
            now,
            format!("TX uid={} {} {} bytes", packet.uid, packet.header, packet.payload_size()),
        );
    }

    fn on_rx(&mut self, now: SimTime, packet: &Packet) {
        self.push(
            now,
            format!(
                "RX uid={} {} after {}",
                packet.uid,
                packet.header,
                now.saturating_sub(packet.sent_at)
            ),
        );
    }

    fn on_drop(&mut self, now: SimTime, packet: &Packet, reason: DropReason) {
        self.push(
            now,
            format!("DROP ({:?}) uid={} {}", reason, packet.uid, packet.header),
        );
    }

    fn on_forward(&mut self, now: SimTime, packet: &Packet) {
        self.push(now, format!("FWD uid={} ttl={}", packet.uid, packet.ttl));
    }
}

/// Emits every packet event as a `tracing` event at TRACE level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PacketObserver for TracingObserver {
    fn on_tx(&mut self, now: SimTime, packet: &Packet) {
        trace!(%now, uid = packet.uid, flow = %packet.header, "tx");
    }

    fn on_rx(&mut self, now: SimTime, packet: &Packet) {
        trace!(%now, uid = packet.uid, flow = %packet.header, "rx");
    }

    fn on_drop(&mut self, now: SimTime, packet: &Packet, reason: DropReason) {
        trace!(%now, uid = packet.uid, flow = %packet.header, ?reason, "drop");
    }
}
