//! Five-tuple flow classification and per-flow statistics.

use netlab_abstract::{FlowKey, Packet, Protocol, SimTime};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use crate::observer::PacketObserver;

pub type FlowId = u32;

/// Why the network discarded a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    QueueFull,
    NoRoute,
    TtlExpired,
}

/// Maps five-tuples to flow ids, handed out from 1 in first-seen order.
#[derive(Debug, Default)]
pub struct FlowClassifier {
    ids: HashMap<FlowKey, FlowId>,
    keys: Vec<FlowKey>,
}

impl FlowClassifier {
    pub fn classify(&mut self, key: &FlowKey) -> FlowId {
        if let Some(id) = self.ids.get(key) {
            return *id;
        }
        self.keys.push(*key);
        let id = self.keys.len() as FlowId;
        self.ids.insert(*key, id);
        id
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<FlowId> {
        self.ids.get(key).copied()
    }

    pub fn find_flow(&self, id: FlowId) -> Option<&FlowKey> {
        let index = (id as usize).checked_sub(1)?;
        self.keys.get(index)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlowStats {
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub first_tx: Option<SimTime>,
    pub last_tx: Option<SimTime>,
    pub first_rx: Option<SimTime>,
    pub last_rx: Option<SimTime>,
    /// Sum of one-way delays of received packets.
    pub delay_sum: SimTime,
    pub times_forwarded: u64,
    pub drops: BTreeMap<DropReason, u64>,
}

impl FlowStats {
    /// Packets sent but never received, inferred at report time.
    pub fn lost_packets(&self) -> u64 {
        self.tx_packets.saturating_sub(self.rx_packets)
    }

    pub fn dropped_packets(&self) -> u64 {
        self.drops.values().sum()
    }

    /// Received payload bits over `last_rx - first_tx`, in units of 1024 bit/s.
    ///
    /// `None` when nothing was received or the window is empty.
    pub fn throughput_kbps(&self) -> Option<f64> {
        if self.rx_packets == 0 {
            return None;
        }
        let window = self.last_rx?.saturating_sub(self.first_tx?);
        if window == SimTime::ZERO {
            return None;
        }
        Some(self.rx_bytes as f64 * 8.0 / window.as_secs_f64() / 1024.0)
    }

    pub fn mean_delay(&self) -> Option<SimTime> {
        if self.rx_packets == 0 {
            return None;
        }
        Some(SimTime::from_nanos(
            self.delay_sum.as_nanos() / self.rx_packets,
        ))
    }
}

/// One line of the end-of-run statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowRecord {
    pub flow_id: FlowId,
    pub source_address: Ipv4Addr,
    pub destination_address: Ipv4Addr,
    pub source_port: u16,
    pub destination_port: u16,
    pub protocol: Protocol,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub lost_packets: u64,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub dropped_packets: u64,
    pub times_forwarded: u64,
    pub mean_delay_ms: Option<f64>,
    pub throughput_kbps: Option<f64>,
}

impl FlowRecord {
    fn new(flow_id: FlowId, key: &FlowKey, stats: &FlowStats) -> Self {
        Self {
            flow_id,
            source_address: key.src_addr,
            destination_address: key.dst_addr,
            source_port: key.src_port,
            destination_port: key.dst_port,
            protocol: key.protocol,
            tx_packets: stats.tx_packets,
            rx_packets: stats.rx_packets,
            lost_packets: stats.lost_packets(),
            tx_bytes: stats.tx_bytes,
            rx_bytes: stats.rx_bytes,
            dropped_packets: stats.dropped_packets(),
            times_forwarded: stats.times_forwarded,
            mean_delay_ms: stats.mean_delay().map(|d| d.as_millis_f64()),
            throughput_kbps: stats.throughput_kbps(),
        }
    }
}

/// Attributes every observed packet to a flow and accumulates its counters.
#[derive(Debug, Default)]
pub struct FlowMonitor {
    classifier: FlowClassifier,
    stats: BTreeMap<FlowId, FlowStats>,
}

impl FlowMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, packet: &Packet) -> &mut FlowStats {
        let id = self.classifier.classify(&packet.header);
        self.stats.entry(id).or_default()
    }

    pub fn stats(&self) -> &BTreeMap<FlowId, FlowStats> {
        &self.stats
    }

    pub fn flow_stats(&self, key: &FlowKey) -> Option<&FlowStats> {
        self.classifier
            .lookup(key)
            .and_then(|id| self.stats.get(&id))
    }

    /// Per-flow records ordered by flow id.
    pub fn report(&self) -> Vec<FlowRecord> {
        self.stats
            .iter()
            .filter_map(|(id, stats)| {
                let key = self.classifier.find_flow(*id)?;
                Some(FlowRecord::new(*id, key, stats))
            })
            .collect()
    }
}

impl PacketObserver for FlowMonitor {
    fn on_tx(&mut self, now: SimTime, packet: &Packet) {
        let stats = self.entry(packet);
        stats.tx_packets += 1;
        stats.tx_bytes += packet.payload_size() as u64;
        stats.first_tx.get_or_insert(now);
        stats.last_tx = Some(now);
    }

    fn on_rx(&mut self, now: SimTime, packet: &Packet) {
        let stats = self.entry(packet);
        stats.rx_packets += 1;
        stats.rx_bytes += packet.payload_size() as u64;
        stats.delay_sum += now.saturating_sub(packet.sent_at);
        stats.first_rx.get_or_insert(now);
        stats.last_rx = Some(now);
    }

    fn on_drop(&mut self, _now: SimTime, packet: &Packet, reason: DropReason) {
        *self.entry(packet).drops.entry(reason).or_default() += 1;
    }

    fn on_forward(&mut self, _now: SimTime, packet: &Packet) {
        self.entry(packet).times_forwarded += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlab_abstract::Segment;

    fn key(src_port: u16) -> FlowKey {
        FlowKey {
            src_addr: Ipv4Addr::new(10, 0, 1, 1),
            dst_addr: Ipv4Addr::new(10, 0, 1, 2),
            src_port,
            dst_port: 7,
            protocol: Protocol::Udp,
        }
    }

    fn packet(uid: u64, src_port: u16, sent_at: SimTime) -> Packet {
        Packet::new(uid, key(src_port), Segment::Datagram { len: 1000 }, sent_at)
    }

    #[test]
    fn flow_ids_follow_first_observation() {
        let mut classifier = FlowClassifier::default();
        assert_eq!(classifier.classify(&key(2)), 1);
        assert_eq!(classifier.classify(&key(1)), 2);
        assert_eq!(classifier.classify(&key(2)), 1);
        assert_eq!(classifier.find_flow(2), Some(&key(1)));
        assert_eq!(classifier.find_flow(0), None);
        assert_eq!(classifier.lookup(&key(3)), None);
    }

    #[test]
    fn loss_and_throughput_are_derived_at_report_time() {
        let mut monitor = FlowMonitor::new();
        for uid in 0..4 {
            monitor.on_tx(SimTime::from_secs(1), &packet(uid, 5000, SimTime::from_secs(1)));
        }
        let dropped = packet(1, 5000, SimTime::from_secs(1));
        monitor.on_drop(SimTime::from_secs(1), &dropped, DropReason::QueueFull);
        monitor.on_rx(SimTime::from_secs(2), &packet(0, 5000, SimTime::from_secs(1)));
        monitor.on_rx(SimTime::from_secs(3), &packet(2, 5000, SimTime::from_secs(1)));

        let report = monitor.report();
        assert_eq!(report.len(), 1);
        let flow = &report[0];
        assert_eq!(flow.flow_id, 1);
        assert_eq!(flow.tx_packets, 4);
        assert_eq!(flow.rx_packets, 2);
        // one explicit drop plus one packet that simply never arrived
        assert_eq!(flow.lost_packets, 2);
        assert_eq!(flow.dropped_packets, 1);
        // 2000 bytes over 2 s
        assert_eq!(flow.throughput_kbps, Some(2000.0 * 8.0 / 2.0 / 1024.0));
        assert_eq!(flow.mean_delay_ms, Some(1500.0));
    }

    #[test]
    fn zero_window_has_no_throughput() {
        let mut monitor = FlowMonitor::new();
        let now = SimTime::from_millis(5);
        let p = packet(0, 5000, now);
        monitor.on_tx(now, &p);
        monitor.on_rx(now, &p);

        let flow = &monitor.report()[0];
        assert_eq!(flow.rx_packets, 1);
        assert_eq!(flow.lost_packets, 0);
        assert_eq!(flow.throughput_kbps, None);
    }

    #[test]
    fn flow_without_receptions_has_no_throughput() {
        let mut monitor = FlowMonitor::new();
        monitor.on_tx(SimTime::ZERO, &packet(0, 5000, SimTime::ZERO));
        let stats = monitor.flow_stats(&key(5000)).unwrap();
        assert_eq!(stats.throughput_kbps(), None);
        assert_eq!(stats.mean_delay(), None);
        assert_eq!(stats.lost_packets(), 1);
    }

    #[test]
    fn report_is_ordered_by_flow_id() {
        let mut monitor = FlowMonitor::new();
        for port in [9, 3, 7] {
            monitor.on_tx(SimTime::ZERO, &packet(0, port, SimTime::ZERO));
        }
        let ids: Vec<_> = monitor.report().iter().map(|r| (r.flow_id, r.source_port)).collect();
        assert_eq!(ids, vec![(1, 9), (2, 3), (3, 7)]);
    }
}
