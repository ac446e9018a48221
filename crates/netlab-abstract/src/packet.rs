use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

use crate::units::SimTime;

pub const IPV4_HEADER_BYTES: u32 = 20;
pub const DEFAULT_TTL: u8 = 64;

/// Transport protocol carried in the IPv4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Connectionless, fire-and-forget datagrams.
    Udp,
    /// Connection-oriented, segmented and retransmitted byte stream.
    Tcp,
}

impl Protocol {
    /// Transport header size without options.
    pub fn header_bytes(&self) -> u32 {
        match self {
            Protocol::Udp => 8,
            Protocol::Tcp => 20,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Transport-level tag carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Segment {
    /// A self-contained datagram of `len` payload bytes.
    Datagram { len: u32 },
    /// Stream data: `seq` is the byte offset of the first payload byte.
    Data { seq: u64, len: u32 },
    /// Cumulative acknowledgement: `ack` is the next expected byte.
    Ack { ack: u64 },
}

impl Segment {
    pub fn payload_len(&self) -> u32 {
        match self {
            Segment::Datagram { len } | Segment::Data { len, .. } => *len,
            Segment::Ack { .. } => 0,
        }
    }
}

/// The five-tuple identifying a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
}

impl FlowKey {
    /// The key of traffic flowing the other way (e.g. acknowledgements).
    pub fn reversed(&self) -> Self {
        Self {
            src_addr: self.dst_addr,
            dst_addr: self.src_addr,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} ({})",
            self.src_addr, self.src_port, self.dst_addr, self.dst_port, self.protocol
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Packet {
    /// Unique per simulation run, assigned at creation.
    pub uid: u64,
    pub header: FlowKey,
    pub segment: Segment,
    /// Time the origin node handed the packet to the network layer.
    pub sent_at: SimTime,
    pub ttl: u8,
}

impl Packet {
    pub fn new(uid: u64, header: FlowKey, segment: Segment, sent_at: SimTime) -> Self {
        Self {
            uid,
            header,
            segment,
            sent_at,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn payload_size(&self) -> u32 {
        self.segment.payload_len()
    }

    /// Size of the IPv4 datagram: payload plus transport and IP headers.
    pub fn wire_size(&self) -> u32 {
        self.payload_size() + self.header.protocol.header_bytes() + IPV4_HEADER_BYTES
    }

    /// The copy a router emits after one hop, or `None` once the TTL is spent.
    pub fn forwarded(&self) -> Option<Packet> {
        let ttl = self.ttl.checked_sub(1).filter(|ttl| *ttl > 0)?;
        Some(Packet {
            ttl,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FlowKey {
        FlowKey {
            src_addr: Ipv4Addr::new(10, 0, 1, 1),
            dst_addr: Ipv4Addr::new(10, 0, 2, 2),
            src_port: 49153,
            dst_port: 7,
            protocol: Protocol::Udp,
        }
    }

    #[test]
    fn wire_size_includes_headers() {
        let udp = Packet::new(0, key(), Segment::Datagram { len: 1448 }, SimTime::ZERO);
        assert_eq!(udp.wire_size(), 1476);

        let mut tcp_key = key();
        tcp_key.protocol = Protocol::Tcp;
        let ack = Packet::new(1, tcp_key, Segment::Ack { ack: 1448 }, SimTime::ZERO);
        assert_eq!(ack.payload_size(), 0);
        assert_eq!(ack.wire_size(), 40);
    }

    #[test]
    fn forwarding_spends_ttl() {
        let mut packet = Packet::new(0, key(), Segment::Datagram { len: 10 }, SimTime::ZERO);
        packet.ttl = 2;
        let hop = packet.forwarded().unwrap();
        assert_eq!(hop.ttl, 1);
        assert!(hop.forwarded().is_none());
    }

    #[test]
    fn reversed_key_swaps_endpoints() {
        let k = key();
        let r = k.reversed();
        assert_eq!(r.src_addr, k.dst_addr);
        assert_eq!(r.dst_port, k.src_port);
        assert_eq!(r.reversed(), k);
        assert_eq!(k.to_string(), "10.0.1.1:49153 -> 10.0.2.2:7 (udp)");
    }
}
