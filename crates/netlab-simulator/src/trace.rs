use netlab_abstract::{Protocol, SimTime};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use crate::flow::{FlowId, FlowRecord};
use crate::link::QueueStats;
use crate::traffic::{AppStats, SinkStats};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplicationRecord {
    pub node: String,
    pub local_port: u16,
    pub remote_address: Ipv4Addr,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub stats: AppStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkRecord {
    pub node: String,
    pub port: u16,
    pub protocol: Protocol,
    pub stats: SinkStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceRecord {
    pub node: String,
    pub address: Ipv4Addr,
    pub queue: QueueStats,
}

/// Everything a run measured, ready to be printed or serialized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationReport {
    pub name: String,
    pub stop_time: SimTime,
    pub end_time: SimTime,
    pub events_executed: u64,
    pub flows: Vec<FlowRecord>,
    pub applications: Vec<ApplicationRecord>,
    pub sinks: Vec<SinkRecord>,
    pub interfaces: Vec<InterfaceRecord>,
    pub metrics: BTreeMap<String, Vec<(SimTime, f64)>>,
}

impl SimulationReport {
    pub fn flow(&self, id: FlowId) -> Option<&FlowRecord> {
        self.flows.iter().find(|f| f.flow_id == id)
    }

    pub fn sink(&self, node: &str, port: u16, protocol: Protocol) -> Option<&SinkRecord> {
        self.sinks
            .iter()
            .find(|s| s.node == node && s.port == port && s.protocol == protocol)
    }
}

/// Per-flow block in the layout of the classic flow monitor printout.
impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.name.is_empty() {
            writeln!(f, "Scenario: {}", self.name)?;
        }
        for flow in &self.flows {
            writeln!(
                f,
                "Flow ID: {} Src Addr {} Dst Addr {}",
                flow.flow_id, flow.source_address, flow.destination_address
            )?;
            writeln!(
                f,
                "  Protocol {} Src Port {} Dst Port {}",
                flow.protocol, flow.source_port, flow.destination_port
            )?;
            writeln!(f, "  Tx Packets = {}", flow.tx_packets)?;
            writeln!(f, "  Rx Packets = {}", flow.rx_packets)?;
            writeln!(f, "  Lost Packets = {}", flow.lost_packets)?;
            match flow.throughput_kbps {
                Some(kbps) => writeln!(f, "  Throughput: {kbps:.4} Kbps")?,
                None => writeln!(f, "  Throughput: n/a")?,
            }
        }
        write!(
            f,
            "{} events executed, simulation ended at {}",
            self.events_executed, self.end_time
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(flow_id: FlowId, throughput_kbps: Option<f64>) -> FlowRecord {
        FlowRecord {
            flow_id,
            source_address: Ipv4Addr::new(10, 0, 1, 1),
            destination_address: Ipv4Addr::new(10, 0, 1, 2),
            source_port: 49153,
            destination_port: 7,
            protocol: Protocol::Udp,
            tx_packets: 10,
            rx_packets: 4,
            lost_packets: 6,
            tx_bytes: 10_000,
            rx_bytes: 4_000,
            dropped_packets: 6,
            times_forwarded: 0,
            mean_delay_ms: Some(5.0),
            throughput_kbps,
        }
    }

    fn report() -> SimulationReport {
        SimulationReport {
            name: "lab".to_string(),
            stop_time: SimTime::from_secs(15),
            end_time: SimTime::from_millis(10_104),
            events_executed: 42,
            flows: vec![record(1, Some(31.25)), record(2, None)],
            applications: Vec::new(),
            sinks: vec![SinkRecord {
                node: "n1".to_string(),
                port: 7,
                protocol: Protocol::Udp,
                stats: SinkStats::default(),
            }],
            interfaces: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }

    #[test]
    fn text_report_marks_undefined_throughput() {
        let text = report().to_string();
        assert!(text.contains("Flow ID: 1 Src Addr 10.0.1.1 Dst Addr 10.0.1.2"));
        assert!(text.contains("  Tx Packets = 10\n  Rx Packets = 4\n  Lost Packets = 6"));
        assert!(text.contains("Throughput: 31.2500 Kbps"));
        assert!(text.contains("Throughput: n/a"));
        assert!(text.ends_with("simulation ended at 10104ms"));
    }

    #[test]
    fn json_report_uses_null_for_undefined_throughput() {
        let json = serde_json::to_value(report()).unwrap();
        assert_eq!(json["flows"][0]["throughput_kbps"], 31.25);
        assert!(json["flows"][1]["throughput_kbps"].is_null());
        assert_eq!(json["flows"][0]["protocol"], "udp");
        assert_eq!(json["end_time"], "10104ms");
    }

    #[test]
    fn lookups_by_id_and_binding() {
        let report = report();
        assert_eq!(report.flow(2).map(|f| f.flow_id), Some(2));
        assert!(report.flow(3).is_none());
        assert!(report.sink("n1", 7, Protocol::Udp).is_some());
        assert!(report.sink("n1", 7, Protocol::Tcp).is_none());
        assert!(report.sink("n1", 8, Protocol::Udp).is_none());
    }
}
