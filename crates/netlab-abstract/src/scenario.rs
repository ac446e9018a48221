use crate::config::TopologyConfig;
use crate::packet::Protocol;
use crate::units::SimTime;
use serde::Deserialize;

/// A topology plus the statistics it is expected to produce.
#[derive(Deserialize, Debug, Clone)]
pub struct TestScenario {
    #[serde(flatten)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub assertions: Vec<TestAssertion>,
}

/// Run-level overrides, e.g. from the command line.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct TopologyOverride {
    pub stop_time: Option<SimTime>,
    pub seed: Option<u64>,
}

impl TopologyOverride {
    pub fn apply_to(&self, config: &mut TopologyConfig) {
        if let Some(v) = self.stop_time {
            config.stop_time = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAssertion {
    /// Exactly `count` flows were observed
    FlowCount { count: usize },
    /// Received packets of a flow are within range
    FlowRxPackets {
        flow: u32,
        min: u64,
        max: Option<u64>,
    },
    /// Lost packets of a flow are within range
    FlowLostPackets {
        flow: u32,
        min: u64,
        max: Option<u64>,
    },
    /// Throughput of a flow is defined and within range
    FlowThroughputKbps {
        flow: u32,
        min: Option<f64>,
        max: Option<f64>,
    },
    /// The sink bound to `node:port` received at least `min` application bytes
    SinkRxBytes {
        node: String,
        port: u16,
        protocol: Protocol,
        min: u64,
    },
    /// No flow received more packets than it sent
    NoDuplication,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_flattens_topology_and_assertions() {
        let scenario: TestScenario = toml::from_str(
            r#"
            name = "pair"
            stop_time = "2s"

            [[nodes]]
            name = "a"

            [[assertions]]
            type = "flow_count"
            count = 0

            [[assertions]]
            type = "flow_lost_packets"
            flow = 1
            min = 1
            "#,
        )
        .unwrap();

        assert_eq!(scenario.topology.name, "pair");
        assert_eq!(scenario.topology.stop_time, SimTime::from_secs(2));
        assert_eq!(scenario.assertions.len(), 2);
        assert!(matches!(
            scenario.assertions[1],
            TestAssertion::FlowLostPackets { flow: 1, min: 1, max: None }
        ));
    }

    #[test]
    fn override_replaces_only_given_fields() {
        let mut config: TopologyConfig = toml::from_str("seed = 3\n[[nodes]]\nname = \"a\"").unwrap();
        let over = TopologyOverride {
            stop_time: Some(SimTime::from_secs(1)),
            seed: None,
        };
        over.apply_to(&mut config);
        assert_eq!(config.stop_time, SimTime::from_secs(1));
        assert_eq!(config.seed, 3);
    }
}
