use anyhow::{Context, anyhow};
use netlab_abstract::{TestAssertion, TestScenario, TopologyOverride};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::engine::Simulator;
use crate::trace::SimulationReport;

pub fn load_scenario(path: &Path) -> anyhow::Result<TestScenario> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario file {}", path.display()))?;
    toml::from_str(&content).context("Failed to parse scenario")
}

/// Build and run a scenario, then check its assertions against the report.
pub fn run_scenario(
    scenario: &TestScenario,
    overrides: &TopologyOverride,
) -> anyhow::Result<SimulationReport> {
    let mut config = scenario.topology.clone();
    overrides.apply_to(&mut config);

    info!("Running Scenario: {}", config.name);
    if !config.description.is_empty() {
        info!("Description: {}", config.description);
    }

    let mut sim = Simulator::build(config).context("Invalid topology")?;
    sim.run();
    let report = sim.export_report();

    check_assertions(&scenario.assertions, &report)?;
    info!("Test Scenario Passed!");
    Ok(report)
}

fn check_range(what: &str, value: u64, min: u64, max: Option<u64>) -> anyhow::Result<()> {
    if value < min {
        return Err(anyhow!(
            "Assertion Failed: {} is {}, expected min {}",
            what,
            value,
            min
        ));
    }
    if let Some(max) = max
        && value > max
    {
        return Err(anyhow!(
            "Assertion Failed: {} is {}, expected max {}",
            what,
            value,
            max
        ));
    }
    Ok(())
}

pub fn check_assertions(
    assertions: &[TestAssertion],
    report: &SimulationReport,
) -> anyhow::Result<()> {
    let flow = |id: u32| {
        report
            .flow(id)
            .ok_or_else(|| anyhow!("Assertion Failed: flow {} was never observed", id))
    };

    for assertion in assertions {
        match assertion {
            TestAssertion::FlowCount { count } => {
                if report.flows.len() != *count {
                    return Err(anyhow!(
                        "Assertion Failed: {} flows observed, expected {}",
                        report.flows.len(),
                        count
                    ));
                }
            }
            TestAssertion::FlowRxPackets { flow: id, min, max } => {
                let f = flow(*id)?;
                check_range(&format!("flow {id} rx packets"), f.rx_packets, *min, *max)?;
            }
            TestAssertion::FlowLostPackets { flow: id, min, max } => {
                let f = flow(*id)?;
                check_range(&format!("flow {id} lost packets"), f.lost_packets, *min, *max)?;
            }
            TestAssertion::FlowThroughputKbps { flow: id, min, max } => {
                let f = flow(*id)?;
                let kbps = f.throughput_kbps.ok_or_else(|| {
                    anyhow!("Assertion Failed: flow {} has no defined throughput", id)
                })?;
                if let Some(min) = min
                    && kbps < *min
                {
                    return Err(anyhow!(
                        "Assertion Failed: flow {} throughput {:.2} Kbps < expected min {}",
                        id,
                        kbps,
                        min
                    ));
                }
                if let Some(max) = max
                    && kbps > *max
                {
                    return Err(anyhow!(
                        "Assertion Failed: flow {} throughput {:.2} Kbps > expected max {}",
                        id,
                        kbps,
                        max
                    ));
                }
            }
            TestAssertion::SinkRxBytes {
                node,
                port,
                protocol,
                min,
            } => {
                let sink = report.sink(node, *port, *protocol).ok_or_else(|| {
                    anyhow!(
                        "Assertion Failed: no {} sink bound to {}:{}",
                        protocol,
                        node,
                        port
                    )
                })?;
                check_range(
                    &format!("{protocol} sink {node}:{port} rx bytes"),
                    sink.stats.rx_bytes,
                    *min,
                    None,
                )?;
            }
            TestAssertion::NoDuplication => {
                if let Some(f) = report.flows.iter().find(|f| f.rx_packets > f.tx_packets) {
                    return Err(anyhow!(
                        "Assertion Failed: flow {} received {} packets but sent {}",
                        f.flow_id,
                        f.rx_packets,
                        f.tx_packets
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlab_abstract::{Protocol, SimTime};

    fn parse(text: &str) -> TestScenario {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn three_node_lab_passes_its_assertions() {
        let scenario = parse(include_str!("../../../scenarios/three_node.toml"));
        let report = run_scenario(&scenario, &TopologyOverride::default()).unwrap();
        assert_eq!(report.flows.len(), 2);
        assert!(report.end_time >= SimTime::from_millis(10_100));
        assert!(report.end_time < SimTime::from_millis(10_200));
    }

    #[test]
    fn four_node_lab_passes_its_assertions() {
        let scenario = parse(include_str!("../../../scenarios/four_node.toml"));
        let report = run_scenario(&scenario, &TopologyOverride::default()).unwrap();
        let tcp = report.sink("n1", 7, Protocol::Tcp).unwrap();
        assert!(tcp.stats.rx_bytes > 0);
    }

    #[test]
    fn relay_chain_passes_its_assertions() {
        let scenario = parse(include_str!("../../../scenarios/relay_chain.toml"));
        run_scenario(&scenario, &TopologyOverride::default()).unwrap();
    }

    #[test]
    fn failed_assertion_names_the_flow() {
        let mut scenario = parse(include_str!("../../../scenarios/relay_chain.toml"));
        scenario.assertions = vec![TestAssertion::FlowLostPackets {
            flow: 1,
            min: 0,
            max: Some(0),
        }];
        let err = run_scenario(&scenario, &TopologyOverride::default()).unwrap_err();
        assert!(err.to_string().starts_with("Assertion Failed: flow 1 lost packets"));
    }

    #[test]
    fn overrides_shorten_the_run() {
        let scenario = parse(include_str!("../../../scenarios/relay_chain.toml"));
        let overrides = TopologyOverride {
            stop_time: Some(SimTime::from_millis(500)),
            seed: None,
        };
        // nothing starts before 1s, so no flow can satisfy the assertions
        let err = run_scenario(&scenario, &overrides).unwrap_err();
        assert!(err.to_string().contains("Assertion Failed"));
    }

    #[test]
    fn invalid_topology_is_reported_with_context() {
        let mut scenario = parse(include_str!("../../../scenarios/relay_chain.toml"));
        scenario.topology.links[0].max_packets = 0;
        let err = run_scenario(&scenario, &TopologyOverride::default()).unwrap_err();
        assert_eq!(err.to_string(), "Invalid topology");
        assert!(format!("{err:#}").contains("queue capacity must be positive"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = load_scenario(Path::new("does/not/exist.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read scenario file"));
    }
}
