use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use netlab_abstract::{SimTime, TopologyConfig, TopologyOverride};
use netlab_simulator::{LinkEventLog, SimulationReport, Simulator, TracingObserver, scenario_runner};

#[derive(Parser, Debug)]
#[command(author, version, about = "Discrete-event packet network simulator")]
struct Args {
    /// Topology and traffic description to run.
    #[arg(long, conflicts_with = "scenario", required_unless_present = "scenario")]
    config: Option<PathBuf>,

    /// Load a scenario (topology plus assertions) from disk.
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Override the configured stop time, e.g. "20s".
    #[arg(long)]
    stop_time: Option<SimTime>,

    /// Override the random seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Write the JSON report of the finished simulation.
    #[arg(long)]
    report_out: Option<PathBuf>,

    /// Print the timeline of packet events after a `--config` run.
    #[arg(long, default_value_t = false, conflicts_with = "scenario")]
    event_log: bool,

    /// Only log warnings and errors, and skip the text report.
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.quiet);
    info!("netlab-sim-cli starting…");

    let overrides = TopologyOverride {
        stop_time: args.stop_time,
        seed: args.seed,
    };

    let report = if let Some(path) = &args.scenario {
        let scenario = scenario_runner::load_scenario(path)?;
        scenario_runner::run_scenario(&scenario, &overrides)?
    } else if let Some(path) = &args.config {
        let mut config = load_config(path)?;
        overrides.apply_to(&mut config);
        run_config(config, args.event_log)?
    } else {
        anyhow::bail!("either --config or --scenario is required");
    };

    if !args.quiet {
        println!("{report}");
    }

    if let Some(path) = &args.report_out {
        write_report(path, &report)?;
    }

    Ok(())
}

fn init_logging(quiet: bool) {
    let level = if quiet {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn run_config(config: TopologyConfig, event_log: bool) -> Result<SimulationReport> {
    let mut sim = Simulator::build(config).context("Invalid topology")?;
    sim.add_observer(Box::new(TracingObserver));
    let log = LinkEventLog::default();
    if event_log {
        sim.add_observer(Box::new(log.clone()));
    }

    info!("Starting headless simulation…");
    sim.run();
    info!("Simulation complete.");

    for event in log.events() {
        println!("[{}] {}", event.time, event.description);
    }
    Ok(sim.export_report())
}

fn load_config(path: &Path) -> Result<TopologyConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: TopologyConfig =
        toml::from_str(&content).context("Failed to parse config file")?;
    Ok(config)
}

fn write_report(path: &Path, report: &SimulationReport) -> Result<()> {
    let data = serde_json::to_vec_pretty(report).context("Failed to serialize simulation report")?;
    fs::write(path, &data)
        .with_context(|| format!("Failed to write report file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn event_log_only_applies_to_config_runs() {
        let err = Args::try_parse_from(["netlab-sim-cli", "--scenario", "s.toml", "--event-log"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);

        let args = Args::try_parse_from([
            "netlab-sim-cli",
            "--config",
            "c.toml",
            "--event-log",
            "--stop-time",
            "2s",
        ])
        .unwrap();
        assert!(args.event_log);
        assert_eq!(args.stop_time, Some(SimTime::from_secs(2)));
    }

    #[test]
    fn one_input_is_required() {
        assert!(Args::try_parse_from(["netlab-sim-cli"]).is_err());
    }
}
