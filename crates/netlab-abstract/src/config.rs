use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::packet::Protocol;
use crate::units::{DataRate, SimTime};

/// Declarative description of a topology and the traffic it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Events after this time are discarded.
    #[serde(default = "default_stop_time")]
    pub stop_time: SimTime,
    #[serde(default)]
    pub seed: u64,
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    /// Explicit static routes; everything else is computed once at build time.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
    #[serde(default)]
    pub applications: Vec<OnOffConfig>,
}

fn default_stop_time() -> SimTime {
    SimTime::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
}

/// A point-to-point link. Endpoint 0 gets the first host address of the
/// subnet, endpoint 1 the second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub endpoints: [String; 2],
    pub data_rate: DataRate,
    pub delay: SimTime,
    /// Drop-tail capacity of each device queue, in packets.
    #[serde(default = "default_max_packets")]
    pub max_packets: u32,
    pub network: Ipv4Addr,
    pub mask: Ipv4Addr,
}

fn default_max_packets() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub node: String,
    pub destination: Ipv4Addr,
    pub mask: Ipv4Addr,
    /// Neighbouring node the traffic is handed to.
    pub via: String,
}

/// Defaults applied to every connection-oriented endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub segment_size: u32,
    pub initial_cwnd: u32,
    pub rto: SimTime,
    pub send_buffer: u32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            segment_size: 536,
            initial_cwnd: 1,
            rto: SimTime::from_secs(1),
            send_buffer: 131_072,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub node: String,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub start: SimTime,
    #[serde(default)]
    pub stop: Option<SimTime>,
}

/// An on/off traffic source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnOffConfig {
    pub node: String,
    pub remote_address: Ipv4Addr,
    pub remote_port: u16,
    pub protocol: Protocol,
    #[serde(default = "default_payload_size")]
    pub payload_size: u32,
    #[serde(default = "default_app_rate")]
    pub data_rate: DataRate,
    #[serde(default = "default_on_time")]
    pub on_time: RandomVariable,
    #[serde(default = "default_off_time")]
    pub off_time: RandomVariable,
    #[serde(default)]
    pub start: SimTime,
    #[serde(default)]
    pub stop: Option<SimTime>,
}

fn default_payload_size() -> u32 {
    512
}

fn default_app_rate() -> DataRate {
    DataRate::from_kbps(500)
}

fn default_on_time() -> RandomVariable {
    RandomVariable::Constant { value: 1.0 }
}

fn default_off_time() -> RandomVariable {
    RandomVariable::Constant { value: 1.0 }
}

/// Distribution of a duration in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RandomVariable {
    Constant { value: f64 },
    Uniform { min: f64, max: f64 },
    Exponential { mean: f64 },
}

impl RandomVariable {
    /// Whether every sample is a finite, non-negative duration.
    pub fn is_valid(&self) -> bool {
        let ok = |v: f64| v.is_finite() && v >= 0.0;
        match *self {
            RandomVariable::Constant { value } => ok(value),
            RandomVariable::Uniform { min, max } => ok(min) && ok(max) && min <= max,
            RandomVariable::Exponential { mean } => ok(mean),
        }
    }

    /// Whether every sample is zero.
    pub fn is_always_zero(&self) -> bool {
        match *self {
            RandomVariable::Constant { value } => value == 0.0,
            RandomVariable::Uniform { max, .. } => max == 0.0,
            RandomVariable::Exponential { mean } => mean == 0.0,
        }
    }
}
