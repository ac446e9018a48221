pub mod config;
pub mod interface;
pub mod packet;
pub mod scenario;
pub mod units;

pub use interface::{SystemContext, TransportProtocol};
pub use packet::{FlowKey, Packet, Protocol, Segment};

pub use config::{
    LinkConfig, NodeConfig, OnOffConfig, RandomVariable, RouteConfig, SinkConfig, TcpConfig,
    TopologyConfig,
};
pub use scenario::{TestAssertion, TestScenario, TopologyOverride};
pub use units::{DataRate, SimTime, UnitParseError};
