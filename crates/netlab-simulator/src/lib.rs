pub mod engine;
pub mod flow;
pub mod link;
pub mod node;
pub mod observer;
pub mod scenario_runner;
pub mod scheduler;
pub mod topology;
pub mod trace;
pub mod traffic;
pub mod transport;

pub use engine::{EndpointRef, Simulator};
pub use flow::{DropReason, FlowId, FlowMonitor, FlowRecord, FlowStats};
pub use node::{InterfaceId, NodeId};
pub use observer::{LinkEventLog, LinkEventSummary, PacketObserver, TracingObserver};
pub use scheduler::{EventHandle, RunSummary};
pub use topology::{Network, TopologyError};
pub use trace::SimulationReport;
