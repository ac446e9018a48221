use netlab_abstract::{
    FlowKey, Packet, Protocol, Segment, SimTime, SystemContext, TopologyConfig, TransportProtocol,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{debug, info};

use crate::flow::{DropReason, FlowMonitor, FlowStats};
use crate::node::{Endpoint, InterfaceId, NodeId, RouteDecision};
use crate::observer::PacketObserver;
use crate::scheduler::{self, EventHandle, RunSummary, Scheduler, SchedulerHost};
use crate::topology::{self, Network, TopologyError};
use crate::trace::{ApplicationRecord, InterfaceRecord, SimulationReport, SinkRecord};
use crate::traffic::{OnOffApplication, PacketSink};
use crate::transport;

/// A transport endpoint hosted by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRef {
    Application(usize),
    /// The receiving side a sink keeps for one remote (address, port).
    SinkPeer {
        sink: usize,
        peer: Ipv4Addr,
        port: u16,
    },
}

impl fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointRef::Application(index) => write!(f, "app{index}"),
            EndpointRef::SinkPeer { sink, peer, port } => write!(f, "sink{sink}/{peer}:{port}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerOp {
    Start(SimTime, u32),
    Cancel(u32),
}

/// Actions buffered during a transport callback
#[derive(Default)]
struct ActionBuffer {
    outgoing_segments: Vec<Segment>,
    timer_ops: Vec<TimerOp>,
    logs: Vec<String>,
    delivered: Vec<u32>,
    metrics: Vec<(String, f64)>,
}

/// Context implementation passed to the transport
struct ScopedContext<'a> {
    buffer: &'a mut ActionBuffer,
    now: SimTime,
}

impl SystemContext for ScopedContext<'_> {
    fn send_segment(&mut self, segment: Segment) {
        self.buffer.outgoing_segments.push(segment);
    }

    fn start_timer(&mut self, delay: SimTime, timer_id: u32) {
        self.buffer.timer_ops.push(TimerOp::Start(delay, timer_id));
    }

    fn cancel_timer(&mut self, timer_id: u32) {
        self.buffer.timer_ops.push(TimerOp::Cancel(timer_id));
    }

    fn deliver_data(&mut self, bytes: u32) {
        self.buffer.delivered.push(bytes);
    }

    fn log(&mut self, message: &str) {
        self.buffer.logs.push(message.to_string());
    }

    fn now(&self) -> SimTime {
        self.now
    }

    fn record_metric(&mut self, name: &str, value: f64) {
        self.buffer.metrics.push((name.to_string(), value));
    }
}

pub struct Simulator {
    pub(crate) scheduler: Scheduler<Simulator>,
    config: TopologyConfig,
    network: Network,
    pub(crate) applications: Vec<OnOffApplication>,
    pub(crate) sinks: Vec<PacketSink>,
    flow_monitor: FlowMonitor,
    observers: Vec<Box<dyn PacketObserver>>,
    pub(crate) rng: StdRng,
    next_uid: u64,
    /// Running transport timers. Key: (endpoint, timer_id)
    timers: HashMap<(EndpointRef, u32), EventHandle>,
    /// Time series recorded via `SystemContext::record_metric`, keyed "endpoint/name".
    metrics: BTreeMap<String, Vec<(SimTime, f64)>>,
    events_executed: u64,
}

impl SchedulerHost for Simulator {
    fn scheduler(&mut self) -> &mut Scheduler<Self> {
        &mut self.scheduler
    }
}

impl Simulator {
    /// Build the network, bind sinks and applications and queue their start events.
    pub fn build(config: TopologyConfig) -> Result<Self, TopologyError> {
        if config.tcp.segment_size == 0 {
            return Err(TopologyError::ZeroSegmentSize);
        }
        let mut network = Network::build(&config)?;
        let lookup = |network: &Network, name: &str| {
            network
                .node_by_name(name)
                .ok_or_else(|| TopologyError::UnknownNode(name.to_string()))
        };

        let mut sinks = Vec::with_capacity(config.sinks.len());
        for (index, sink) in config.sinks.iter().enumerate() {
            let node = lookup(&network, &sink.node)?;
            topology::check_window(format!("sink {index}"), sink.start, sink.stop)?;
            network.nodes[node.0]
                .bind(sink.protocol, sink.port, Endpoint::Sink(index))
                .map_err(|_| TopologyError::PortInUse {
                    node: sink.node.clone(),
                    protocol: sink.protocol,
                    port: sink.port,
                })?;
            sinks.push(PacketSink::new(node, sink));
        }

        let mut applications = Vec::with_capacity(config.applications.len());
        for (index, app) in config.applications.iter().enumerate() {
            let node = lookup(&network, &app.node)?;
            topology::validate_traffic(index, app)?;
            network.validate_application(index, node, app)?;
            let local_port = network.nodes[node.0].allocate_port(app.protocol);
            network.nodes[node.0]
                .bind(app.protocol, local_port, Endpoint::Application(index))
                .map_err(|_| TopologyError::PortInUse {
                    node: app.node.clone(),
                    protocol: app.protocol,
                    port: local_port,
                })?;
            let transport = transport::sender(app.protocol, &config.tcp);
            applications.push(OnOffApplication::new(node, local_port, app, transport));
        }

        info!(
            name = %config.name,
            nodes = network.nodes.len(),
            links = network.links.len(),
            applications = applications.len(),
            sinks = sinks.len(),
            "topology built"
        );

        let mut simulator = Self {
            scheduler: Scheduler::new(),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            network,
            applications,
            sinks,
            flow_monitor: FlowMonitor::new(),
            observers: Vec::new(),
            next_uid: 0,
            timers: HashMap::new(),
            metrics: BTreeMap::new(),
            events_executed: 0,
        };
        simulator.schedule_applications();
        Ok(simulator)
    }

    pub fn now(&self) -> SimTime {
        self.scheduler.now()
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.network.node_by_name(name)
    }

    pub fn flow_monitor(&self) -> &FlowMonitor {
        &self.flow_monitor
    }

    pub fn flow_stats(&self, key: &FlowKey) -> Option<&FlowStats> {
        self.flow_monitor.flow_stats(key)
    }

    pub fn applications(&self) -> &[OnOffApplication] {
        &self.applications
    }

    pub fn sinks(&self) -> &[PacketSink] {
        &self.sinks
    }

    pub fn events_executed(&self) -> u64 {
        self.events_executed
    }

    /// Samples of a metric recorded by an endpoint, e.g. `"app0/cwnd"`.
    pub fn metric_series(&self, name: &str) -> Option<&[(SimTime, f64)]> {
        self.metrics.get(name).map(|v| v.as_slice())
    }

    /// Attach an observer that sees every packet event from now on.
    pub fn add_observer(&mut self, observer: Box<dyn PacketObserver>) {
        self.observers.push(observer);
    }

    /// Replace the transport an application writes into.
    ///
    /// Returns false if there is no such application or the transport speaks
    /// a different protocol than the one its port is bound for.
    pub fn install_transport(&mut self, application: usize, transport: Box<dyn TransportProtocol>) -> bool {
        let Some(app) = self.applications.get_mut(application) else {
            return false;
        };
        if transport.protocol() != app.protocol {
            debug!(app = application, "transport protocol mismatch, keeping the current one");
            return false;
        }
        app.transport = transport;
        true
    }

    /// Run arbitrary work at `now + delay`.
    pub fn schedule(
        &mut self,
        delay: SimTime,
        callback: impl FnOnce(&mut Simulator) + 'static,
    ) -> EventHandle {
        self.scheduler.schedule(delay, callback)
    }

    /// Run until the configured stop time.
    pub fn run(&mut self) -> RunSummary {
        let stop = self.config.stop_time;
        self.run_until(stop)
    }

    /// Execute every event due at or before `stop`; anything later is discarded.
    pub fn run_until(&mut self, stop: SimTime) -> RunSummary {
        info!(%stop, "running simulation");
        let summary = scheduler::run_until(self, stop);
        self.events_executed += summary.executed;
        self.timers.clear();
        info!(
            executed = summary.executed,
            discarded = summary.discarded,
            end = %summary.end_time,
            "simulation finished"
        );
        summary
    }

    fn next_uid(&mut self) -> u64 {
        let uid = self.next_uid;
        self.next_uid += 1;
        uid
    }

    fn observe(&mut self, mut notify: impl FnMut(&mut dyn PacketObserver)) {
        notify(&mut self.flow_monitor);
        for observer in self.observers.iter_mut() {
            notify(observer.as_mut());
        }
    }

    /// Hand a segment to the network layer of `node`.
    ///
    /// Returns false when the packet is dropped before leaving the node.
    pub fn send_from(
        &mut self,
        node: NodeId,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        protocol: Protocol,
        segment: Segment,
    ) -> bool {
        let now = self.now();
        let decision = self.network.node(node).route(dst);
        let src_addr = match decision {
            RouteDecision::Local => dst,
            RouteDecision::Forward(iface) => self.network.interface(iface).address,
            RouteDecision::NoRoute => self
                .network
                .node(node)
                .addresses()
                .first()
                .copied()
                .unwrap_or(Ipv4Addr::UNSPECIFIED),
        };
        let header = FlowKey {
            src_addr,
            dst_addr: dst,
            src_port,
            dst_port,
            protocol,
        };
        let packet = Packet::new(self.next_uid(), header, segment, now);

        match decision {
            RouteDecision::NoRoute => {
                debug!(%node, flow = %packet.header, "no route to destination");
                self.observe(|o| o.on_drop(now, &packet, DropReason::NoRoute));
                false
            }
            RouteDecision::Local => {
                self.observe(|o| o.on_tx(now, &packet));
                self.scheduler
                    .schedule(SimTime::ZERO, move |sim: &mut Simulator| sim.deliver_local(node, packet));
                true
            }
            RouteDecision::Forward(iface) => {
                self.observe(|o| o.on_tx(now, &packet));
                self.enqueue(iface, packet)
            }
        }
    }

    /// Offer `packet` to the device queue of `iface`. Returns false if it was dropped.
    pub fn enqueue(&mut self, iface: InterfaceId, packet: Packet) -> bool {
        let now = self.now();
        let link = &self.network.links[self.network.interfaces[iface.0].link.0];
        let Some(transmission) = self.network.interfaces[iface.0]
            .tx
            .enqueue(now, &packet, link)
        else {
            debug!(%iface, uid = packet.uid, "device queue full, dropping");
            self.observe(|o| o.on_drop(now, &packet, DropReason::QueueFull));
            return false;
        };

        let peer = self.network.peer_of(iface);
        self.scheduler
            .schedule_at(transmission.arrival, move |sim: &mut Simulator| {
                sim.finish_delivery(iface);
                sim.forward(peer, packet)
            });
        true
    }

    /// The packet sent from `iface` reached the peer, so its slot frees up.
    fn finish_delivery(&mut self, iface: InterfaceId) {
        self.network.interfaces[iface.0].tx.complete_delivery();
    }

    /// `packet` fully arrived on `iface`: deliver it locally or pass it on.
    pub fn forward(&mut self, iface: InterfaceId, packet: Packet) {
        let now = self.now();
        let node = self.network.interface(iface).node;
        match self.network.node(node).route(packet.header.dst_addr) {
            RouteDecision::Local => self.deliver_local(node, packet),
            RouteDecision::Forward(out) => match packet.forwarded() {
                Some(next) => {
                    self.observe(|o| o.on_forward(now, &next));
                    self.enqueue(out, next);
                }
                None => {
                    debug!(%node, uid = packet.uid, "ttl expired");
                    self.observe(|o| o.on_drop(now, &packet, DropReason::TtlExpired));
                }
            },
            RouteDecision::NoRoute => {
                debug!(%node, flow = %packet.header, "no route while forwarding");
                self.observe(|o| o.on_drop(now, &packet, DropReason::NoRoute));
            }
        }
    }

    fn deliver_local(&mut self, node: NodeId, packet: Packet) {
        let now = self.now();
        self.observe(|o| o.on_rx(now, &packet));

        let header = packet.header;
        match self.network.node(node).endpoint(header.protocol, header.dst_port) {
            Some(Endpoint::Sink(index)) => self.sink_receive(index, packet),
            Some(Endpoint::Application(index)) => {
                let segment = packet.segment;
                self.dispatch(EndpointRef::Application(index), move |t, ctx| {
                    t.on_segment(ctx, segment)
                });
            }
            None => debug!(%node, port = header.dst_port, "nothing bound to port, discarding"),
        }
    }

    fn sink_receive(&mut self, index: usize, packet: Packet) {
        let now = self.now();
        let sink = &mut self.sinks[index];
        if !sink.is_active(now) {
            debug!(sink = index, %now, "sink inactive, discarding");
            return;
        }
        sink.stats.rx_packets += 1;
        sink.stats.last_rx = Some(now);

        let endpoint = EndpointRef::SinkPeer {
            sink: index,
            peer: packet.header.src_addr,
            port: packet.header.src_port,
        };
        let segment = packet.segment;
        self.dispatch(endpoint, move |t, ctx| t.on_segment(ctx, segment));
    }

    fn fire_timer(&mut self, endpoint: EndpointRef, timer_id: u32) {
        self.timers.remove(&(endpoint, timer_id));
        self.dispatch(endpoint, |t, ctx| t.on_timer(ctx, timer_id));
    }

    fn transport_mut(&mut self, endpoint: EndpointRef) -> Option<&mut Box<dyn TransportProtocol>> {
        match endpoint {
            EndpointRef::Application(index) => self.applications.get_mut(index).map(|app| &mut app.transport),
            EndpointRef::SinkPeer { sink, peer, port } => {
                let sink = self.sinks.get_mut(sink)?;
                let protocol = sink.protocol;
                Some(
                    sink.peers
                        .entry((peer, port))
                        .or_insert_with(|| transport::receiver(protocol)),
                )
            }
        }
    }

    /// Call into a transport with a fresh context, then apply what it asked for.
    pub(crate) fn dispatch<R>(
        &mut self,
        endpoint: EndpointRef,
        call: impl FnOnce(&mut dyn TransportProtocol, &mut dyn SystemContext) -> R,
    ) -> Option<R> {
        let now = self.now();
        let mut buffer = ActionBuffer::default();
        let result = {
            let transport = self.transport_mut(endpoint)?;
            let mut ctx = ScopedContext {
                buffer: &mut buffer,
                now,
            };
            call(transport.as_mut(), &mut ctx)
        };
        self.process_actions(endpoint, buffer);
        Some(result)
    }

    /// (node, local port, remote address, remote port, protocol) of an endpoint.
    fn endpoint_address(&self, endpoint: EndpointRef) -> Option<(NodeId, u16, Ipv4Addr, u16, Protocol)> {
        match endpoint {
            EndpointRef::Application(index) => {
                let app = self.applications.get(index)?;
                Some((app.node, app.local_port, app.remote_address, app.remote_port, app.protocol))
            }
            EndpointRef::SinkPeer { sink, peer, port } => {
                let sink = self.sinks.get(sink)?;
                Some((sink.node, sink.port, peer, port, sink.protocol))
            }
        }
    }

    fn process_actions(&mut self, endpoint: EndpointRef, buffer: ActionBuffer) {
        let now = self.now();

        // First, fold metrics into simulator-wide store
        for (name, value) in buffer.metrics {
            self.metrics
                .entry(format!("{endpoint}/{name}"))
                .or_default()
                .push((now, value));
        }

        for log in buffer.logs {
            debug!("[{}] {}", endpoint, log);
        }

        for bytes in buffer.delivered {
            match endpoint {
                EndpointRef::SinkPeer { sink, .. } => self.sinks[sink].stats.rx_bytes += bytes as u64,
                EndpointRef::Application(_) => {
                    debug!("[{}] delivered {} bytes with no reader", endpoint, bytes)
                }
            }
        }

        for op in buffer.timer_ops {
            match op {
                TimerOp::Cancel(timer_id) => {
                    if let Some(handle) = self.timers.remove(&(endpoint, timer_id)) {
                        self.scheduler.cancel(handle);
                    }
                }
                TimerOp::Start(delay, timer_id) => {
                    let handle = self
                        .scheduler
                        .schedule(delay, move |sim: &mut Simulator| sim.fire_timer(endpoint, timer_id));
                    // Restarting a running timer replaces it
                    if let Some(previous) = self.timers.insert((endpoint, timer_id), handle) {
                        self.scheduler.cancel(previous);
                    }
                }
            }
        }

        if buffer.outgoing_segments.is_empty() {
            return;
        }
        let Some((node, src_port, dst, dst_port, protocol)) = self.endpoint_address(endpoint) else {
            return;
        };
        for segment in buffer.outgoing_segments {
            self.send_from(node, src_port, dst, dst_port, protocol, segment);
        }
    }

    /// Produce a serializable snapshot of the current simulation state.
    pub fn export_report(&self) -> SimulationReport {
        let node_name = |node: NodeId| self.network.node(node).name.clone();
        SimulationReport {
            name: self.config.name.clone(),
            stop_time: self.config.stop_time,
            end_time: self.now(),
            events_executed: self.events_executed,
            flows: self.flow_monitor.report(),
            applications: self
                .applications
                .iter()
                .map(|app| ApplicationRecord {
                    node: node_name(app.node),
                    local_port: app.local_port,
                    remote_address: app.remote_address,
                    remote_port: app.remote_port,
                    protocol: app.protocol,
                    stats: app.stats,
                })
                .collect(),
            sinks: self
                .sinks
                .iter()
                .map(|sink| SinkRecord {
                    node: node_name(sink.node),
                    port: sink.port,
                    protocol: sink.protocol,
                    stats: sink.stats,
                })
                .collect(),
            interfaces: self
                .network
                .interfaces
                .iter()
                .map(|iface| InterfaceRecord {
                    node: node_name(iface.node),
                    address: iface.address,
                    queue: iface.tx.queue.stats.clone(),
                })
                .collect(),
            metrics: self.metrics.clone(),
        }
    }
}
