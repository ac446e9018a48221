//! Builds the static network from a [`TopologyConfig`] and rejects invalid setups.

use ipnetwork::Ipv4Network;
use netlab_abstract::{OnOffConfig, Protocol, SimTime, TopologyConfig};
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::debug;

use crate::link::{Link, TxQueue};
use crate::node::{Interface, InterfaceId, LinkId, Node, NodeId, Route, RouteDecision};

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("topology has no nodes")]
    NoNodes,
    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    #[error("link {link} connects node '{node}' to itself")]
    SelfLoop { link: usize, node: String },
    #[error("link {link}: invalid subnet {network} mask {mask}: {reason}")]
    InvalidSubnet {
        link: usize,
        network: Ipv4Addr,
        mask: Ipv4Addr,
        reason: String,
    },
    #[error("link {link}: subnet {subnet} has no room for two host addresses")]
    SubnetTooSmall { link: usize, subnet: Ipv4Network },
    #[error("link {link}: subnet {subnet} overlaps {other} of link {other_link}, addresses would clash")]
    OverlappingSubnet {
        link: usize,
        subnet: Ipv4Network,
        other_link: usize,
        other: Ipv4Network,
    },
    #[error("link {link}: queue capacity must be positive")]
    ZeroQueueCapacity { link: usize },
    #[error("link {link}: data rate must be positive")]
    ZeroLinkRate { link: usize },
    #[error("route on node '{node}': invalid destination {destination} mask {mask}: {reason}")]
    InvalidRoute {
        node: String,
        destination: Ipv4Addr,
        mask: Ipv4Addr,
        reason: String,
    },
    #[error("route on node '{node}': '{via}' is not a neighbour")]
    NotANeighbour { node: String, via: String },
    #[error("application {index} on node '{node}': {address} is not assigned to any interface")]
    UnknownAddress {
        index: usize,
        node: String,
        address: Ipv4Addr,
    },
    #[error("application {index}: {address} is unreachable from node '{node}'")]
    Unreachable {
        index: usize,
        node: String,
        address: Ipv4Addr,
    },
    #[error("application {index}: payload size must be positive")]
    ZeroPayload { index: usize },
    #[error("application {index}: data rate must be positive")]
    ZeroAppRate { index: usize },
    #[error("application {index}: invalid {which} distribution")]
    InvalidDistribution { index: usize, which: &'static str },
    #[error("application {index}: on and off times are both always zero")]
    ZeroCycle { index: usize },
    #[error("{what}: start {start} is after stop {stop}")]
    StartAfterStop {
        what: String,
        start: SimTime,
        stop: SimTime,
    },
    #[error("node '{node}': {protocol} port {port} is already bound")]
    PortInUse {
        node: String,
        protocol: Protocol,
        port: u16,
    },
    #[error("tcp segment size must be positive")]
    ZeroSegmentSize,
}

/// Nodes, interfaces and links of a built topology.
#[derive(Debug)]
pub struct Network {
    pub nodes: Vec<Node>,
    pub interfaces: Vec<Interface>,
    pub links: Vec<Link>,
}

impl Network {
    pub fn build(config: &TopologyConfig) -> Result<Self, TopologyError> {
        if config.nodes.is_empty() {
            return Err(TopologyError::NoNodes);
        }

        let mut names = HashMap::new();
        let mut nodes = Vec::with_capacity(config.nodes.len());
        for (index, node) in config.nodes.iter().enumerate() {
            if names.insert(node.name.clone(), NodeId(index)).is_some() {
                return Err(TopologyError::DuplicateNode(node.name.clone()));
            }
            nodes.push(Node::new(NodeId(index), node.name.clone()));
        }
        let resolve = |name: &str| {
            names
                .get(name)
                .copied()
                .ok_or_else(|| TopologyError::UnknownNode(name.to_string()))
        };

        let mut network = Network {
            nodes,
            interfaces: Vec::new(),
            links: Vec::new(),
        };
        let mut subnets: Vec<Ipv4Network> = Vec::new();

        for (index, link) in config.links.iter().enumerate() {
            let a = resolve(&link.endpoints[0])?;
            let b = resolve(&link.endpoints[1])?;
            if a == b {
                return Err(TopologyError::SelfLoop {
                    link: index,
                    node: link.endpoints[0].clone(),
                });
            }
            if link.max_packets == 0 {
                return Err(TopologyError::ZeroQueueCapacity { link: index });
            }
            if link.data_rate.bps() == 0 {
                return Err(TopologyError::ZeroLinkRate { link: index });
            }

            let subnet = parse_subnet(link.network, link.mask).map_err(|reason| {
                TopologyError::InvalidSubnet {
                    link: index,
                    network: link.network,
                    mask: link.mask,
                    reason,
                }
            })?;
            if subnet.prefix() > 30 {
                return Err(TopologyError::SubnetTooSmall {
                    link: index,
                    subnet,
                });
            }
            if let Some((other_link, other)) = subnets
                .iter()
                .enumerate()
                .find(|(_, other)| other.contains(subnet.network()) || subnet.contains(other.network()))
            {
                return Err(TopologyError::OverlappingSubnet {
                    link: index,
                    subnet,
                    other_link,
                    other: *other,
                });
            }
            subnets.push(subnet);

            let link_id = LinkId(network.links.len());
            let base = u32::from(subnet.network());
            let mut endpoints = [InterfaceId(0); 2];
            for (slot, node) in [a, b].into_iter().enumerate() {
                let iface = InterfaceId(network.interfaces.len());
                let address = Ipv4Addr::from(base + 1 + slot as u32);
                network.interfaces.push(Interface {
                    id: iface,
                    node,
                    link: link_id,
                    address,
                    subnet,
                    tx: TxQueue::new(link.max_packets as usize),
                });
                network.nodes[node.0].attach(iface, address, subnet);
                endpoints[slot] = iface;
                debug!(node = %network.nodes[node.0].name, %address, "assigned address");
            }
            network.links.push(Link {
                endpoints,
                data_rate: link.data_rate,
                delay: link.delay,
            });
        }

        for route in &config.routes {
            let node = resolve(&route.node)?;
            let via = resolve(&route.via)?;
            let destination = parse_subnet(route.destination, route.mask).map_err(|reason| {
                TopologyError::InvalidRoute {
                    node: route.node.clone(),
                    destination: route.destination,
                    mask: route.mask,
                    reason,
                }
            })?;
            let interface = network
                .neighbours(node)
                .find(|(peer, _)| *peer == via)
                .map(|(_, iface)| iface)
                .ok_or_else(|| TopologyError::NotANeighbour {
                    node: route.node.clone(),
                    via: route.via.clone(),
                })?;
            network.nodes[node.0].add_route(Route {
                destination,
                interface,
            });
        }

        network.populate_routes();
        Ok(network)
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.name == name).map(|n| n.id)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn interface(&self, id: InterfaceId) -> &Interface {
        &self.interfaces[id.0]
    }

    pub fn interface_by_address(&self, address: Ipv4Addr) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.address == address)
    }

    /// The interface at the far end of `iface`'s link.
    pub fn peer_of(&self, iface: InterfaceId) -> InterfaceId {
        let link = &self.links[self.interfaces[iface.0].link.0];
        link.peer(iface)
    }

    /// Directly connected nodes with the local interface leading to each.
    pub fn neighbours(&self, node: NodeId) -> impl Iterator<Item = (NodeId, InterfaceId)> + '_ {
        self.nodes[node.0].interfaces.iter().map(move |iface| {
            let peer = self.peer_of(*iface);
            (self.interfaces[peer.0].node, *iface)
        })
    }

    /// Install first-hop routes to every subnet not yet covered, from a
    /// breadth-first search over the link graph.
    fn populate_routes(&mut self) {
        for source in 0..self.nodes.len() {
            let source = NodeId(source);
            let mut first_hop: HashMap<NodeId, InterfaceId> = HashMap::new();
            let mut visited = vec![false; self.nodes.len()];
            visited[source.0] = true;
            let mut frontier = VecDeque::new();

            for (peer, iface) in self.neighbours(source).collect::<Vec<_>>() {
                if !visited[peer.0] {
                    visited[peer.0] = true;
                    first_hop.insert(peer, iface);
                    frontier.push_back(peer);
                }
            }
            let mut order = Vec::new();
            while let Some(current) = frontier.pop_front() {
                order.push(current);
                let hop = first_hop[&current];
                for (peer, _) in self.neighbours(current).collect::<Vec<_>>() {
                    if !visited[peer.0] {
                        visited[peer.0] = true;
                        first_hop.insert(peer, hop);
                        frontier.push_back(peer);
                    }
                }
            }

            for target in order {
                let hop = first_hop[&target];
                let subnets: Vec<Ipv4Network> = self.nodes[target.0]
                    .interfaces
                    .iter()
                    .map(|iface| self.interfaces[iface.0].subnet)
                    .collect();
                let node = &mut self.nodes[source.0];
                for subnet in subnets {
                    if !node.has_route_to(subnet) {
                        node.add_route(Route {
                            destination: subnet,
                            interface: hop,
                        });
                    }
                }
            }
        }
    }

    /// Follow the routing tables hop by hop from `from` towards `address`.
    pub fn path(&self, from: NodeId, address: Ipv4Addr) -> Option<Vec<NodeId>> {
        let mut current = from;
        let mut path = vec![current];
        for _ in 0..=self.nodes.len() {
            match self.nodes[current.0].route(address) {
                RouteDecision::Local => return Some(path),
                RouteDecision::Forward(iface) => {
                    current = self.interfaces[self.peer_of(iface).0].node;
                    path.push(current);
                }
                RouteDecision::NoRoute => return None,
            }
        }
        // Routing loop
        None
    }

    /// Address a packet from `node` to `dst` would carry as its source.
    pub fn source_address(&self, node: NodeId, dst: Ipv4Addr) -> Option<Ipv4Addr> {
        let node = &self.nodes[node.0];
        match node.route(dst) {
            RouteDecision::Local => Some(dst),
            RouteDecision::Forward(iface) => Some(self.interfaces[iface.0].address),
            RouteDecision::NoRoute => None,
        }
    }

    /// Check that an application's destination exists and is reachable (both
    /// ways for connection-oriented traffic, whose acknowledgements travel back).
    pub fn validate_application(
        &self,
        index: usize,
        node: NodeId,
        app: &OnOffConfig,
    ) -> Result<(), TopologyError> {
        let node_name = self.nodes[node.0].name.clone();
        let target = self
            .interface_by_address(app.remote_address)
            .ok_or_else(|| TopologyError::UnknownAddress {
                index,
                node: node_name.clone(),
                address: app.remote_address,
            })?;
        let unreachable = |address| TopologyError::Unreachable {
            index,
            node: node_name.clone(),
            address,
        };
        self.path(node, app.remote_address)
            .ok_or_else(|| unreachable(app.remote_address))?;
        if app.protocol == Protocol::Tcp {
            let source = self
                .source_address(node, app.remote_address)
                .ok_or_else(|| unreachable(app.remote_address))?;
            self.path(target.node, source)
                .ok_or_else(|| unreachable(source))?;
        }
        Ok(())
    }
}

/// Checks on an application that do not depend on the topology.
pub fn validate_traffic(index: usize, app: &OnOffConfig) -> Result<(), TopologyError> {
    if app.payload_size == 0 {
        return Err(TopologyError::ZeroPayload { index });
    }
    if app.data_rate.bps() == 0 {
        return Err(TopologyError::ZeroAppRate { index });
    }
    for (which, variable) in [("on-time", &app.on_time), ("off-time", &app.off_time)] {
        if !variable.is_valid() {
            return Err(TopologyError::InvalidDistribution { index, which });
        }
    }
    if app.on_time.is_always_zero() && app.off_time.is_always_zero() {
        return Err(TopologyError::ZeroCycle { index });
    }
    check_window(format!("application {index}"), app.start, app.stop)
}

pub fn check_window(what: String, start: SimTime, stop: Option<SimTime>) -> Result<(), TopologyError> {
    match stop {
        Some(stop) if start > stop => Err(TopologyError::StartAfterStop { what, start, stop }),
        _ => Ok(()),
    }
}

fn parse_subnet(network: Ipv4Addr, mask: Ipv4Addr) -> Result<Ipv4Network, String> {
    let subnet = Ipv4Network::with_netmask(network, mask).map_err(|e| e.to_string())?;
    if subnet.network() != network {
        return Err(format!("host bits set, network address is {}", subnet.network()));
    }
    Ok(subnet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlab_abstract::{DataRate, LinkConfig, NodeConfig, RandomVariable, RouteConfig};

    fn link(a: &str, b: &str, network: [u8; 4]) -> LinkConfig {
        LinkConfig {
            endpoints: [a.to_string(), b.to_string()],
            data_rate: DataRate::from_mbps(3),
            delay: SimTime::from_millis(2),
            max_packets: 1,
            network: Ipv4Addr::from(network),
            mask: Ipv4Addr::new(255, 255, 255, 0),
        }
    }

    fn config(nodes: &[&str], links: Vec<LinkConfig>) -> TopologyConfig {
        TopologyConfig {
            name: "test".to_string(),
            description: String::new(),
            stop_time: SimTime::from_secs(10),
            seed: 0,
            nodes: nodes
                .iter()
                .map(|n| NodeConfig {
                    name: n.to_string(),
                })
                .collect(),
            links,
            routes: Vec::new(),
            tcp: Default::default(),
            sinks: Vec::new(),
            applications: Vec::new(),
        }
    }

    fn chain() -> TopologyConfig {
        config(
            &["a", "b", "c", "d"],
            vec![
                link("a", "b", [10, 0, 1, 0]),
                link("b", "c", [10, 0, 2, 0]),
                link("c", "d", [10, 0, 3, 0]),
            ],
        )
    }

    fn app(node: &str, remote: [u8; 4], protocol: Protocol) -> OnOffConfig {
        OnOffConfig {
            node: node.to_string(),
            remote_address: Ipv4Addr::from(remote),
            remote_port: 7,
            protocol,
            payload_size: 1448,
            data_rate: DataRate::from_mbps(50),
            on_time: RandomVariable::Constant { value: 1.0 },
            off_time: RandomVariable::Constant { value: 0.0 },
            start: SimTime::from_secs(1),
            stop: None,
        }
    }

    #[test]
    fn assigns_first_two_host_addresses_per_link() {
        let network = Network::build(&chain()).unwrap();
        let addresses: Vec<_> = network.interfaces.iter().map(|i| i.address.to_string()).collect();
        assert_eq!(
            addresses,
            ["10.0.1.1", "10.0.1.2", "10.0.2.1", "10.0.2.2", "10.0.3.1", "10.0.3.2"]
        );
        let b = network.node_by_name("b").unwrap();
        assert_eq!(network.node(b).interfaces.len(), 2);
    }

    #[test]
    fn routes_follow_the_chain() {
        let network = Network::build(&chain()).unwrap();
        let a = network.node_by_name("a").unwrap();
        let path = network.path(a, Ipv4Addr::new(10, 0, 3, 2)).unwrap();
        let names: Vec<_> = path.iter().map(|n| network.node(*n).name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c", "d"]);
        assert_eq!(
            network.source_address(a, Ipv4Addr::new(10, 0, 3, 2)),
            Some(Ipv4Addr::new(10, 0, 1, 1))
        );
        // one connected subnet plus two learned ones, all out of the only interface
        let routes = network.node(a).routes();
        assert_eq!(routes.len(), 3);
        assert!(routes.iter().all(|r| r.interface == network.node(a).interfaces[0]));
    }

    #[test]
    fn explicit_routes_take_precedence() {
        let mut cfg = config(
            &["a", "b", "c"],
            vec![
                link("a", "b", [10, 0, 1, 0]),
                link("a", "c", [10, 0, 2, 0]),
                link("b", "c", [10, 0, 3, 0]),
            ],
        );
        cfg.routes.push(RouteConfig {
            node: "a".to_string(),
            destination: Ipv4Addr::new(10, 0, 3, 0),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            via: "c".to_string(),
        });
        let network = Network::build(&cfg).unwrap();
        let a = network.node_by_name("a").unwrap();
        let path = network.path(a, Ipv4Addr::new(10, 0, 3, 1)).unwrap();
        assert_eq!(network.node(path[1]).name, "c");
    }

    #[test]
    fn rejects_bad_link_configuration() {
        let mut cfg = chain();
        cfg.links[1].max_packets = 0;
        assert!(matches!(
            Network::build(&cfg),
            Err(TopologyError::ZeroQueueCapacity { link: 1 })
        ));

        let mut cfg = chain();
        cfg.links[2].network = Ipv4Addr::new(10, 0, 1, 0);
        assert!(matches!(
            Network::build(&cfg),
            Err(TopologyError::OverlappingSubnet { link: 2, other_link: 0, .. })
        ));

        let mut cfg = chain();
        cfg.links[0].network = Ipv4Addr::new(10, 0, 1, 7);
        assert!(matches!(
            Network::build(&cfg),
            Err(TopologyError::InvalidSubnet { link: 0, .. })
        ));

        let mut cfg = chain();
        cfg.links[0].mask = Ipv4Addr::new(255, 0, 255, 0);
        assert!(matches!(
            Network::build(&cfg),
            Err(TopologyError::InvalidSubnet { .. })
        ));

        let mut cfg = chain();
        cfg.links[0].mask = Ipv4Addr::new(255, 255, 255, 254);
        assert!(matches!(
            Network::build(&cfg),
            Err(TopologyError::SubnetTooSmall { .. })
        ));

        let mut cfg = chain();
        cfg.links[0].endpoints[1] = "z".to_string();
        assert!(matches!(
            Network::build(&cfg),
            Err(TopologyError::UnknownNode(name)) if name == "z"
        ));

        let mut cfg = chain();
        cfg.links[0].endpoints[1] = "a".to_string();
        assert!(matches!(
            Network::build(&cfg),
            Err(TopologyError::SelfLoop { .. })
        ));
    }

    #[test]
    fn unreachable_destinations_are_reported() {
        let cfg = config(
            &["a", "b", "c", "d"],
            vec![link("a", "b", [10, 0, 1, 0]), link("c", "d", [10, 0, 2, 0])],
        );
        let network = Network::build(&cfg).unwrap();
        let a = network.node_by_name("a").unwrap();

        assert!(network
            .validate_application(0, a, &app("a", [10, 0, 1, 2], Protocol::Udp))
            .is_ok());
        assert!(matches!(
            network.validate_application(0, a, &app("a", [10, 0, 2, 2], Protocol::Udp)),
            Err(TopologyError::Unreachable { .. })
        ));
        assert!(matches!(
            network.validate_application(0, a, &app("a", [10, 9, 9, 9], Protocol::Tcp)),
            Err(TopologyError::UnknownAddress { .. })
        ));
    }

    #[test]
    fn traffic_parameters_are_checked() {
        assert!(validate_traffic(0, &app("a", [10, 0, 1, 2], Protocol::Udp)).is_ok());

        let mut bad = app("a", [10, 0, 1, 2], Protocol::Udp);
        bad.payload_size = 0;
        assert!(matches!(validate_traffic(3, &bad), Err(TopologyError::ZeroPayload { index: 3 })));

        let mut bad = app("a", [10, 0, 1, 2], Protocol::Udp);
        bad.on_time = RandomVariable::Constant { value: 0.0 };
        assert!(matches!(validate_traffic(0, &bad), Err(TopologyError::ZeroCycle { .. })));

        for on_time in [
            RandomVariable::Uniform { min: 0.0, max: 0.0 },
            RandomVariable::Exponential { mean: 0.0 },
        ] {
            let mut bad = app("a", [10, 0, 1, 2], Protocol::Udp);
            bad.on_time = on_time;
            bad.off_time = RandomVariable::Exponential { mean: 0.0 };
            assert!(matches!(validate_traffic(0, &bad), Err(TopologyError::ZeroCycle { .. })));
        }

        let mut bad = app("a", [10, 0, 1, 2], Protocol::Udp);
        bad.on_time = RandomVariable::Uniform { min: 0.0, max: 0.0 };
        bad.off_time = RandomVariable::Constant { value: 0.5 };
        assert!(validate_traffic(0, &bad).is_ok());

        let mut bad = app("a", [10, 0, 1, 2], Protocol::Udp);
        bad.off_time = RandomVariable::Uniform { min: 2.0, max: 1.0 };
        assert!(matches!(
            validate_traffic(0, &bad),
            Err(TopologyError::InvalidDistribution { which: "off-time", .. })
        ));

        let mut bad = app("a", [10, 0, 1, 2], Protocol::Udp);
        bad.stop = Some(SimTime::from_millis(500));
        let err = validate_traffic(1, &bad).unwrap_err();
        assert_eq!(err.to_string(), "application 1: start 1s is after stop 500ms");
    }

    #[test]
    fn errors_describe_the_problem() {
        let mut cfg = chain();
        cfg.nodes.push(NodeConfig {
            name: "a".to_string(),
        });
        let err = Network::build(&cfg).unwrap_err();
        assert_eq!(err.to_string(), "duplicate node name 'a'");
    }
}
