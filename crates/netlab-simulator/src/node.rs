use ipnetwork::Ipv4Network;
use netlab_abstract::Protocol;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

use crate::link::TxQueue;

const FIRST_EPHEMERAL_PORT: u16 = 49153;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InterfaceId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LinkId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if{}", self.0)
    }
}

/// One endpoint of a link, owned by a node.
#[derive(Debug)]
pub struct Interface {
    pub id: InterfaceId,
    pub node: NodeId,
    pub link: LinkId,
    pub address: Ipv4Addr,
    pub subnet: Ipv4Network,
    pub tx: TxQueue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: Ipv4Network,
    pub interface: InterfaceId,
}

/// What a transport port on a node is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Sink(usize),
    Application(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Addressed to this node.
    Local,
    Forward(InterfaceId),
    NoRoute,
}

#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub interfaces: Vec<InterfaceId>,
    addresses: Vec<Ipv4Addr>,
    routes: Vec<Route>,
    bindings: HashMap<(Protocol, u16), Endpoint>,
    next_ephemeral_port: u16,
}

impl Node {
    pub fn new(id: NodeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            interfaces: Vec::new(),
            addresses: Vec::new(),
            routes: Vec::new(),
            bindings: HashMap::new(),
            next_ephemeral_port: FIRST_EPHEMERAL_PORT,
        }
    }

    /// Attach an interface and install the route to its directly connected subnet.
    pub fn attach(&mut self, iface: InterfaceId, address: Ipv4Addr, subnet: Ipv4Network) {
        self.interfaces.push(iface);
        self.addresses.push(address);
        self.add_route(Route {
            destination: subnet,
            interface: iface,
        });
    }

    pub fn addresses(&self) -> &[Ipv4Addr] {
        &self.addresses
    }

    pub fn owns(&self, address: Ipv4Addr) -> bool {
        self.addresses.contains(&address)
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn add_route(&mut self, route: Route) {
        self.routes.push(route);
    }

    pub fn has_route_to(&self, destination: Ipv4Network) -> bool {
        self.routes.iter().any(|r| r.destination == destination)
    }

    /// Longest-prefix match; the earliest installed route wins a tie.
    pub fn lookup(&self, dst: Ipv4Addr) -> Option<InterfaceId> {
        self.routes
            .iter()
            .filter(|r| r.destination.contains(dst))
            .min_by_key(|r| Reverse(r.destination.prefix()))
            .map(|r| r.interface)
    }

    pub fn route(&self, dst: Ipv4Addr) -> RouteDecision {
        if self.owns(dst) {
            return RouteDecision::Local;
        }
        match self.lookup(dst) {
            Some(iface) => RouteDecision::Forward(iface),
            None => RouteDecision::NoRoute,
        }
    }

    /// Bind `port`. On conflict returns the endpoint already holding it.
    pub fn bind(&mut self, protocol: Protocol, port: u16, endpoint: Endpoint) -> Result<(), Endpoint> {
        match self.bindings.get(&(protocol, port)) {
            Some(existing) => Err(*existing),
            None => {
                self.bindings.insert((protocol, port), endpoint);
                Ok(())
            }
        }
    }

    pub fn endpoint(&self, protocol: Protocol, port: u16) -> Option<Endpoint> {
        self.bindings.get(&(protocol, port)).copied()
    }

    /// Next free ephemeral port for `protocol`.
    pub fn allocate_port(&mut self, protocol: Protocol) -> u16 {
        loop {
            let port = self.next_ephemeral_port;
            self.next_ephemeral_port = match port.checked_add(1) {
                Some(next) => next,
                None => FIRST_EPHEMERAL_PORT,
            };
            if !self.bindings.contains_key(&(protocol, port)) {
                return port;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    fn relay() -> Node {
        let mut node = Node::new(NodeId(1), "n1");
        node.attach(InterfaceId(1), Ipv4Addr::new(10, 0, 1, 2), net("10.0.1.0/24"));
        node.attach(InterfaceId(2), Ipv4Addr::new(10, 0, 2, 1), net("10.0.2.0/24"));
        node
    }

    #[test]
    fn own_addresses_are_delivered_locally() {
        let node = relay();
        assert_eq!(node.route(Ipv4Addr::new(10, 0, 2, 1)), RouteDecision::Local);
        assert_eq!(
            node.route(Ipv4Addr::new(10, 0, 2, 2)),
            RouteDecision::Forward(InterfaceId(2))
        );
        assert_eq!(node.route(Ipv4Addr::new(192, 168, 0, 1)), RouteDecision::NoRoute);
    }

    #[test]
    fn longest_prefix_wins() {
        let mut node = relay();
        node.add_route(Route {
            destination: net("10.0.0.0/8"),
            interface: InterfaceId(1),
        });
        node.add_route(Route {
            destination: net("10.0.2.128/25"),
            interface: InterfaceId(1),
        });
        assert_eq!(node.lookup(Ipv4Addr::new(10, 0, 2, 5)), Some(InterfaceId(2)));
        assert_eq!(node.lookup(Ipv4Addr::new(10, 0, 2, 200)), Some(InterfaceId(1)));
        assert_eq!(node.lookup(Ipv4Addr::new(10, 9, 9, 9)), Some(InterfaceId(1)));
    }

    #[test]
    fn ports_bind_once_and_ephemeral_ports_skip_bound_ones() {
        let mut node = relay();
        assert!(node.bind(Protocol::Udp, 7, Endpoint::Sink(0)).is_ok());
        assert_eq!(
            node.bind(Protocol::Udp, 7, Endpoint::Sink(1)),
            Err(Endpoint::Sink(0))
        );
        assert!(node.bind(Protocol::Tcp, 7, Endpoint::Sink(1)).is_ok());

        node.bind(Protocol::Udp, 49153, Endpoint::Application(0)).unwrap();
        assert_eq!(node.allocate_port(Protocol::Udp), 49154);
        assert_eq!(node.allocate_port(Protocol::Tcp), 49155);
        assert_eq!(node.endpoint(Protocol::Tcp, 7), Some(Endpoint::Sink(1)));
    }
}
