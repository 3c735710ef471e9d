//! Routing chains towards nodes not on the client's bus
//!
//! Every hop is an openSYDE router that is put into the extended session
//! and told to forward on its outbound interface. Activated hops are shared
//! between chains. A failing hop blocks both the hop and the target, and
//! later chains through a blocked node are skipped without wire traffic.
//!
//! KEFEX targets are reached through a [`LegacyRoutingAdapter`] that tunnels
//! their requests through the last router.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use syde_core::{DiagnosticServer, RouteHop, ServerAddress, SystemDefinition};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::protocol::{session, DiagProtocol, NativeProtocol, ProtocolError};
use crate::transport::{BusDispatcher, IncomingMessage, TransportAdapter, TransportError};

/// One intermediate hop of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingChainNode {
    pub node_index: usize,
    pub out_interface: u8,
}

impl From<&RouteHop> for RoutingChainNode {
    fn from(hop: &RouteHop) -> Self {
        Self {
            node_index: hop.node,
            out_interface: hop.out_interface,
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum RoutingError {
    #[error("Routing skipped, path uses defect node {0}")]
    Blocked(String),

    #[error("Node {0} cannot act as router")]
    NotRouter(String),

    #[error("Router {hop} unreachable: {source}")]
    Open {
        hop: String,
        #[source]
        source: TransportError,
    },

    #[error("Routing activation on {hop} failed: {source}")]
    Activation {
        hop: String,
        #[source]
        source: ProtocolError,
    },
}

/// Builds, caches and tears down routing chains of one session
pub struct RoutingManager {
    dispatcher: Arc<dyn BusDispatcher>,
    config: DriverConfig,
    active_bus: u8,
    routers: BTreeMap<usize, Arc<Mutex<DiagProtocol>>>,
    /// Hop and outbound interface, in activation order
    activated: Vec<(usize, u8)>,
    blocked: BTreeSet<usize>,
    chains: BTreeMap<usize, Vec<RoutingChainNode>>,
}

impl RoutingManager {
    pub fn new(dispatcher: Arc<dyn BusDispatcher>, config: &DriverConfig, active_bus: u8) -> Self {
        Self {
            dispatcher,
            config: config.clone(),
            active_bus,
            routers: BTreeMap::new(),
            activated: Vec::new(),
            blocked: BTreeSet::new(),
            chains: BTreeMap::new(),
        }
    }

    /// Reuse the session protocol of an active node when it acts as router
    pub fn register_router(&mut self, node_index: usize, protocol: Arc<Mutex<DiagProtocol>>) {
        self.routers.insert(node_index, protocol);
    }

    pub fn chain(&self, target: usize) -> Option<&[RoutingChainNode]> {
        self.chains.get(&target).map(|c| c.as_slice())
    }

    pub fn blocked_nodes(&self) -> &BTreeSet<usize> {
        &self.blocked
    }

    pub fn is_blocked(&self, node: usize) -> bool {
        self.blocked.contains(&node)
    }

    async fn router(
        &mut self,
        system: &SystemDefinition,
        hop: usize,
    ) -> Result<Arc<Mutex<DiagProtocol>>, RoutingError> {
        if let Some(router) = self.routers.get(&hop) {
            return Ok(router.clone());
        }

        let (kind, address) = {
            let node = system
                .node(hop)
                .ok_or_else(|| RoutingError::NotRouter(format!("<node {}>", hop)))?
                .read();
            (node.diagnostic_server, node.server_address(self.active_bus))
        };
        let name = system.node_name(hop);
        let address = match (kind, address) {
            (DiagnosticServer::Native, Some(address)) => address,
            _ => return Err(RoutingError::NotRouter(name)),
        };

        let transport = self
            .dispatcher
            .open(address)
            .await
            .map_err(|source| RoutingError::Open { hop: name, source })?;
        let protocol = Arc::new(Mutex::new(DiagProtocol::Native(NativeProtocol::new(
            hop,
            transport,
            &self.config,
        ))));
        self.routers.insert(hop, protocol.clone());
        Ok(protocol)
    }

    /// Activate every hop towards `target`
    ///
    /// Returns the tunnel adapter for a routed KEFEX target. On failure the
    /// failing hop and the target are blocked.
    pub async fn establish(
        &mut self,
        system: &SystemDefinition,
        target: usize,
        hops: &[RouteHop],
    ) -> Result<Option<Arc<LegacyRoutingAdapter>>, RoutingError> {
        if hops.is_empty() {
            return Ok(None);
        }

        if let Some(blocked) = std::iter::once(target)
            .chain(hops.iter().map(|h| h.node))
            .find(|n| self.blocked.contains(n))
        {
            self.blocked.insert(target);
            return Err(RoutingError::Blocked(system.node_name(blocked)));
        }

        let mut chain = Vec::with_capacity(hops.len());
        let mut last_router = None;
        for hop in hops {
            let router = match self.router(system, hop.node).await {
                Ok(router) => router,
                Err(e) => {
                    self.block(hop.node, target);
                    return Err(e);
                }
            };

            if !self.activated.contains(&(hop.node, hop.out_interface)) {
                if let Err(source) = activate(&router, hop.out_interface).await {
                    self.block(hop.node, target);
                    return Err(RoutingError::Activation {
                        hop: system.node_name(hop.node),
                        source,
                    });
                }
                debug!(
                    hop = %system.node_name(hop.node),
                    out_interface = hop.out_interface,
                    "Routing activated"
                );
                self.activated.push((hop.node, hop.out_interface));
            }

            chain.push(RoutingChainNode::from(hop));
            last_router = Some((router, hop.out_interface));
        }

        let (kind, address) = match system.node(target) {
            Some(node) => {
                let node = node.read();
                (node.diagnostic_server, node.server_address(self.active_bus))
            }
            None => (DiagnosticServer::None, None),
        };
        let adapter = match (kind, address, last_router) {
            (DiagnosticServer::Legacy, Some(address), Some((router, out_interface))) => {
                let transport = router
                    .lock()
                    .await
                    .as_native()
                    .map(|p| p.transport())
                    .ok_or_else(|| RoutingError::NotRouter(system.node_name(target)))?;
                let can_id = self.config.legacy.base_can_id + u32::from(address.node_id);
                Some(Arc::new(LegacyRoutingAdapter::new(
                    transport,
                    out_interface,
                    can_id,
                    address,
                )))
            }
            _ => None,
        };

        info!(node = %system.node_name(target), hops = chain.len(), "Routing chain established");
        self.chains.insert(target, chain);
        Ok(adapter)
    }

    fn block(&mut self, hop: usize, target: usize) {
        self.blocked.insert(hop);
        self.blocked.insert(target);
    }

    /// Stop routing on every activated hop, farthest first
    ///
    /// Failures are logged only.
    pub async fn teardown(&mut self) {
        while let Some((hop, out_interface)) = self.activated.pop() {
            let Some(router) = self.routers.get(&hop) else {
                continue;
            };
            let protocol = router.lock().await;
            if let Some(native) = protocol.as_native() {
                if let Err(e) = native.stop_routing().await {
                    warn!(hop, out_interface, error = %e, "Failed to stop routing");
                }
            }
        }
        self.chains.clear();
        self.blocked.clear();
        self.routers.clear();
    }
}

async fn activate(router: &Mutex<DiagProtocol>, out_interface: u8) -> Result<(), ProtocolError> {
    let mut protocol = router.lock().await;
    protocol.set_session(session::EXTENDED).await?;
    match protocol.as_native() {
        Some(native) => native.start_routing(out_interface).await,
        None => Err(ProtocolError::NotSupported("KEFEX")),
    }
}

/// Tunnel towards a KEFEX server behind an openSYDE router
///
/// Requests are prefixed with the router's outbound interface and the CAN
/// id of the target. Unsolicited messages carrying the same header are
/// forwarded with the header removed.
pub struct LegacyRoutingAdapter {
    inner: Arc<dyn TransportAdapter>,
    header: [u8; 3],
    address: ServerAddress,
    incoming_tx: broadcast::Sender<IncomingMessage>,
    forwarder: JoinHandle<()>,
}

impl LegacyRoutingAdapter {
    pub fn new(
        inner: Arc<dyn TransportAdapter>,
        out_interface: u8,
        can_id: u32,
        address: ServerAddress,
    ) -> Self {
        let id = (can_id as u16 & 0x7FF).to_be_bytes();
        let header = [out_interface, id[0], id[1]];
        let (incoming_tx, _) = broadcast::channel(256);

        let mut upstream = inner.subscribe();
        let tx = incoming_tx.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Ok(message) if message.data.starts_with(&header) => {
                        let _ = tx.send(IncomingMessage {
                            timestamp: message.timestamp,
                            data: message.data[header.len()..].to_vec(),
                            source: address,
                        });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Tunneled messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            inner,
            header,
            address,
            incoming_tx,
            forwarder,
        }
    }

    fn wrap(&self, request: &[u8]) -> Vec<u8> {
        let mut tunneled = self.header.to_vec();
        tunneled.extend_from_slice(request);
        tunneled
    }
}

impl fmt::Debug for LegacyRoutingAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyRoutingAdapter")
            .field("header", &hex::encode(self.header))
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Drop for LegacyRoutingAdapter {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[async_trait]
impl TransportAdapter for LegacyRoutingAdapter {
    async fn send_receive(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.inner.send_receive(&self.wrap(request), timeout).await
    }

    async fn send(&self, request: &[u8]) -> Result<(), TransportError> {
        self.inner.send(&self.wrap(request)).await
    }

    fn subscribe(&self) -> broadcast::Receiver<IncomingMessage> {
        self.incoming_tx.subscribe()
    }

    fn server_address(&self) -> ServerAddress {
        self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::transport::mock::MockBus;
    use pretty_assertions::assert_eq;
    use syde_core::{Interface, InterfaceKind, Node, SystemConfig};

    fn node(name: &str, server: DiagnosticServer, node_id: u8) -> Node {
        let mut node = Node::new(name, server);
        node.interfaces.push(Interface {
            bus_index: 0,
            node_id,
            number: 0,
            kind: InterfaceKind::Can,
        });
        node
    }

    fn addr(node_id: u8) -> ServerAddress {
        ServerAddress {
            bus_index: 0,
            node_id,
        }
    }

    fn system() -> SystemDefinition {
        SystemDefinition::new(SystemConfig {
            nodes: vec![
                node("Gateway", DiagnosticServer::Native, 1),
                node("Router", DiagnosticServer::Native, 2),
                node("Bridge", DiagnosticServer::Native, 3),
                node("Target", DiagnosticServer::Native, 4),
                node("Behind", DiagnosticServer::Native, 5),
                node("Kefex", DiagnosticServer::Legacy, 6),
            ],
            ..Default::default()
        })
    }

    fn hop(node: usize, out_interface: u8) -> RouteHop {
        RouteHop {
            node,
            out_interface,
        }
    }

    fn manager(bus: &Arc<MockBus>) -> RoutingManager {
        RoutingManager::new(bus.clone(), &DriverConfig::default(), 0)
    }

    #[tokio::test]
    async fn test_direct_node_needs_no_chain() {
        let bus = Arc::new(MockBus::new(&MockConfig::default()));
        let mut routing = manager(&bus);
        let adapter = routing.establish(&system(), 0, &[]).await.unwrap();
        assert!(adapter.is_none());
        assert!(routing.chain(0).is_none());
    }

    #[tokio::test]
    async fn test_shared_hops_activated_once() {
        let bus = Arc::new(MockBus::new(&MockConfig::default()));
        let mut routing = manager(&bus);
        let system = system();

        routing.establish(&system, 3, &[hop(0, 1), hop(1, 2)]).await.unwrap();
        routing.establish(&system, 4, &[hop(0, 1)]).await.unwrap();

        let gateway = bus.server(addr(1));
        assert_eq!(gateway.count_requests(&[0x31, 0x01, 0x02, 0x16]), 1);
        assert_eq!(gateway.requests()[0], vec![0x10, 0x03]);
        assert_eq!(gateway.requests()[1], vec![0x31, 0x01, 0x02, 0x16, 0x01]);
        assert_eq!(
            routing.chain(3).unwrap(),
            &[
                RoutingChainNode {
                    node_index: 0,
                    out_interface: 1
                },
                RoutingChainNode {
                    node_index: 1,
                    out_interface: 2
                }
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_hop_blocks_later_chains() {
        let bus = Arc::new(MockBus::new(&MockConfig::default()));
        bus.server(addr(2)).add_timeout(vec![0x31, 0x01, 0x02, 0x16]);
        let mut routing = manager(&bus);
        let system = system();

        let err = routing
            .establish(&system, 3, &[hop(0, 1), hop(1, 2), hop(2, 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::Activation { .. }));
        assert!(routing.is_blocked(3));
        assert!(routing.is_blocked(1));
        assert!(bus.server(addr(3)).requests().is_empty());

        let before: usize = (1..=3).map(|id| bus.server(addr(id)).requests().len()).sum();
        let err = routing
            .establish(&system, 4, &[hop(0, 1), hop(3, 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::Blocked(ref name) if name == "Target"));
        assert!(routing.is_blocked(4));
        let after: usize = (1..=3).map(|id| bus.server(addr(id)).requests().len()).sum();
        assert_eq!(before, after);
        assert!(bus.server(addr(4)).requests().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_hop_is_not_a_router() {
        let bus = Arc::new(MockBus::new(&MockConfig::default()));
        let mut routing = manager(&bus);
        let err = routing
            .establish(&system(), 4, &[hop(5, 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::NotRouter(ref name) if name == "Kefex"));
    }

    #[tokio::test]
    async fn test_legacy_target_gets_tunnel() {
        let bus = Arc::new(MockBus::new(&MockConfig::default()));
        let mut routing = manager(&bus);
        let adapter = routing
            .establish(&system(), 5, &[hop(0, 2)])
            .await
            .unwrap()
            .expect("tunnel adapter");

        let gateway = bus.server(addr(1));
        // base id 0x600 + node id 6
        gateway.add_response(vec![0x02, 0x06, 0x06, 0x01], vec![0x41]);
        let response = adapter
            .send_receive(&[0x01, 0x00], Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(response, vec![0x41]);
        assert_eq!(
            gateway.requests().last().unwrap(),
            &vec![0x02, 0x06, 0x06, 0x01, 0x00]
        );
        assert_eq!(adapter.server_address(), addr(6));
    }

    #[tokio::test]
    async fn test_tunnel_forwards_matching_events() {
        let bus = Arc::new(MockBus::new(&MockConfig::default()));
        let gateway = bus.server(addr(1));
        let adapter = LegacyRoutingAdapter::new(gateway.clone(), 2, 0x606, addr(6));
        let mut incoming = adapter.subscribe();

        gateway.inject_incoming(vec![0xFC, 0x00, 0x00, 0x01, 0x05]);
        gateway.inject_incoming(vec![0x02, 0x06, 0x06, 0x47, 0x01, 0x00, 0x2A]);

        let message = tokio::time::timeout(Duration::from_secs(1), incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.data, vec![0x47, 0x01, 0x00, 0x2A]);
        assert_eq!(message.source, addr(6));
    }

    #[tokio::test]
    async fn test_teardown_stops_routing() {
        let bus = Arc::new(MockBus::new(&MockConfig::default()));
        let mut routing = manager(&bus);
        let system = system();
        routing.establish(&system, 3, &[hop(0, 1)]).await.unwrap();
        routing.teardown().await;

        assert_eq!(bus.server(addr(1)).count_requests(&[0x31, 0x02, 0x02, 0x16]), 1);
        assert!(routing.chain(3).is_none());
    }

    #[tokio::test]
    async fn test_teardown_stops_farthest_hop_first() {
        let bus = Arc::new(MockBus::new(&MockConfig::default()));
        let mut routing = manager(&bus);
        let system = system();
        routing
            .establish(&system, 3, &[hop(0, 1), hop(1, 2), hop(2, 1)])
            .await
            .unwrap();
        routing.establish(&system, 4, &[hop(0, 1), hop(1, 2)]).await.unwrap();
        routing.teardown().await;

        let stops: Vec<ServerAddress> = bus
            .requests()
            .into_iter()
            .filter(|(_, request)| request.starts_with(&[0x31, 0x02, 0x02, 0x16]))
            .map(|(address, _)| address)
            .collect();
        assert_eq!(stops, vec![addr(3), addr(2), addr(1)]);

        // nothing left to stop
        routing.teardown().await;
        let again = bus
            .requests()
            .iter()
            .filter(|(_, request)| request.starts_with(&[0x31, 0x02, 0x02, 0x16]))
            .count();
        assert_eq!(again, 3);
    }
}
