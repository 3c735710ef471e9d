//! Communication driver
//!
//! Owns the per-node protocols and data dealers of one diagnostic session and
//! walks them through the session lifecycle:
//!
//! ```text
//! Uninitialized ─init_diag─▶ Initialized ─set_diagnostic_mode─▶ RoutingEstablished
//!                                                                    │
//!        Stopped ◀─stop_diagnosis_server─ Cycling ◀─start_cycling─ SessionActive
//! ```
//!
//! Bulk steps always visit every node; failures are collected in an
//! [`ErrorReport`] and the failing nodes are marked defect.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use syde_core::{
    DiagnosticServer, ElementId, SharedNode, SystemDefinition, TransmissionMode, ViewConfig,
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DriverConfig;
use crate::cyclic::{CycledNode, CyclicEngine, EngineContext, SignalEvent, SubscriberRegistry};
use crate::dealer::DataDealer;
use crate::error::{DriverError, DriverResult, ErrorReport};
use crate::polling::{PollOutput, PollingEngine};
use crate::protocol::{
    session, DataPoolEvent, DiagProtocol, LegacyProtocol, NativeProtocol, ProtocolKind,
};
use crate::routing::{LegacyRoutingAdapter, RoutingManager};
use crate::transport::{create_dispatcher, BusDispatcher};
use crate::verifier::verify_node;

/// Negative response code for "no more event-driven slots"
const NRC_TOO_MANY_TRANSMISSIONS: u8 = 0x70;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Uninitialized,
    Initialized,
    RoutingEstablished,
    SessionActive,
    Cycling,
    Stopped,
}

/// Per-node resources of a session
///
/// Fields drop in declaration order: the dealer goes before the protocol it
/// uses, the protocol before the routing adapter it talks through.
pub struct ActiveNode {
    pub dealer: Option<Arc<DataDealer>>,
    pub protocol: Arc<Mutex<DiagProtocol>>,
    pub route_adapter: Option<Arc<LegacyRoutingAdapter>>,
    pub node: SharedNode,
    pub kind: ProtocolKind,
    /// Session, verification and NVM access apply
    pub diagnostics: bool,
}

/// Outcome of [`CommunicationDriver::set_up_cyclic_transmissions`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CyclicSetupReport {
    /// Elements whose registration failed, with a readable reason
    pub failed: Vec<(ElementId, String)>,
    /// Registered transmissions per node
    pub registered: BTreeMap<usize, usize>,
    /// Position in the view's read rails of the first element rejected
    /// because the server ran out of transmission slots
    pub first_slot_exhausted: Option<usize>,
}

pub struct CommunicationDriver {
    cyclic: Option<CyclicEngine>,
    config: DriverConfig,
    system: Arc<SystemDefinition>,
    view: ViewConfig,
    dispatcher: Arc<dyn BusDispatcher>,
    state: DriverState,
    nodes: BTreeMap<usize, ActiveNode>,
    routing: Option<RoutingManager>,
    defect: BTreeSet<usize>,
    pending: ErrorReport,
    registry: Arc<RwLock<SubscriberRegistry>>,
    events: broadcast::Sender<DataPoolEvent>,
    polling: PollingEngine,
}

impl CommunicationDriver {
    /// Create a driver using the dispatcher from `config`
    pub fn new(
        config: DriverConfig,
        system: Arc<SystemDefinition>,
        view: ViewConfig,
    ) -> DriverResult<Self> {
        let dispatcher = create_dispatcher(&config.dispatcher)
            .map_err(|e| DriverError::Config(format!("dispatcher: {}", e)))?;
        Ok(Self::with_dispatcher(config, system, view, dispatcher))
    }

    pub fn with_dispatcher(
        config: DriverConfig,
        system: Arc<SystemDefinition>,
        view: ViewConfig,
        dispatcher: Arc<dyn BusDispatcher>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            cyclic: None,
            config,
            system,
            view,
            dispatcher,
            state: DriverState::Uninitialized,
            nodes: BTreeMap::new(),
            routing: None,
            defect: BTreeSet::new(),
            pending: ErrorReport::new(),
            registry: Arc::new(RwLock::new(SubscriberRegistry::new())),
            events,
            polling: PollingEngine::new(),
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn defect_nodes(&self) -> &BTreeSet<usize> {
        &self.defect
    }

    pub fn active_node(&self, node_index: usize) -> Option<&ActiveNode> {
        self.nodes.get(&node_index)
    }

    /// Data dealers of all communicating nodes
    pub fn data_dealers(&self) -> Vec<Arc<DataDealer>> {
        self.diag_nodes().filter_map(|(_, n)| n.dealer.clone()).collect()
    }

    pub fn data_dealer(&self, node_index: usize) -> DriverResult<Arc<DataDealer>> {
        self.nodes
            .get(&node_index)
            .filter(|_| !self.defect.contains(&node_index))
            .and_then(|n| n.dealer.clone())
            .ok_or_else(|| DriverError::Range(format!("node {} has no data dealer", node_index)))
    }

    pub fn polling(&self) -> &PollingEngine {
        &self.polling
    }

    pub fn subscribe_data_pool_events(&self) -> broadcast::Receiver<DataPoolEvent> {
        self.events.subscribe()
    }

    fn require_state(&self, operation: &str, allowed: &[DriverState]) -> DriverResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(DriverError::Config(format!(
                "{} not possible in state {:?}",
                operation, self.state
            )))
        }
    }

    /// Nodes with diagnostics that are not defect, in index order
    fn diag_nodes(&self) -> impl Iterator<Item = (usize, &ActiveNode)> {
        self.nodes
            .iter()
            .filter(|(i, n)| n.diagnostics && !self.defect.contains(i))
            .map(|(i, n)| (*i, n))
    }

    fn mark_defect(&mut self, report: &mut ErrorReport, node_index: usize, reason: String) {
        let name = self.system.node_name(node_index);
        error!(node = %name, %reason, "Node failed");
        report.push(node_index, name, reason);
        self.defect.insert(node_index);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create protocols and data dealers for the active nodes
    pub async fn init_diag(&mut self) -> DriverResult<()> {
        self.require_state("init", &[DriverState::Uninitialized, DriverState::Stopped])?;
        self.nodes.clear();
        self.defect.clear();
        self.pending = ErrorReport::new();

        let mut routing =
            RoutingManager::new(self.dispatcher.clone(), &self.config, self.view.active_bus);
        let mut pending = ErrorReport::new();

        for &index in &self.view.active_nodes {
            let node = self
                .system
                .node(index)
                .cloned()
                .ok_or_else(|| DriverError::Config(format!("active node {} not defined", index)))?;
            let (server, address, name) = {
                let n = node.read();
                (n.diagnostic_server, n.server_address(self.view.active_bus), n.name.clone())
            };
            let diagnostics = self.view.requires_diagnostics(index);

            let kind = match server {
                DiagnosticServer::Native => ProtocolKind::Native,
                DiagnosticServer::Legacy => ProtocolKind::Legacy,
                DiagnosticServer::None => {
                    if diagnostics && !self.view.used_data_pools(index).is_empty() {
                        return Err(DriverError::Config(format!(
                            "node \"{}\" has no diagnostic server",
                            name
                        )));
                    }
                    debug!(node = %name, "Third-party node skipped");
                    continue;
                }
            };
            let address = address
                .ok_or_else(|| DriverError::Config(format!("node \"{}\" has no interface", name)))?;

            let routed = !self.view.route_to(index).is_empty();
            let protocol = if kind == ProtocolKind::Legacy && routed {
                // Dispatcher is attached once the routing chain exists
                DiagProtocol::Legacy(LegacyProtocol::new(index, None, &self.config))
            } else {
                let transport = match self.dispatcher.open(address).await {
                    Ok(transport) => transport,
                    Err(e) => {
                        error!(node = %name, error = %e, "Cannot open channel");
                        pending.push(index, name, e.to_string());
                        self.defect.insert(index);
                        continue;
                    }
                };
                match kind {
                    ProtocolKind::Native => {
                        DiagProtocol::Native(NativeProtocol::new(index, transport, &self.config))
                    }
                    ProtocolKind::Legacy => DiagProtocol::Legacy(LegacyProtocol::new(
                        index,
                        Some(transport),
                        &self.config,
                    )),
                }
            };

            let protocol = Arc::new(Mutex::new(protocol));
            if kind == ProtocolKind::Native {
                routing.register_router(index, protocol.clone());
            }
            let dealer = diagnostics
                .then(|| Arc::new(DataDealer::new(index, node.clone(), protocol.clone())));
            self.nodes.insert(
                index,
                ActiveNode {
                    dealer,
                    protocol,
                    route_adapter: None,
                    node,
                    kind,
                    diagnostics,
                },
            );
        }

        self.routing = Some(routing);
        self.pending = pending;
        self.state = DriverState::Initialized;
        info!(nodes = self.nodes.len(), "Diagnostic driver initialized");
        Ok(())
    }

    /// Establish routing, start sessions and verify data pools
    ///
    /// Every step visits all nodes. Verification only runs if routing and
    /// session start succeeded everywhere.
    pub async fn set_diagnostic_mode(&mut self) -> DriverResult<()> {
        self.require_state("diagnostic mode", &[DriverState::Initialized])?;
        let mut report = std::mem::take(&mut self.pending);

        report.extend(self.establish_routing().await);
        self.state = DriverState::RoutingEstablished;

        report.extend(self.start_sessions().await);
        self.state = DriverState::SessionActive;

        if !report.is_empty() {
            return Err(DriverError::SessionStart(report));
        }

        let report = self.verify().await;
        if !report.is_empty() {
            return Err(DriverError::SessionStart(report));
        }
        info!("Diagnostic mode active");
        Ok(())
    }

    async fn establish_routing(&mut self) -> ErrorReport {
        let mut report = ErrorReport::new();
        let Some(mut routing) = self.routing.take() else {
            return report;
        };

        let indices: Vec<usize> = self
            .nodes
            .keys()
            .copied()
            .filter(|i| !self.defect.contains(i))
            .collect();
        for index in indices {
            let hops = self.view.route_to(index).to_vec();
            match routing.establish(&self.system, index, &hops).await {
                Ok(Some(adapter)) => {
                    if let Some(active) = self.nodes.get_mut(&index) {
                        if let Some(legacy) = active.protocol.lock().await.as_legacy_mut() {
                            legacy.set_dispatcher(Some(adapter.clone()));
                        }
                        active.route_adapter = Some(adapter);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    let reason = e.to_string();
                    self.mark_defect(&mut report, index, reason.clone());
                    // Active hops blocked by this failure are defect as well
                    let hops: Vec<usize> = routing
                        .blocked_nodes()
                        .iter()
                        .copied()
                        .filter(|n| self.nodes.contains_key(n) && !self.defect.contains(n))
                        .collect();
                    for hop in hops {
                        self.mark_defect(&mut report, hop, reason.clone());
                    }
                }
            }
        }

        self.routing = Some(routing);
        report
    }

    async fn start_sessions(&mut self) -> ErrorReport {
        let mut report = ErrorReport::new();
        let level = self.config.security.level;
        let targets: Vec<(usize, Arc<Mutex<DiagProtocol>>)> = self
            .diag_nodes()
            .map(|(i, n)| (i, n.protocol.clone()))
            .collect();

        for (index, protocol) in targets {
            let mut protocol = protocol.lock().await;
            let result = match protocol.set_session(session::EXTENDED).await {
                Ok(()) => protocol.security_access(level).await,
                Err(e) => Err(e),
            };
            drop(protocol);
            if let Err(e) = result {
                self.mark_defect(&mut report, index, e.to_string());
            }
        }
        report
    }

    async fn verify(&mut self) -> ErrorReport {
        let mut report = ErrorReport::new();
        let targets: Vec<(usize, Arc<Mutex<DiagProtocol>>, SharedNode)> = self
            .diag_nodes()
            .filter(|(_, n)| n.kind == ProtocolKind::Native)
            .map(|(i, n)| (i, n.protocol.clone(), n.node.clone()))
            .collect();

        for (index, protocol, node) in targets {
            let used = self.view.used_data_pools(index);
            if used.is_empty() {
                continue;
            }
            let snapshot = node.read().clone();

            let mut protocol = protocol.lock().await;
            match verify_node(&protocol, &snapshot, &used).await {
                Ok(result) if result.is_ok() => {
                    if let Some(native) = protocol.as_native_mut() {
                        native.register_data_pool_mapping(result.mapping);
                    }
                }
                Ok(result) => {
                    drop(protocol);
                    let reason = result
                        .failures
                        .iter()
                        .map(|f| f.to_string())
                        .collect::<Vec<_>>()
                        .join("; ");
                    self.mark_defect(&mut report, index, reason);
                }
                Err(e) => {
                    drop(protocol);
                    self.mark_defect(&mut report, index, e.to_string());
                }
            }
        }
        report
    }

    /// Configure rail rates and register the view's read assignments
    pub async fn set_up_cyclic_transmissions(&mut self) -> DriverResult<CyclicSetupReport> {
        self.require_state(
            "cyclic setup",
            &[DriverState::SessionActive, DriverState::Cycling],
        )?;

        let rates = self.view.rates.by_rail();
        for (_, active) in self.diag_nodes() {
            let mut protocol = active.protocol.lock().await;
            for (rail, rate) in rates.iter().enumerate() {
                protocol.set_event_rate(rail as u8, *rate).await?;
            }
        }

        let mut setup = CyclicSetupReport::default();
        for (position, assignment) in self.view.read_rails.iter().enumerate() {
            let id = assignment.element;
            let Some(active) = self
                .nodes
                .get(&id.node)
                .filter(|n| n.diagnostics && !self.defect.contains(&id.node))
            else {
                setup.failed.push((id, "node not in session".to_string()));
                continue;
            };

            let protocol = active.protocol.lock().await;
            let result = match assignment.mode {
                TransmissionMode::Cyclic => {
                    protocol
                        .register_cyclic_transmission(id.data_pool, id.list, id.element, assignment.rail)
                        .await
                }
                TransmissionMode::OnChange => {
                    protocol
                        .register_change_driven_transmission(
                            id.data_pool,
                            id.list,
                            id.element,
                            assignment.rail,
                            assignment.threshold,
                        )
                        .await
                }
            };
            drop(protocol);

            match result {
                Ok(()) => *setup.registered.entry(id.node).or_default() += 1,
                Err(e) => {
                    if e.nrc() == Some(NRC_TOO_MANY_TRANSMISSIONS)
                        && setup.first_slot_exhausted.is_none()
                    {
                        setup.first_slot_exhausted = Some(position);
                    }
                    warn!(element = %id, error = %e, "Transmission registration failed");
                    setup.failed.push((id, DriverError::from(e).to_string()));
                }
            }
        }
        info!(
            registered = setup.registered.values().sum::<usize>(),
            failed = setup.failed.len(),
            "Cyclic transmissions set up"
        );
        Ok(setup)
    }

    /// Stop event-driven transmissions on every node, best effort
    pub async fn stop_cyclic_transmissions(&self) -> ErrorReport {
        let mut report = ErrorReport::new();
        for (index, active) in self.diag_nodes() {
            let protocol = active.protocol.lock().await;
            if let Err(e) = protocol.stop_all_event_driven().await {
                warn!(node = index, error = %e, "Stopping transmissions failed");
                report.push(index, self.system.node_name(index), e.to_string());
            }
        }
        report
    }

    /// Start the background cyclic engine
    pub fn start_cycling(&mut self) -> DriverResult<()> {
        self.require_state("start cycling", &[DriverState::SessionActive])?;

        let nodes = self
            .nodes
            .iter()
            .filter(|(i, _)| !self.defect.contains(i))
            .map(|(i, n)| CycledNode {
                node_index: *i,
                node: n.node.clone(),
                protocol: n.protocol.clone(),
            })
            .collect();
        self.cyclic = Some(CyclicEngine::start(EngineContext {
            nodes,
            frames: self.dispatcher.subscribe_frames(),
            registry: self.registry.clone(),
            events: self.events.clone(),
            tester_present_interval: self.config.tester_present_interval(),
            cycle_yield: self.config.cycle_yield(),
        }));
        self.state = DriverState::Cycling;
        Ok(())
    }

    pub async fn stop_cycling(&mut self) {
        if let Some(mut engine) = self.cyclic.take() {
            engine.stop(self.config.stop_timeout()).await;
        }
        if self.state == DriverState::Cycling {
            self.state = DriverState::SessionActive;
        }
    }

    /// Tear the session down; every step is best effort
    pub async fn stop_diagnosis_server(&mut self) -> ErrorReport {
        self.stop_cycling().await;

        let mut report = ErrorReport::new();
        for (&index, active) in &self.nodes {
            let mut protocol = active.protocol.lock().await;
            let Some(legacy) = protocol.as_legacy_mut() else {
                continue;
            };
            if legacy.has_dispatcher() && !self.defect.contains(&index) {
                if let Err(e) = legacy.logoff().await {
                    warn!(node = index, error = %e, "Logoff failed");
                    report.push(index, self.system.node_name(index), e.to_string());
                }
            }
        }

        report.extend(self.stop_cyclic_transmissions().await);

        for active in self.nodes.values() {
            if let Some(legacy) = active.protocol.lock().await.as_legacy_mut() {
                legacy.set_dispatcher(None);
            }
        }

        if let Some(mut routing) = self.routing.take() {
            routing.teardown().await;
        }
        self.registry.write().clear();
        self.nodes.clear();
        self.state = DriverState::Stopped;
        info!("Diagnosis stopped");
        report
    }

    /// Send tester present to every communicating node
    pub async fn send_tester_present_to_active_nodes(&self) -> ErrorReport {
        let mut report = ErrorReport::new();
        for (&index, active) in self.nodes.iter().filter(|(i, _)| !self.defect.contains(i)) {
            let protocol = active.protocol.lock().await;
            if let Err(e) = protocol.tester_present().await {
                report.push(index, self.system.node_name(index), e.to_string());
            }
        }
        report
    }

    /// Deliver decoded values of CAN signal `signal` in `message` to `sink`
    pub fn register_signal_subscriber(
        &self,
        element: ElementId,
        message: &str,
        signal: &str,
        sink: mpsc::UnboundedSender<SignalEvent>,
    ) -> DriverResult<Uuid> {
        let message = self
            .system
            .message(message)
            .ok_or_else(|| DriverError::Config(format!("CAN message \"{}\" not defined", message)))?;
        let template = self
            .system
            .node(element.node)
            .and_then(|n| {
                n.read()
                    .element(element.data_pool, element.list, element.element)
                    .map(|e| e.value)
            })
            .ok_or_else(|| DriverError::Range(format!("element {}", element)))?;
        self.registry
            .write()
            .register(element, message, signal, template, sink)
    }

    pub fn unregister_signal_subscriber(&self, handler_id: Uuid) -> bool {
        self.registry.write().unregister(handler_id)
    }

    // =========================================================================
    // Polled requests
    // =========================================================================

    fn poll_dealer(&self, node_index: usize) -> DriverResult<Arc<DataDealer>> {
        if self.polling.is_busy() {
            return Err(DriverError::Busy);
        }
        self.data_dealer(node_index)
    }

    pub fn poll_nvm_read_list(&self, node: usize, data_pool: usize, list: usize) -> DriverResult<()> {
        let dealer = self.poll_dealer(node)?;
        self.polling.start("nvm read list", async move {
            dealer.nvm_read_list(data_pool, list).await?;
            Ok(PollOutput::None)
        })
    }

    pub fn poll_nvm_write_list(&self, node: usize, data_pool: usize, list: usize) -> DriverResult<()> {
        let dealer = self.poll_dealer(node)?;
        self.polling.start("nvm write list", async move {
            dealer.nvm_write_list(data_pool, list).await?;
            Ok(PollOutput::None)
        })
    }

    pub fn poll_nvm_read(&self, element: ElementId) -> DriverResult<()> {
        let dealer = self.poll_dealer(element.node)?;
        self.polling.start("nvm read", async move {
            let value = dealer
                .nvm_read(element.data_pool, element.list, element.element)
                .await?;
            Ok(PollOutput::Value(value))
        })
    }

    pub fn poll_nvm_write(&self, element: ElementId) -> DriverResult<()> {
        let dealer = self.poll_dealer(element.node)?;
        self.polling.start("nvm write", async move {
            dealer
                .nvm_write(element.data_pool, element.list, element.element)
                .await?;
            Ok(PollOutput::None)
        })
    }

    pub fn poll_data_pool_read(&self, element: ElementId) -> DriverResult<()> {
        let dealer = self.poll_dealer(element.node)?;
        self.polling.start("data pool read", async move {
            let value = dealer
                .data_pool_read(element.data_pool, element.list, element.element)
                .await?;
            Ok(PollOutput::Value(value))
        })
    }

    pub fn poll_data_pool_write(&self, element: ElementId) -> DriverResult<()> {
        let dealer = self.poll_dealer(element.node)?;
        self.polling.start("data pool write", async move {
            dealer
                .data_pool_write(element.data_pool, element.list, element.element)
                .await?;
            Ok(PollOutput::None)
        })
    }

    pub fn poll_nvm_notify_of_changes(
        &self,
        node: usize,
        data_pool: usize,
        list: usize,
    ) -> DriverResult<()> {
        let dealer = self.poll_dealer(node)?;
        self.polling.start("nvm notify of changes", async move {
            let acknowledged = dealer.nvm_notify_of_changes(data_pool, list).await?;
            Ok(PollOutput::Bool(acknowledged))
        })
    }

    pub fn poll_safe_write_changed_values(
        &self,
        node: usize,
        lists: Vec<(usize, usize)>,
    ) -> DriverResult<()> {
        let dealer = self.poll_dealer(node)?;
        self.polling.start("nvm safe write changed values", async move {
            let changed = dealer.nvm_safe_write_changed_values(&lists).await?;
            Ok(PollOutput::Elements(changed))
        })
    }

    pub fn poll_safe_read_values(&self, node: usize) -> DriverResult<()> {
        let dealer = self.poll_dealer(node)?;
        self.polling.start("nvm safe read values", async move {
            let snapshot = dealer.nvm_safe_read_values().await?;
            Ok(PollOutput::Snapshot(snapshot))
        })
    }

    pub fn poll_safe_write_crcs(&self, node: usize) -> DriverResult<()> {
        let dealer = self.poll_dealer(node)?;
        self.polling.start("nvm safe write crcs", async move {
            dealer.nvm_safe_write_crcs().await?;
            Ok(PollOutput::None)
        })
    }

    pub fn poll_safe_read_parameter_values(
        &self,
        node: usize,
        lists: Vec<(usize, usize)>,
    ) -> DriverResult<()> {
        let dealer = self.poll_dealer(node)?;
        self.polling.start("nvm safe read parameter values", async move {
            let snapshot = dealer.nvm_safe_read_parameter_values(&lists).await?;
            Ok(PollOutput::Snapshot(snapshot))
        })
    }

    /// Reset the safe-write sequence of `node`; not a wire operation
    ///
    /// Refused while a polled request runs, it may be using that sequence.
    pub fn nvm_safe_clear_internal_content(&self, node: usize) -> DriverResult<()> {
        self.poll_dealer(node)?.nvm_safe_clear_internal_content();
        Ok(())
    }
}

impl Drop for CommunicationDriver {
    fn drop(&mut self) {
        if self.cyclic.take().is_some() {
            debug!("Driver dropped while cycling");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::transport::mock::MockBus;
    use pretty_assertions::assert_eq;
    use syde_core::{
        Content, DataPool, DataPoolType, Element, Interface, InterfaceKind, List, Node,
        ReadRailAssignment, ServerAddress, SystemConfig,
    };

    fn node(name: &str, server: DiagnosticServer, node_id: u8) -> Node {
        let mut node = Node::new(name, server);
        node.interfaces.push(Interface {
            bus_index: 0,
            node_id,
            number: 0,
            kind: InterfaceKind::Can,
        });
        node.data_pools.push(DataPool {
            name: "Values".into(),
            version: [1, 0, 0],
            kind: DataPoolType::Nvm,
            lists: vec![List {
                name: "main".into(),
                nvm_start: 0,
                nvm_size: 8,
                crc_active: false,
                crc: 0,
                elements: vec![
                    Element::new("a", 0, Content::U16(0)),
                    Element::new("b", 2, Content::U16(0)),
                ],
            }],
        });
        node
    }

    fn addr(node_id: u8) -> ServerAddress {
        ServerAddress {
            bus_index: 0,
            node_id,
        }
    }

    fn system(nodes: Vec<Node>) -> Arc<SystemDefinition> {
        Arc::new(SystemDefinition::new(SystemConfig {
            nodes,
            ..Default::default()
        }))
    }

    fn driver(
        nodes: Vec<Node>,
        view: ViewConfig,
    ) -> (Arc<MockBus>, CommunicationDriver) {
        let bus = Arc::new(MockBus::new(&MockConfig::default()));
        let driver = CommunicationDriver::with_dispatcher(
            DriverConfig::default(),
            system(nodes),
            view,
            bus.clone(),
        );
        (bus, driver)
    }

    fn view(active: Vec<usize>) -> ViewConfig {
        ViewConfig {
            active_nodes: active,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_empty_node_set_cycles() {
        let (_, mut driver) = driver(vec![], view(vec![]));
        driver.init_diag().await.unwrap();
        driver.set_diagnostic_mode().await.unwrap();
        driver.start_cycling().unwrap();
        assert_eq!(driver.state(), DriverState::Cycling);
        let report = driver.stop_diagnosis_server().await;
        assert!(report.is_empty());
        assert_eq!(driver.state(), DriverState::Stopped);
    }

    #[tokio::test]
    async fn test_third_party_node_skipped() {
        let (_, mut driver) = driver(
            vec![node("Sensor", DiagnosticServer::None, 1)],
            view(vec![0]),
        );
        driver.init_diag().await.unwrap();
        assert!(driver.active_node(0).is_none());
    }

    #[tokio::test]
    async fn test_third_party_node_with_used_elements_is_config_error() {
        let mut v = view(vec![0]);
        v.write_elements.push(ElementId::new(0, 0, 0, 0));
        let (_, mut driver) = driver(vec![node("Sensor", DiagnosticServer::None, 1)], v);
        assert!(matches!(
            driver.init_diag().await,
            Err(DriverError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_active_node_is_config_error() {
        let (_, mut driver) = driver(vec![], view(vec![3]));
        assert!(matches!(
            driver.init_diag().await,
            Err(DriverError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_session_failures_are_collected() {
        let (bus, mut driver) = driver(
            vec![
                node("ESX3", DiagnosticServer::Native, 1),
                node("Display", DiagnosticServer::Native, 2),
                node("Kefex", DiagnosticServer::Legacy, 3),
            ],
            view(vec![0, 1, 2]),
        );
        bus.server(addr(1)).add_timeout(vec![0x10, 0x03]);
        driver.init_diag().await.unwrap();

        let err = driver.set_diagnostic_mode().await.unwrap_err();
        let DriverError::SessionStart(report) = err else {
            panic!("unexpected error {:?}", err);
        };
        assert_eq!(report.len(), 1);
        assert!(report.contains_node(0));
        assert!(report.to_string().starts_with("- ESX3: "));
        assert_eq!(driver.defect_nodes().iter().copied().collect::<Vec<_>>(), vec![0]);

        // Later nodes were still visited
        assert_eq!(bus.server(addr(2)).count_requests(&[0x10, 0x03]), 1);
        assert_eq!(bus.server(addr(3)).count_requests(&[0x01]), 1);
    }

    #[tokio::test]
    async fn test_verification_failure_reported() {
        let mut v = view(vec![0]);
        v.write_elements.push(ElementId::new(0, 0, 0, 0));
        let (_, mut driver) = driver(vec![node("ESX3", DiagnosticServer::Native, 1)], v);
        driver.init_diag().await.unwrap();

        // Mock server reports no data pools
        let err = driver.set_diagnostic_mode().await.unwrap_err();
        let DriverError::SessionStart(report) = err else {
            panic!("unexpected error {:?}", err);
        };
        assert_eq!(
            report.to_string(),
            "- ESX3: Data pool \"Values\" missing on server\n"
        );
    }

    #[tokio::test]
    async fn test_cyclic_setup_reports_slot_exhaustion() {
        let mut v = view(vec![0]);
        for element in 0..2 {
            v.read_rails.push(ReadRailAssignment {
                element: ElementId::new(0, 0, 0, element),
                mode: TransmissionMode::Cyclic,
                rail: 0,
                threshold: 0,
            });
        }
        v.read_rails.push(ReadRailAssignment {
            element: ElementId::new(5, 0, 0, 0),
            mode: TransmissionMode::OnChange,
            rail: 1,
            threshold: 10,
        });
        let (bus, mut driver) = driver(vec![node("ESX3", DiagnosticServer::Native, 1)], v);
        let server = bus.server(addr(1));
        server.add_response(
            vec![0x31, 0x01, 0x02, 0x19, 0x00],
            vec![0x71, 0x01, 0x02, 0x19, 1, 0, 0, b'V', b'a', b'l', b'u', b'e', b's'],
        );
        server.add_response(vec![0x31, 0x01, 0x02, 0x18], vec![0x71, 0x01, 0x02, 0x18, 0x01]);
        server.add_response(vec![0xBC, 0x01, 0x00, 0x00, 0x01], vec![0x7F, 0xBC, 0x70]);

        driver.init_diag().await.unwrap();
        driver.set_diagnostic_mode().await.unwrap();
        let setup = driver.set_up_cyclic_transmissions().await.unwrap();

        assert_eq!(setup.registered, BTreeMap::from([(0, 1)]));
        assert_eq!(setup.first_slot_exhausted, Some(1));
        assert_eq!(setup.failed.len(), 2);
        assert_eq!(server.count_requests(&[0x2E, 0xA8]), 3);
    }

    #[tokio::test]
    async fn test_poll_requires_known_node_and_is_serialized() {
        let (bus, mut driver) = driver(
            vec![node("ESX3", DiagnosticServer::Native, 1)],
            view(vec![0]),
        );
        driver.init_diag().await.unwrap();
        driver.set_diagnostic_mode().await.unwrap();

        assert!(matches!(
            driver.poll_nvm_read_list(7, 0, 0),
            Err(DriverError::Range(_))
        ));

        bus.server(addr(1))
            .add_response(vec![0x23, 0x24], vec![0x63, 0x34, 0x12, 0x78, 0x56]);
        driver.poll_nvm_read_list(0, 0, 0).unwrap();
        assert!(matches!(
            driver.poll_nvm_write_list(0, 0, 0),
            Err(DriverError::Busy)
        ));

        let outcome = driver.polling().wait().await.unwrap();
        assert_eq!(outcome.operation, "nvm read list");
        assert!(outcome.result.is_ok());
        let node = driver.active_node(0).unwrap().node.read();
        assert_eq!(node.element(0, 0, 1).unwrap().value, Content::U16(0x5678));
    }

    #[tokio::test]
    async fn test_safe_clear_refused_while_polling() {
        let (bus, mut driver) = driver(
            vec![node("ESX3", DiagnosticServer::Native, 1)],
            view(vec![0]),
        );
        driver.init_diag().await.unwrap();
        driver.set_diagnostic_mode().await.unwrap();
        bus.server(addr(1))
            .add_response(vec![0x23, 0x24], vec![0x63, 0x34, 0x12, 0x78, 0x56]);

        driver.nvm_safe_clear_internal_content(0).unwrap();
        driver.poll_safe_write_changed_values(0, vec![(0, 0)]).unwrap();
        assert!(matches!(
            driver.nvm_safe_clear_internal_content(0),
            Err(DriverError::Busy)
        ));

        driver.polling().wait().await.unwrap();
        driver.nvm_safe_clear_internal_content(0).unwrap();
    }

    #[tokio::test]
    async fn test_stop_logs_off_legacy_nodes() {
        let (bus, mut driver) = driver(
            vec![node("Kefex", DiagnosticServer::Legacy, 3)],
            view(vec![0]),
        );
        driver.init_diag().await.unwrap();
        driver.set_diagnostic_mode().await.unwrap();
        driver.start_cycling().unwrap();

        let report = driver.stop_diagnosis_server().await;
        assert!(report.is_empty());
        let server = bus.server(addr(3));
        assert_eq!(server.count_requests(&[0x02]), 1);
        assert_eq!(server.count_requests(&[0x09]), 1);

        // logoff while transmissions are still registered, then stop them
        let requests = server.requests();
        let logoff = requests.iter().position(|r| r.starts_with(&[0x02]));
        let stop_all = requests.iter().position(|r| r.starts_with(&[0x09]));
        assert!(logoff.unwrap() < stop_all.unwrap());
    }
}
