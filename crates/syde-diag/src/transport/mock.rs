//! Mock transport adapter and bus for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use syde_core::ServerAddress;
use tokio::sync::broadcast;

use super::{BusDispatcher, CanFrame, IncomingMessage, TransportAdapter, TransportError};
use crate::config::MockConfig;

type BusLog = Arc<RwLock<Vec<(ServerAddress, Vec<u8>)>>>;

/// Mock channel to one diagnostic server
pub struct MockTransportAdapter {
    config: MockConfig,
    address: ServerAddress,
    connected: AtomicBool,
    incoming_tx: broadcast::Sender<IncomingMessage>,
    /// Predefined responses for testing (request -> response mapping)
    responses: RwLock<Vec<(Vec<u8>, Vec<u8>)>>,
    /// Request prefixes that never get an answer
    silent: RwLock<Vec<Vec<u8>>>,
    /// Every request seen, in order
    log: RwLock<Vec<Vec<u8>>>,
    /// Shared with the other servers of a [`MockBus`]
    bus_log: Option<BusLog>,
}

impl MockTransportAdapter {
    pub fn new(config: &MockConfig, address: ServerAddress) -> Self {
        let (incoming_tx, _) = broadcast::channel(256);
        Self {
            config: config.clone(),
            address,
            connected: AtomicBool::new(true),
            incoming_tx,
            responses: RwLock::new(Self::default_responses()),
            silent: RwLock::new(Vec::new()),
            log: RwLock::new(Vec::new()),
            bus_log: None,
        }
    }

    fn on_bus(config: &MockConfig, address: ServerAddress, bus_log: BusLog) -> Self {
        Self {
            bus_log: Some(bus_log),
            ..Self::new(config, address)
        }
    }

    /// Add a mock response for a given request
    ///
    /// Replaces an earlier response registered for the same request.
    pub fn add_response(&self, request: Vec<u8>, response: Vec<u8>) {
        let mut responses = self.responses.write();
        responses.retain(|(req, _)| req != &request);
        responses.insert(0, (request, response));
    }

    /// Never answer requests starting with `prefix`
    pub fn add_timeout(&self, prefix: Vec<u8>) {
        self.silent.write().push(prefix);
    }

    /// Inject an incoming message (simulates a server pushing event-driven data)
    pub fn inject_incoming(&self, data: Vec<u8>) {
        let msg = IncomingMessage {
            timestamp: Instant::now(),
            data,
            source: self.address,
        };
        let _ = self.incoming_tx.send(msg);
    }

    /// Set connection state
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.log.read().clone()
    }

    /// Number of received requests starting with `prefix`
    pub fn count_requests(&self, prefix: &[u8]) -> usize {
        self.log
            .read()
            .iter()
            .filter(|r| r.starts_with(prefix))
            .count()
    }

    fn record(&self, request: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed(self.address));
        }
        if request.is_empty() {
            return Err(TransportError::Rejected {
                address: self.address,
                reason: "empty request".to_string(),
            });
        }
        self.log.write().push(request.to_vec());
        if let Some(bus_log) = &self.bus_log {
            bus_log.write().push((self.address, request.to_vec()));
        }
        Ok(())
    }

    fn default_responses() -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            // Diagnostic Session Control - Default / Extended
            (vec![0x10, 0x01], vec![0x50, 0x01]),
            (vec![0x10, 0x03], vec![0x50, 0x03]),
            // Security Access level 1 - zero seed means already unlocked
            (vec![0x27, 0x01], vec![0x67, 0x01, 0x00, 0x00, 0x00, 0x00]),
            // Tester Present
            (vec![0x3E, 0x00], vec![0x7E, 0x00]),
            // Routing start / stop
            (vec![0x31, 0x01, 0x02, 0x16], vec![0x71, 0x01, 0x02, 0x16]),
            (vec![0x31, 0x02, 0x02, 0x16], vec![0x71, 0x02, 0x02, 0x16]),
            // Metadata scan: no data pools
            (vec![0x31, 0x01, 0x02, 0x19], vec![0x7F, 0x31, 0x31]),
            // Stop all event-driven transmissions
            (vec![0xBC, 0x00], vec![0xFC, 0x00]),
        ]
    }

    fn find_response(&self, request: &[u8]) -> Option<Vec<u8>> {
        let responses = self.responses.read();

        // First try exact match
        for (req, resp) in responses.iter() {
            if req == request {
                return Some(resp.clone());
            }
        }

        // Then try prefix match for variable-length requests
        for (req, resp) in responses.iter() {
            if request.starts_with(req) {
                return Some(resp.clone());
            }
        }

        // Generate default response based on service ID
        request
            .first()
            .map(|service_id| vec![service_id.wrapping_add(0x40)])
    }

    async fn simulate_latency(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
    }
}

#[async_trait]
impl TransportAdapter for MockTransportAdapter {
    async fn send_receive(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.record(request)?;
        self.simulate_latency().await;

        if self.silent.read().iter().any(|p| request.starts_with(p)) {
            return Err(TransportError::NoResponse {
                address: self.address,
                timeout,
            });
        }

        self.find_response(request).ok_or_else(|| TransportError::Rejected {
            address: self.address,
            reason: "no response configured".to_string(),
        })
    }

    async fn send(&self, request: &[u8]) -> Result<(), TransportError> {
        self.record(request)?;
        self.simulate_latency().await;

        tracing::debug!(request = %hex::encode(request), "Mock transport: sent message");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<IncomingMessage> {
        self.incoming_tx.subscribe()
    }

    fn server_address(&self) -> ServerAddress {
        self.address
    }
}

/// Mock bus hosting one [`MockTransportAdapter`] per server address
pub struct MockBus {
    config: MockConfig,
    servers: RwLock<HashMap<ServerAddress, Arc<MockTransportAdapter>>>,
    log: BusLog,
    unreachable: RwLock<Vec<ServerAddress>>,
    frames_tx: broadcast::Sender<CanFrame>,
}

impl MockBus {
    pub fn new(config: &MockConfig) -> Self {
        let (frames_tx, _) = broadcast::channel(1024);
        Self {
            config: config.clone(),
            servers: RwLock::new(HashMap::new()),
            log: Arc::new(RwLock::new(Vec::new())),
            unreachable: RwLock::new(Vec::new()),
            frames_tx,
        }
    }

    /// The mock server at `address`, created on first use
    pub fn server(&self, address: ServerAddress) -> Arc<MockTransportAdapter> {
        self.servers
            .write()
            .entry(address)
            .or_insert_with(|| {
                Arc::new(MockTransportAdapter::on_bus(
                    &self.config,
                    address,
                    self.log.clone(),
                ))
            })
            .clone()
    }

    /// Requests of all servers, in the order they were sent
    pub fn requests(&self) -> Vec<(ServerAddress, Vec<u8>)> {
        self.log.read().clone()
    }

    /// Make `open` fail for `address`
    pub fn set_unreachable(&self, address: ServerAddress) {
        self.unreachable.write().push(address);
    }

    /// Inject a frame as if it was received on the bus
    pub fn inject_frame(&self, frame: CanFrame) {
        let _ = self.frames_tx.send(frame);
    }
}

#[async_trait]
impl BusDispatcher for MockBus {
    async fn open(
        &self,
        address: ServerAddress,
    ) -> Result<Arc<dyn TransportAdapter>, TransportError> {
        if self.unreachable.read().contains(&address) {
            return Err(TransportError::Unreachable {
                address,
                reason: "no answer on the bus".to_string(),
            });
        }
        Ok(self.server(address))
    }

    fn subscribe_frames(&self) -> broadcast::Receiver<CanFrame> {
        self.frames_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> ServerAddress {
        ServerAddress {
            bus_index: 0,
            node_id: 1,
        }
    }

    #[tokio::test]
    async fn test_exact_then_prefix_then_default() {
        let mock = MockTransportAdapter::new(&MockConfig::default(), address());
        mock.add_response(vec![0x23, 0x24], vec![0x63, 0xAA]);
        mock.add_response(vec![0x23, 0x24, 0x00], vec![0x63, 0xBB]);

        let timeout = Duration::from_millis(10);
        let exact = mock.send_receive(&[0x23, 0x24, 0x00], timeout).await.unwrap();
        assert_eq!(exact, vec![0x63, 0xBB]);
        let prefix = mock.send_receive(&[0x23, 0x24, 0x01], timeout).await.unwrap();
        assert_eq!(prefix, vec![0x63, 0xAA]);
        let default = mock.send_receive(&[0x22], timeout).await.unwrap();
        assert_eq!(default, vec![0x62]);
        assert_eq!(mock.count_requests(&[0x23]), 2);
    }

    #[tokio::test]
    async fn test_timeout_prefix() {
        let mock = MockTransportAdapter::new(&MockConfig::default(), address());
        mock.add_timeout(vec![0x10]);
        let result = mock
            .send_receive(&[0x10, 0x03], Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(TransportError::NoResponse { .. })));
    }

    #[tokio::test]
    async fn test_bus_reuses_server() {
        let bus = MockBus::new(&MockConfig::default());
        let server = bus.server(address());
        let channel = bus.open(address()).await.unwrap();
        channel.send(&[0x3E, 0x80]).await.unwrap();
        assert_eq!(server.requests(), vec![vec![0x3E, 0x80]]);

        bus.set_unreachable(address());
        assert!(bus.open(address()).await.is_err());
    }

    #[tokio::test]
    async fn test_bus_log_keeps_cross_server_order() {
        let bus = MockBus::new(&MockConfig::default());
        let other = ServerAddress {
            bus_index: 0,
            node_id: 2,
        };
        let timeout = Duration::from_millis(10);
        bus.server(other).send_receive(&[0x3E, 0x00], timeout).await.unwrap();
        bus.server(address()).send(&[0x3E, 0x80]).await.unwrap();
        bus.server(other).send(&[0x22]).await.unwrap();

        assert_eq!(
            bus.requests(),
            vec![
                (other, vec![0x3E, 0x00]),
                (address(), vec![0x3E, 0x80]),
                (other, vec![0x22]),
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_channel_names_server() {
        let mock = MockTransportAdapter::new(&MockConfig::default(), address());
        mock.set_connected(false);
        let err = mock.send(&[0x3E, 0x80]).await.unwrap_err();
        assert_eq!(err, TransportError::ChannelClosed(address()));
        assert!(mock.requests().is_empty());

        mock.set_connected(true);
        let err = mock.send(&[]).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected { .. }));
        assert_eq!(err.address(), address());
    }
}
