//! Transport adapter and bus dispatcher traits

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use syde_core::ServerAddress;
use tokio::sync::broadcast;

use super::TransportError;

/// Unsolicited message pushed by a server (event-driven responses)
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Timestamp when the message was received
    pub timestamp: Instant,
    /// Raw service payload
    pub data: Vec<u8>,
    /// Server that sent the message
    pub source: ServerAddress,
}

/// Raw CAN frame as seen on the active bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    pub dlc: u8,
    pub data: [u8; 8],
    /// Receive time in microseconds, taken by the dispatcher
    pub timestamp_us: u64,
}

impl CanFrame {
    pub fn new(id: u32, extended: bool, payload: &[u8], timestamp_us: u64) -> Self {
        let mut data = [0u8; 8];
        let len = payload.len().min(8);
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            id,
            extended,
            dlc: len as u8,
            data,
            timestamp_us,
        }
    }
}

/// Request/response channel to one diagnostic server
///
/// Routing, segmentation and flow control are the implementor's business;
/// callers only see complete service payloads.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Send a request and wait for a response
    ///
    /// # Arguments
    /// * `request` - The raw service request bytes
    /// * `timeout` - Maximum time to wait for a response
    async fn send_receive(
        &self,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Send a request without waiting for a response
    async fn send(&self, request: &[u8]) -> Result<(), TransportError>;

    /// Subscribe to unsolicited messages from the server
    fn subscribe(&self) -> broadcast::Receiver<IncomingMessage>;

    /// Address of the server this channel talks to
    fn server_address(&self) -> ServerAddress;
}

/// Access to the client's bus hardware
///
/// Opens per-server channels and exposes the raw frames of the active bus.
#[async_trait]
pub trait BusDispatcher: Send + Sync {
    /// Open a channel to the server at `address`
    async fn open(&self, address: ServerAddress)
        -> Result<Arc<dyn TransportAdapter>, TransportError>;

    /// Subscribe to all frames received on the active bus
    fn subscribe_frames(&self) -> broadcast::Receiver<CanFrame>;
}
