//! KEFEX protocol implementation
//!
//! KEFEX servers hold a single data pool whose variables are addressed by
//! a 16 bit index (list in the high byte, element in the low byte). There
//! are no sessions: logon opens communication and logoff ends it.

use std::sync::Arc;
use std::time::Duration;

use syde_core::{ByteOrder, ElementId};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    encode_u16, encode_u32, expect_positive, DataPoolEvent, NegativeResponseCode, ProtocolError,
};
use crate::config::{DriverConfig, LegacyConfig};
use crate::transport::{IncomingMessage, TransportAdapter};

/// KEFEX service identifiers
pub mod service {
    pub const LOGON: u8 = 0x01;
    pub const LOGOFF: u8 = 0x02;
    pub const READ_MEMORY: u8 = 0x03;
    pub const WRITE_MEMORY: u8 = 0x04;
    pub const READ_VARIABLE: u8 = 0x05;
    pub const WRITE_VARIABLE: u8 = 0x06;
    pub const CYCLIC: u8 = 0x07;
    pub const CHANGE_DRIVEN: u8 = 0x08;
    pub const STOP_ALL: u8 = 0x09;
    pub const TESTER_PRESENT: u8 = 0x0A;
    /// Error responses carry the request service with this bit set
    pub const ERROR_FLAG: u8 = 0x80;
}

/// KEFEX protocol towards one server
pub struct LegacyProtocol {
    node: usize,
    transport: Option<Arc<dyn TransportAdapter>>,
    incoming: Option<broadcast::Receiver<IncomingMessage>>,
    config: LegacyConfig,
    timeout: Duration,
    rates: [u16; 3],
    logged_on: bool,
}

impl LegacyProtocol {
    /// Create the protocol; `transport` is `None` for routed nodes until a
    /// dispatcher is attached
    pub fn new(
        node: usize,
        transport: Option<Arc<dyn TransportAdapter>>,
        config: &DriverConfig,
    ) -> Self {
        let incoming = transport.as_ref().map(|t| t.subscribe());
        Self {
            node,
            transport,
            incoming,
            config: config.legacy.clone(),
            timeout: config.request_timeout(),
            rates: [100, 500, 1000],
            logged_on: false,
        }
    }

    pub fn endianness(&self) -> ByteOrder {
        self.config.byte_order
    }

    pub fn is_logged_on(&self) -> bool {
        self.logged_on
    }

    pub fn has_dispatcher(&self) -> bool {
        self.transport.is_some()
    }

    /// Attach or detach the channel used to reach the server
    pub fn set_dispatcher(&mut self, transport: Option<Arc<dyn TransportAdapter>>) {
        self.incoming = transport.as_ref().map(|t| t.subscribe());
        self.transport = transport;
        if self.transport.is_none() {
            self.logged_on = false;
        }
    }

    fn transport(&self) -> Result<&Arc<dyn TransportAdapter>, ProtocolError> {
        self.transport
            .as_ref()
            .ok_or_else(|| ProtocolError::Config("no dispatcher attached".to_string()))
    }

    fn variable_index(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
    ) -> Result<[u8; 2], ProtocolError> {
        if data_pool != 0 || list > 0xFF || element > 0xFF {
            return Err(ProtocolError::Range(format!(
                "variable {}.{}.{} not addressable",
                data_pool, list, element
            )));
        }
        Ok(encode_u16(((list as u16) << 8) | element as u16, self.endianness()))
    }

    async fn send_request(&self, request: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let transport = self.transport()?;
        debug!(node = self.node, request = %hex::encode(request), "KEFEX request");
        let response = transport.send_receive(request, self.timeout).await?;

        let sid = request.first().copied().unwrap_or_default();
        if response.first() == Some(&(sid | service::ERROR_FLAG)) {
            let code = response.get(1).copied().ok_or_else(|| {
                ProtocolError::MalformedResponse("error response without code".to_string())
            })?;
            return Err(ProtocolError::Nack {
                service: sid,
                nrc: NegativeResponseCode::from(code),
            });
        }
        expect_positive(sid, &response)?;
        Ok(response)
    }

    pub async fn logon(&mut self) -> Result<(), ProtocolError> {
        self.send_request(&[service::LOGON, self.config.client_address])
            .await?;
        self.logged_on = true;
        info!(node = self.node, "KEFEX logon");
        Ok(())
    }

    pub async fn logoff(&mut self) -> Result<(), ProtocolError> {
        self.send_request(&[service::LOGOFF, self.config.client_address])
            .await?;
        self.logged_on = false;
        info!(node = self.node, "KEFEX logoff");
        Ok(())
    }

    pub async fn tester_present(&self) -> Result<(), ProtocolError> {
        self.transport()?.send(&[service::TESTER_PRESENT]).await?;
        Ok(())
    }

    fn memory_header(
        &self,
        sid: u8,
        address: u32,
        length: usize,
    ) -> Result<Vec<u8>, ProtocolError> {
        let length = super::to_u16(length, "length")?;
        let order = self.endianness();
        let mut request = vec![sid];
        request.extend_from_slice(&encode_u32(address, order));
        request.extend_from_slice(&encode_u16(length, order));
        Ok(request)
    }

    pub async fn read_memory(&self, address: u32, length: usize) -> Result<Vec<u8>, ProtocolError> {
        let request = self.memory_header(service::READ_MEMORY, address, length)?;
        let response = self.send_request(&request).await?;
        let payload = &response[1..];
        if payload.len() > length {
            return Err(ProtocolError::MalformedResponse(format!(
                "expected {} bytes at 0x{:08X}, got {}",
                length,
                address,
                payload.len()
            )));
        }
        Ok(payload.to_vec())
    }

    pub async fn write_memory(&self, address: u32, data: &[u8]) -> Result<(), ProtocolError> {
        let mut request = self.memory_header(service::WRITE_MEMORY, address, data.len())?;
        request.extend_from_slice(data);
        self.send_request(&request).await?;
        Ok(())
    }

    /// KEFEX has no rail configuration on the server; rates are sent with
    /// each registration
    pub async fn set_event_rate(&mut self, rail: u8, rate_ms: u16) -> Result<(), ProtocolError> {
        let slot = self
            .rates
            .get_mut(usize::from(rail))
            .ok_or_else(|| ProtocolError::Range(format!("rail {}", rail)))?;
        *slot = rate_ms;
        Ok(())
    }

    fn rate(&self, rail: u8) -> Result<u16, ProtocolError> {
        self.rates
            .get(usize::from(rail))
            .copied()
            .ok_or_else(|| ProtocolError::Range(format!("rail {}", rail)))
    }

    pub async fn register_cyclic(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
        rail: u8,
    ) -> Result<(), ProtocolError> {
        let index = self.variable_index(data_pool, list, element)?;
        let rate = encode_u16(self.rate(rail)?, self.endianness());
        let mut request = vec![service::CYCLIC];
        request.extend_from_slice(&index);
        request.extend_from_slice(&rate);
        self.send_request(&request).await?;
        Ok(())
    }

    pub async fn register_change_driven(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
        rail: u8,
        threshold: u32,
    ) -> Result<(), ProtocolError> {
        let index = self.variable_index(data_pool, list, element)?;
        let order = self.endianness();
        let mut request = vec![service::CHANGE_DRIVEN];
        request.extend_from_slice(&index);
        request.extend_from_slice(&encode_u16(self.rate(rail)?, order));
        request.extend_from_slice(&encode_u32(threshold, order));
        self.send_request(&request).await?;
        Ok(())
    }

    pub async fn stop_all_event_driven(&self) -> Result<(), ProtocolError> {
        self.send_request(&[service::STOP_ALL]).await?;
        Ok(())
    }

    pub async fn data_pool_read(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
    ) -> Result<Vec<u8>, ProtocolError> {
        let index = self.variable_index(data_pool, list, element)?;
        let response = self
            .send_request(&[service::READ_VARIABLE, index[0], index[1]])
            .await?;
        Ok(response[1..].to_vec())
    }

    pub async fn data_pool_write(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        let index = self.variable_index(data_pool, list, element)?;
        let mut request = vec![service::WRITE_VARIABLE, index[0], index[1]];
        request.extend_from_slice(data);
        self.send_request(&request).await?;
        Ok(())
    }

    /// Collect cyclic and change-driven responses received since the last call
    pub fn cycle(&mut self) -> Vec<DataPoolEvent> {
        let mut messages = Vec::new();
        if let Some(incoming) = self.incoming.as_mut() {
            loop {
                match incoming.try_recv() {
                    Ok(message) => messages.push(message),
                    Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                        warn!(node = self.node, skipped, "KEFEX responses dropped");
                    }
                    Err(_) => break,
                }
            }
        }
        messages.iter().filter_map(|m| self.parse_event(m)).collect()
    }

    fn parse_event(&self, message: &IncomingMessage) -> Option<DataPoolEvent> {
        let data = &message.data;
        let cyclic = service::CYCLIC + 0x40;
        let change = service::CHANGE_DRIVEN + 0x40;
        if data.len() < 3 || (data[0] != cyclic && data[0] != change) {
            return None;
        }
        let index = match self.endianness() {
            ByteOrder::Little => u16::from_le_bytes([data[1], data[2]]),
            ByteOrder::Big => u16::from_be_bytes([data[1], data[2]]),
        };
        Some(DataPoolEvent {
            element: ElementId::new(self.node, 0, usize::from(index >> 8), usize::from(index & 0xFF)),
            data: data[3..].to_vec(),
            timestamp: message.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::transport::mock::MockTransportAdapter;
    use syde_core::ServerAddress;

    fn mock() -> Arc<MockTransportAdapter> {
        Arc::new(MockTransportAdapter::new(
            &MockConfig::default(),
            ServerAddress {
                bus_index: 0,
                node_id: 5,
            },
        ))
    }

    fn config(order: ByteOrder) -> DriverConfig {
        let mut config = DriverConfig::default();
        config.legacy.byte_order = order;
        config
    }

    #[tokio::test]
    async fn test_requires_dispatcher() {
        let protocol = LegacyProtocol::new(0, None, &DriverConfig::default());
        let result = protocol.read_memory(0, 2).await;
        assert!(matches!(result, Err(ProtocolError::Config(_))));
    }

    #[tokio::test]
    async fn test_logon_logoff() {
        let mock = mock();
        let mut protocol = LegacyProtocol::new(0, Some(mock.clone()), &DriverConfig::default());
        protocol.logon().await.unwrap();
        assert!(protocol.is_logged_on());
        protocol.logoff().await.unwrap();
        assert!(!protocol.is_logged_on());
        assert_eq!(mock.requests(), vec![vec![0x01, 0x00], vec![0x02, 0x00]]);
    }

    #[tokio::test]
    async fn test_memory_header_follows_byte_order() {
        let mock = mock();
        mock.add_response(vec![0x03], vec![0x43, 0xAA, 0xBB]);
        let protocol = LegacyProtocol::new(0, Some(mock.clone()), &config(ByteOrder::Big));
        let data = protocol.read_memory(0x1234, 2).await.unwrap();
        assert_eq!(data, vec![0xAA, 0xBB]);
        assert_eq!(
            mock.requests()[0],
            vec![0x03, 0x00, 0x00, 0x12, 0x34, 0x00, 0x02]
        );
    }

    #[tokio::test]
    async fn test_error_response_is_nack() {
        let mock = mock();
        mock.add_response(vec![0x07], vec![0x87, 0x70]);
        let protocol = LegacyProtocol::new(0, Some(mock), &DriverConfig::default());
        let err = protocol.register_cyclic(0, 1, 2, 0).await.unwrap_err();
        assert_eq!(err.nrc(), Some(0x70));
    }

    #[tokio::test]
    async fn test_variable_index_range() {
        let protocol = LegacyProtocol::new(0, Some(mock()), &DriverConfig::default());
        assert!(matches!(
            protocol.data_pool_read(1, 0, 0).await,
            Err(ProtocolError::Range(_))
        ));
    }

    #[tokio::test]
    async fn test_cycle_collects_events() {
        let mock = mock();
        let mut protocol = LegacyProtocol::new(3, Some(mock.clone()), &DriverConfig::default());
        mock.inject_incoming(vec![0x47, 0x02, 0x01, 0x10, 0x00]);
        let events = protocol.cycle();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].element, ElementId::new(3, 0, 1, 2));
        assert_eq!(events[0].data, vec![0x10, 0x00]);
    }
}
