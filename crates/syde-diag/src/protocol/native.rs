//! openSYDE protocol implementation

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use syde_core::{ByteOrder, ElementId};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{
    expect_positive, service_id, DataPoolEvent, DataPoolMetadata, NegativeResponseCode,
    ProtocolError,
};
use crate::config::DriverConfig;
use crate::transport::{IncomingMessage, TransportAdapter};

/// Routine identifiers
pub mod routine {
    pub const START: u8 = 0x01;
    pub const STOP: u8 = 0x02;
    pub const ROUTING: u16 = 0x0216;
    pub const VERIFY_DATA_POOL: u16 = 0x0218;
    pub const READ_DATA_POOL_METADATA: u16 = 0x0219;
}

/// Event-driven sub-functions (base + rail)
pub mod event_driven {
    pub const STOP_ALL: u8 = 0x00;
    pub const CYCLIC: u8 = 0x01;
    pub const CHANGE_DRIVEN: u8 = 0x04;
}

/// First data identifier of the rail rate configuration
pub const DID_RAIL_RATE: u16 = 0xA810;

/// Address and length format of memory services: 4 byte address, 2 byte size
const MEMORY_FORMAT: u8 = 0x24;

const MAX_DATA_POOL: usize = 0x1F;
const MAX_LIST: usize = 0x7F;
const MAX_ELEMENT: usize = 0xFFF;

/// Pack data pool, list and element into the 24 bit data pool identifier
pub fn pack_element_id(
    data_pool: usize,
    list: usize,
    element: usize,
) -> Result<[u8; 3], ProtocolError> {
    if data_pool > MAX_DATA_POOL || list > MAX_LIST || element > MAX_ELEMENT {
        return Err(ProtocolError::Range(format!(
            "data pool element {}.{}.{} not addressable",
            data_pool, list, element
        )));
    }
    let packed = ((data_pool as u32) << 19) | ((list as u32) << 12) | element as u32;
    let bytes = packed.to_be_bytes();
    Ok([bytes[1], bytes[2], bytes[3]])
}

pub fn unpack_element_id(bytes: [u8; 3]) -> (usize, usize, usize) {
    let packed = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
    (
        (packed >> 19) as usize & MAX_DATA_POOL,
        (packed >> 12) as usize & MAX_LIST,
        packed as usize & MAX_ELEMENT,
    )
}

/// openSYDE protocol towards one server
pub struct NativeProtocol {
    node: usize,
    transport: Arc<dyn TransportAdapter>,
    incoming: broadcast::Receiver<IncomingMessage>,
    timeout: Duration,
    pending_timeout: Duration,
    block_size: usize,
    key_mask: u32,
    /// Client data pool index -> server data pool index
    mapping: BTreeMap<usize, usize>,
}

impl NativeProtocol {
    pub fn new(node: usize, transport: Arc<dyn TransportAdapter>, config: &DriverConfig) -> Self {
        let incoming = transport.subscribe();
        Self {
            node,
            transport,
            incoming,
            timeout: config.request_timeout(),
            pending_timeout: config.response_pending_timeout(),
            block_size: config.nvm_block_size.max(1),
            key_mask: config.security.key_mask,
            mapping: BTreeMap::new(),
        }
    }

    pub fn endianness(&self) -> ByteOrder {
        ByteOrder::Little
    }

    pub fn transport(&self) -> Arc<dyn TransportAdapter> {
        self.transport.clone()
    }

    /// Register the data pool index mapping established by verification
    pub fn register_data_pool_mapping(&mut self, mapping: BTreeMap<usize, usize>) {
        self.mapping = mapping;
    }

    pub fn data_pool_mapping(&self) -> &BTreeMap<usize, usize> {
        &self.mapping
    }

    fn server_data_pool(&self, data_pool: usize) -> usize {
        self.mapping.get(&data_pool).copied().unwrap_or(data_pool)
    }

    fn client_data_pool(&self, server: usize) -> usize {
        self.mapping
            .iter()
            .find(|(_, s)| **s == server)
            .map(|(c, _)| *c)
            .unwrap_or(server)
    }

    fn element_id(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
    ) -> Result<[u8; 3], ProtocolError> {
        pack_element_id(self.server_data_pool(data_pool), list, element)
    }

    /// Send a request and handle response pending
    async fn send_request(&self, request: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let start = Instant::now();
        debug!(node = self.node, request = %hex::encode(request), "openSYDE request");

        loop {
            let response = self.transport.send_receive(request, self.timeout).await?;

            if response.first() == Some(&service_id::NEGATIVE_RESPONSE) {
                if response.len() < 3 {
                    return Err(ProtocolError::MalformedResponse(
                        "Negative response too short".to_string(),
                    ));
                }

                let service = response[1];
                let nrc = NegativeResponseCode::from(response[2]);

                if nrc == NegativeResponseCode::ResponsePending {
                    if start.elapsed() > self.pending_timeout {
                        return Err(ProtocolError::Timeout);
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }

                return Err(ProtocolError::Nack { service, nrc });
            }

            let sid = request.first().copied().unwrap_or_default();
            expect_positive(sid, &response)?;
            return Ok(response);
        }
    }

    async fn routine(&self, sub: u8, id: u16, params: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut request = vec![service_id::ROUTINE_CONTROL, sub];
        request.extend_from_slice(&id.to_be_bytes());
        request.extend_from_slice(params);
        let response = self.send_request(&request).await?;
        if response.len() < 4 {
            return Err(ProtocolError::MalformedResponse(format!(
                "routine 0x{:04X} response too short",
                id
            )));
        }
        Ok(response[4..].to_vec())
    }

    pub async fn set_session(&self, session_id: u8) -> Result<(), ProtocolError> {
        let response = self
            .send_request(&[service_id::DIAGNOSTIC_SESSION_CONTROL, session_id])
            .await?;
        if response.get(1) != Some(&session_id) {
            return Err(ProtocolError::MalformedResponse(format!(
                "session 0x{:02X} not confirmed",
                session_id
            )));
        }
        Ok(())
    }

    /// Seed/key exchange for `level`
    pub async fn security_access(&self, level: u8) -> Result<(), ProtocolError> {
        if level == 0 || level > 0x3F {
            return Err(ProtocolError::Range(format!("security level {}", level)));
        }
        let seed_sub = level * 2 - 1;
        let response = self
            .send_request(&[service_id::SECURITY_ACCESS, seed_sub])
            .await?;
        let seed = response.get(2..).unwrap_or_default();

        if seed.iter().all(|&b| b == 0) {
            // Zero seed means already unlocked
            debug!(node = self.node, level, "Security already unlocked (zero seed)");
            return Ok(());
        }
        if seed.len() != 4 {
            return Err(ProtocolError::MalformedResponse(format!(
                "seed of {} bytes",
                seed.len()
            )));
        }

        let seed = u32::from_be_bytes([seed[0], seed[1], seed[2], seed[3]]);
        let key = (seed ^ self.key_mask).to_be_bytes();
        let mut request = vec![service_id::SECURITY_ACCESS, level * 2];
        request.extend_from_slice(&key);
        self.send_request(&request).await?;
        Ok(())
    }

    /// Tester present with suppressed response
    pub async fn tester_present(&self) -> Result<(), ProtocolError> {
        self.transport
            .send(&[service_id::TESTER_PRESENT, 0x80])
            .await?;
        Ok(())
    }

    /// Read up to `length` bytes starting at `address`, split into blocks
    pub async fn read_memory(&self, address: u32, length: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut data = Vec::with_capacity(length);
        let mut offset = 0usize;
        while offset < length {
            let chunk = (length - offset).min(self.block_size);
            let chunk_address = address
                .checked_add(offset as u32)
                .ok_or_else(|| ProtocolError::Range(format!("address 0x{:08X}", address)))?;
            let mut request = vec![service_id::READ_MEMORY_BY_ADDRESS, MEMORY_FORMAT];
            request.extend_from_slice(&chunk_address.to_be_bytes());
            request.extend_from_slice(&(chunk as u16).to_be_bytes());

            let response = self.send_request(&request).await?;
            let payload = &response[1..];
            if payload.len() > chunk {
                return Err(ProtocolError::MalformedResponse(format!(
                    "expected {} bytes at 0x{:08X}, got {}",
                    chunk,
                    chunk_address,
                    payload.len()
                )));
            }
            data.extend_from_slice(payload);
            if payload.len() < chunk {
                // Short answer ends the transfer; the caller checks the size
                debug!(node = self.node, received = data.len(), length, "Short memory read");
                break;
            }
            offset += chunk;
        }
        Ok(data)
    }

    pub async fn write_memory(&self, address: u32, data: &[u8]) -> Result<(), ProtocolError> {
        for (index, chunk) in data.chunks(self.block_size).enumerate() {
            let chunk_address = address
                .checked_add((index * self.block_size) as u32)
                .ok_or_else(|| ProtocolError::Range(format!("address 0x{:08X}", address)))?;
            let mut request = vec![service_id::WRITE_MEMORY_BY_ADDRESS, MEMORY_FORMAT];
            request.extend_from_slice(&chunk_address.to_be_bytes());
            request.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            request.extend_from_slice(chunk);
            self.send_request(&request).await?;
        }
        Ok(())
    }

    pub async fn set_event_rate(&self, rail: u8, rate_ms: u16) -> Result<(), ProtocolError> {
        if rail > 2 {
            return Err(ProtocolError::Range(format!("rail {}", rail)));
        }
        let mut request = vec![service_id::WRITE_DATA_BY_ID];
        request.extend_from_slice(&(DID_RAIL_RATE + u16::from(rail)).to_be_bytes());
        request.extend_from_slice(&rate_ms.to_be_bytes());
        self.send_request(&request).await?;
        Ok(())
    }

    async fn event_driven(
        &self,
        sub: u8,
        id: [u8; 3],
        threshold: Option<u32>,
    ) -> Result<(), ProtocolError> {
        let mut request = vec![service_id::READ_DATA_POOL_EVENT_DRIVEN, sub];
        request.extend_from_slice(&id);
        if let Some(threshold) = threshold {
            request.extend_from_slice(&threshold.to_be_bytes());
        }
        self.send_request(&request).await?;
        Ok(())
    }

    pub async fn register_cyclic(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
        rail: u8,
    ) -> Result<(), ProtocolError> {
        if rail > 2 {
            return Err(ProtocolError::Range(format!("rail {}", rail)));
        }
        let id = self.element_id(data_pool, list, element)?;
        self.event_driven(event_driven::CYCLIC + rail, id, None).await
    }

    pub async fn register_change_driven(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
        rail: u8,
        threshold: u32,
    ) -> Result<(), ProtocolError> {
        if rail > 2 {
            return Err(ProtocolError::Range(format!("rail {}", rail)));
        }
        let id = self.element_id(data_pool, list, element)?;
        self.event_driven(event_driven::CHANGE_DRIVEN + rail, id, Some(threshold))
            .await
    }

    pub async fn stop_all_event_driven(&self) -> Result<(), ProtocolError> {
        self.send_request(&[
            service_id::READ_DATA_POOL_EVENT_DRIVEN,
            event_driven::STOP_ALL,
        ])
        .await?;
        Ok(())
    }

    pub async fn read_metadata(
        &self,
        slot: u8,
    ) -> Result<Option<DataPoolMetadata>, ProtocolError> {
        let payload = match self
            .routine(routine::START, routine::READ_DATA_POOL_METADATA, &[slot])
            .await
        {
            Ok(payload) => payload,
            Err(ProtocolError::Nack {
                nrc: NegativeResponseCode::RequestOutOfRange,
                ..
            }) => return Ok(None),
            Err(e) => return Err(e),
        };

        if payload.len() < 3 {
            return Err(ProtocolError::MalformedResponse(
                "metadata response too short".to_string(),
            ));
        }
        let name = String::from_utf8(payload[3..].to_vec())
            .map_err(|_| ProtocolError::MalformedResponse("metadata name not UTF-8".to_string()))?;
        Ok(Some(DataPoolMetadata {
            name,
            version: [payload[0], payload[1], payload[2]],
        }))
    }

    pub async fn verify_checksum(&self, slot: u8, checksum: u32) -> Result<bool, ProtocolError> {
        let mut params = vec![slot];
        params.extend_from_slice(&checksum.to_be_bytes());
        let payload = self
            .routine(routine::START, routine::VERIFY_DATA_POOL, &params)
            .await?;
        match payload.first() {
            Some(0x01) => Ok(true),
            Some(0x00) => Ok(false),
            _ => Err(ProtocolError::MalformedResponse(
                "verify result missing".to_string(),
            )),
        }
    }

    /// Activate routing towards `out_interface` on this router
    pub async fn start_routing(&self, out_interface: u8) -> Result<(), ProtocolError> {
        self.routine(routine::START, routine::ROUTING, &[out_interface])
            .await?;
        Ok(())
    }

    pub async fn stop_routing(&self) -> Result<(), ProtocolError> {
        self.routine(routine::STOP, routine::ROUTING, &[]).await?;
        Ok(())
    }

    pub async fn data_pool_read(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
    ) -> Result<Vec<u8>, ProtocolError> {
        let id = self.element_id(data_pool, list, element)?;
        let mut request = vec![service_id::READ_DATA_POOL_DATA];
        request.extend_from_slice(&id);
        let response = self.send_request(&request).await?;
        if response.len() < 4 || response[1..4] != id {
            return Err(ProtocolError::MalformedResponse(
                "data pool read response does not echo the element".to_string(),
            ));
        }
        Ok(response[4..].to_vec())
    }

    pub async fn data_pool_write(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        let id = self.element_id(data_pool, list, element)?;
        let mut request = vec![service_id::WRITE_DATA_POOL_DATA];
        request.extend_from_slice(&id);
        request.extend_from_slice(data);
        self.send_request(&request).await?;
        Ok(())
    }

    /// Tell the server a list changed in NVM; returns the application's acknowledge
    pub async fn nvm_notify_of_changes(
        &self,
        data_pool: usize,
        list: usize,
    ) -> Result<bool, ProtocolError> {
        let server_pool = self.server_data_pool(data_pool);
        if server_pool > MAX_DATA_POOL || list > MAX_LIST {
            return Err(ProtocolError::Range(format!("list {}.{}", data_pool, list)));
        }
        let response = self
            .send_request(&[
                service_id::NOTIFY_NVM_DATA_CHANGES,
                server_pool as u8,
                list as u8,
            ])
            .await?;
        match response.get(3) {
            Some(&ack) => Ok(ack != 0),
            None => Err(ProtocolError::MalformedResponse(
                "notification acknowledge missing".to_string(),
            )),
        }
    }

    /// Collect event-driven responses received since the last call
    pub fn cycle(&mut self) -> Vec<DataPoolEvent> {
        let mut events = Vec::new();
        loop {
            match self.incoming.try_recv() {
                Ok(message) => {
                    if let Some(event) = self.parse_event(&message) {
                        events.push(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(node = self.node, skipped, "Event-driven responses dropped");
                }
                Err(_) => break,
            }
        }
        events
    }

    fn parse_event(&self, message: &IncomingMessage) -> Option<DataPoolEvent> {
        let data = &message.data;
        let event_response = service_id::READ_DATA_POOL_EVENT_DRIVEN.wrapping_add(0x40);
        if data.len() < 4 || data[0] != event_response {
            debug!(node = self.node, data = %hex::encode(data), "Ignoring unsolicited message");
            return None;
        }
        let (server_pool, list, element) = unpack_element_id([data[1], data[2], data[3]]);
        Some(DataPoolEvent {
            element: ElementId::new(self.node, self.client_data_pool(server_pool), list, element),
            data: data[4..].to_vec(),
            timestamp: message.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::transport::mock::MockTransportAdapter;
    use pretty_assertions::assert_eq;
    use syde_core::ServerAddress;

    fn setup() -> (Arc<MockTransportAdapter>, NativeProtocol) {
        let mock = Arc::new(MockTransportAdapter::new(
            &MockConfig::default(),
            ServerAddress {
                bus_index: 0,
                node_id: 1,
            },
        ));
        let mut config = DriverConfig::default();
        config.nvm_block_size = 4;
        let protocol = NativeProtocol::new(0, mock.clone(), &config);
        (mock, protocol)
    }

    #[test]
    fn test_pack_element_id() {
        assert_eq!(pack_element_id(1, 2, 3).unwrap(), [0x08, 0x20, 0x03]);
        assert_eq!(unpack_element_id([0x08, 0x20, 0x03]), (1, 2, 3));
    }

    #[rstest::rstest]
    #[case(32, 0, 0)]
    #[case(0, 128, 0)]
    #[case(0, 0, 4096)]
    fn test_pack_element_id_out_of_range(
        #[case] data_pool: usize,
        #[case] list: usize,
        #[case] element: usize,
    ) {
        assert!(matches!(
            pack_element_id(data_pool, list, element),
            Err(ProtocolError::Range(_))
        ));
    }

    #[tokio::test]
    async fn test_range_error_sends_nothing() {
        let (mock, protocol) = setup();
        let result = protocol.data_pool_read(40, 0, 0).await;
        assert!(matches!(result, Err(ProtocolError::Range(_))));
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_read_memory_is_chunked() {
        let (mock, protocol) = setup();
        mock.add_response(
            vec![0x23, 0x24, 0x00, 0x00, 0x01, 0x00, 0x00, 0x04],
            vec![0x63, 1, 2, 3, 4],
        );
        mock.add_response(
            vec![0x23, 0x24, 0x00, 0x00, 0x01, 0x04, 0x00, 0x02],
            vec![0x63, 5, 6],
        );
        let data = protocol.read_memory(0x100, 6).await.unwrap();
        assert_eq!(data, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(mock.count_requests(&[0x23]), 2);
    }

    #[tokio::test]
    async fn test_negative_response_maps_to_nack() {
        let (mock, protocol) = setup();
        mock.add_response(vec![0xBC, 0x01], vec![0x7F, 0xBC, 0x70]);
        let err = protocol.register_cyclic(0, 0, 1, 0).await.unwrap_err();
        assert_eq!(err.nrc(), Some(0x70));
    }

    #[tokio::test]
    async fn test_metadata_out_of_range_is_none() {
        let (mock, protocol) = setup();
        let mut response = vec![0x71, 0x01, 0x02, 0x19, 1, 0, 0];
        response.extend_from_slice(b"Crash");
        mock.add_response(vec![0x31, 0x01, 0x02, 0x19, 0x00], response);

        let first = protocol.read_metadata(0).await.unwrap();
        assert_eq!(
            first,
            Some(DataPoolMetadata {
                name: "Crash".into(),
                version: [1, 0, 0]
            })
        );
        assert_eq!(protocol.read_metadata(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mapping_applies_to_requests_and_events() {
        let (mock, mut protocol) = setup();
        protocol.register_data_pool_mapping(BTreeMap::from([(0, 2)]));
        mock.add_response(vec![0xBB], vec![0xFB]);
        protocol.data_pool_write(0, 0, 1, &[0xAA]).await.unwrap();
        let id = pack_element_id(2, 0, 1).unwrap();
        assert_eq!(mock.requests()[0], vec![0xBB, id[0], id[1], id[2], 0xAA]);

        mock.inject_incoming(vec![0xFC, id[0], id[1], id[2], 0x2A]);
        let events = protocol.cycle();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].element, ElementId::new(0, 0, 0, 1));
        assert_eq!(events[0].data, vec![0x2A]);
    }

    #[tokio::test]
    async fn test_security_access_with_seed() {
        let (mock, protocol) = setup();
        mock.add_response(vec![0x27, 0x01], vec![0x67, 0x01, 0x12, 0x34, 0x56, 0x78]);
        mock.add_response(vec![0x27, 0x02], vec![0x67, 0x02]);
        protocol.security_access(1).await.unwrap();
        assert_eq!(
            mock.requests()[1],
            vec![0x27, 0x02, 0x12, 0x34, 0x56, 0x78]
        );
    }
}
