//! Data pool identity verification
//!
//! Matches the data pools a view uses against the slots a server reports,
//! by name, version and definition hash. Matching pools yield the
//! client → server index mapping the protocol applies to later requests.

use std::collections::{BTreeMap, BTreeSet};

use crc::{Crc, CRC_32_ISO_HDLC};
use syde_core::node::format_version;
use syde_core::{ByteOrder, DataPool, DataPoolType, Node};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{DataPoolMetadata, DiagProtocol, ProtocolError};

/// Number of data pool slots a server can hold
pub const MAX_DATA_POOL_SLOTS: u8 = 32;

const DEFINITION_HASH: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Which definition encoding the hash is computed over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashVariant {
    /// Current encoding; defaults of non-NVM pools are not part of the image
    Generated,
    /// Encoding of older server images, defaults always included
    CompatV1,
}

/// Hash of a data pool definition as compared against the server
pub fn data_pool_hash(pool: &DataPool, variant: HashVariant) -> u32 {
    let include_defaults = pool.kind.is_nvm_based() || variant == HashVariant::CompatV1;

    let mut digest = DEFINITION_HASH.digest();
    digest.update(pool.name.as_bytes());
    digest.update(&pool.version);
    digest.update(&[kind_tag(pool.kind)]);
    for list in &pool.lists {
        digest.update(list.name.as_bytes());
        digest.update(&list.nvm_start.to_le_bytes());
        digest.update(&list.nvm_size.to_le_bytes());
        digest.update(&[u8::from(list.crc_active)]);
        for element in &list.elements {
            digest.update(element.name.as_bytes());
            digest.update(&element.nvm_address.to_le_bytes());
            let default = element.default_value();
            let default = if include_defaults {
                default
            } else {
                default.zeroed()
            };
            digest.update(&default.to_bytes(ByteOrder::Little));
        }
    }
    digest.finalize()
}

fn kind_tag(kind: DataPoolType) -> u8 {
    match kind {
        DataPoolType::Diag => 0,
        DataPoolType::Nvm => 1,
        DataPoolType::Com => 2,
        DataPoolType::HalcNvm => 3,
    }
}

/// Why one data pool failed verification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationFailure {
    #[error("Data pool \"{name}\" missing on server")]
    DataPoolMissing { name: String },

    #[error("Data pool \"{name}\" version mismatch: client {client}, server {server}")]
    VersionMismatch {
        name: String,
        client: String,
        server: String,
    },

    #[error("Data pool \"{name}\" checksum mismatch")]
    ChecksumMismatch { name: String },
}

/// Outcome of verifying one node
#[derive(Debug, Clone, Default)]
pub struct NodeVerification {
    /// Client data pool index → server slot, for every verified pool
    pub mapping: BTreeMap<usize, usize>,
    pub failures: Vec<VerificationFailure>,
}

impl NodeVerification {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Read server metadata slots until the server reports the end
pub async fn read_server_metadata(
    protocol: &DiagProtocol,
) -> Result<Vec<DataPoolMetadata>, ProtocolError> {
    let mut slots = Vec::new();
    for slot in 0..MAX_DATA_POOL_SLOTS {
        match protocol.read_metadata(slot).await? {
            Some(metadata) => slots.push(metadata),
            None => break,
        }
    }
    Ok(slots)
}

/// Verify the data pools `used_pools` of `node` against the server
///
/// Transport errors abort; identity mismatches are collected per pool.
pub async fn verify_node(
    protocol: &DiagProtocol,
    node: &Node,
    used_pools: &BTreeSet<usize>,
) -> Result<NodeVerification, ProtocolError> {
    let server = read_server_metadata(protocol).await?;
    debug!(node = %node.name, slots = server.len(), "Server data pools read");

    let mut result = NodeVerification::default();
    for &client_index in used_pools {
        let Some(pool) = node.data_pools.get(client_index) else {
            return Err(ProtocolError::Range(format!(
                "data pool {} on {}",
                client_index, node.name
            )));
        };

        let Some(slot) = server.iter().position(|m| m.name == pool.name) else {
            result.failures.push(VerificationFailure::DataPoolMissing {
                name: pool.name.clone(),
            });
            continue;
        };

        if server[slot].version != pool.version {
            result.failures.push(VerificationFailure::VersionMismatch {
                name: pool.name.clone(),
                client: pool.version_string(),
                server: format_version(&server[slot].version),
            });
            continue;
        }

        let slot_id = slot as u8;
        let mut matched = protocol
            .verify_checksum(slot_id, data_pool_hash(pool, HashVariant::Generated))
            .await?;
        if !matched && !pool.kind.is_nvm_based() {
            debug!(node = %node.name, data_pool = %pool.name, "Retrying with compatible hash");
            matched = protocol
                .verify_checksum(slot_id, data_pool_hash(pool, HashVariant::CompatV1))
                .await?;
        }
        if !matched {
            result.failures.push(VerificationFailure::ChecksumMismatch {
                name: pool.name.clone(),
            });
            continue;
        }

        info!(
            node = %node.name,
            data_pool = %pool.name,
            client_index,
            server_index = slot,
            "Data pool verified"
        );
        result.mapping.insert(client_index, slot);
    }

    for failure in &result.failures {
        warn!(node = %node.name, %failure, "Data pool verification failed");
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, MockConfig};
    use crate::protocol::NativeProtocol;
    use crate::transport::mock::MockTransportAdapter;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use syde_core::{Content, DiagnosticServer, Element, List, ServerAddress};

    fn pool(name: &str, version: [u8; 3], kind: DataPoolType) -> DataPool {
        let mut element = Element::new("speed", 0x10, Content::U16(0));
        element.default = Some(Content::U16(500));
        DataPool {
            name: name.into(),
            version,
            kind,
            lists: vec![List {
                name: "main".into(),
                nvm_start: 0x10,
                nvm_size: 8,
                crc_active: false,
                crc: 0,
                elements: vec![element],
            }],
        }
    }

    fn metadata_response(slot: u8, name: &str, version: [u8; 3]) -> (Vec<u8>, Vec<u8>) {
        let mut response = vec![0x71, 0x01, 0x02, 0x19];
        response.extend_from_slice(&version);
        response.extend_from_slice(name.as_bytes());
        (vec![0x31, 0x01, 0x02, 0x19, slot], response)
    }

    fn verify_request(slot: u8, hash: u32) -> Vec<u8> {
        let mut request = vec![0x31, 0x01, 0x02, 0x18, slot];
        request.extend_from_slice(&hash.to_be_bytes());
        request
    }

    fn setup(pools: Vec<DataPool>) -> (Arc<MockTransportAdapter>, DiagProtocol, Node) {
        let mock = Arc::new(MockTransportAdapter::new(
            &MockConfig::default(),
            ServerAddress {
                bus_index: 0,
                node_id: 3,
            },
        ));
        let protocol =
            DiagProtocol::Native(NativeProtocol::new(0, mock.clone(), &DriverConfig::default()));
        let mut node = Node::new("ESX3", DiagnosticServer::Native);
        node.data_pools = pools;
        (mock, protocol, node)
    }

    #[test]
    fn test_hash_variants() {
        let diag = pool("Crash", [1, 0, 0], DataPoolType::Diag);
        assert_ne!(
            data_pool_hash(&diag, HashVariant::Generated),
            data_pool_hash(&diag, HashVariant::CompatV1)
        );

        let nvm = pool("Params", [1, 0, 0], DataPoolType::Nvm);
        assert_eq!(
            data_pool_hash(&nvm, HashVariant::Generated),
            data_pool_hash(&nvm, HashVariant::CompatV1)
        );
    }

    #[test]
    fn test_definition_hash_is_crc32() {
        assert_eq!(DEFINITION_HASH.checksum(b"123456789"), 0xCBF4_3926);
    }

    #[tokio::test]
    async fn test_version_mismatch_even_if_checksum_matches() {
        let (mock, protocol, node) = setup(vec![pool("Crash", [1, 0, 1], DataPoolType::Diag)]);
        let (req, resp) = metadata_response(0, "Crash", [1, 0, 0]);
        mock.add_response(req, resp);
        mock.add_response(vec![0x31, 0x01, 0x02, 0x18], vec![0x71, 0x01, 0x02, 0x18, 0x01]);

        let result = verify_node(&protocol, &node, &BTreeSet::from([0])).await.unwrap();
        assert_eq!(
            result.failures,
            vec![VerificationFailure::VersionMismatch {
                name: "Crash".into(),
                client: "v01.00r01".into(),
                server: "v01.00r00".into(),
            }]
        );
        assert!(result.mapping.is_empty());
    }

    #[tokio::test]
    async fn test_missing_pool_collected() {
        let (mock, protocol, node) = setup(vec![
            pool("Crash", [1, 0, 0], DataPoolType::Diag),
            pool("Params", [1, 0, 0], DataPoolType::Nvm),
        ]);
        let (req, resp) = metadata_response(0, "Params", [1, 0, 0]);
        mock.add_response(req, resp);
        mock.add_response(vec![0x31, 0x01, 0x02, 0x18], vec![0x71, 0x01, 0x02, 0x18, 0x01]);

        let result = verify_node(&protocol, &node, &BTreeSet::from([0, 1])).await.unwrap();
        assert_eq!(
            result.failures,
            vec![VerificationFailure::DataPoolMissing {
                name: "Crash".into()
            }]
        );
        assert_eq!(result.mapping, BTreeMap::from([(1, 0)]));
    }

    #[tokio::test]
    async fn test_compat_fallback_once() {
        let crash = pool("Crash", [1, 0, 0], DataPoolType::Diag);
        let compat = data_pool_hash(&crash, HashVariant::CompatV1);
        let (mock, protocol, node) = setup(vec![crash]);

        // Server slot 1 holds the pool
        let (req, resp) = metadata_response(0, "Other", [2, 0, 0]);
        mock.add_response(req, resp);
        let (req, resp) = metadata_response(1, "Crash", [1, 0, 0]);
        mock.add_response(req, resp);
        mock.add_response(vec![0x31, 0x01, 0x02, 0x18], vec![0x71, 0x01, 0x02, 0x18, 0x00]);
        mock.add_response(verify_request(1, compat), vec![0x71, 0x01, 0x02, 0x18, 0x01]);

        let result = verify_node(&protocol, &node, &BTreeSet::from([0])).await.unwrap();
        assert!(result.is_ok());
        assert_eq!(result.mapping, BTreeMap::from([(0, 1)]));
        assert_eq!(mock.count_requests(&[0x31, 0x01, 0x02, 0x18]), 2);
    }

    #[tokio::test]
    async fn test_no_fallback_for_nvm_pools() {
        let (mock, protocol, node) = setup(vec![pool("Params", [1, 0, 0], DataPoolType::Nvm)]);
        let (req, resp) = metadata_response(0, "Params", [1, 0, 0]);
        mock.add_response(req, resp);
        mock.add_response(vec![0x31, 0x01, 0x02, 0x18], vec![0x71, 0x01, 0x02, 0x18, 0x00]);

        let result = verify_node(&protocol, &node, &BTreeSet::from([0])).await.unwrap();
        assert_eq!(
            result.failures,
            vec![VerificationFailure::ChecksumMismatch {
                name: "Params".into()
            }]
        );
        assert_eq!(mock.count_requests(&[0x31, 0x01, 0x02, 0x18]), 1);
    }

    #[tokio::test]
    async fn test_metadata_timeout_propagates() {
        let (mock, protocol, node) = setup(vec![pool("Crash", [1, 0, 0], DataPoolType::Diag)]);
        mock.add_timeout(vec![0x31, 0x01, 0x02, 0x19]);

        let err = verify_node(&protocol, &node, &BTreeSet::from([0])).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout));
    }
}
