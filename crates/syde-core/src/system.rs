//! System definition: buses, nodes and CAN messages

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::can::CanMessage;
use crate::error::{CoreError, CoreResult};
use crate::node::{InterfaceKind, Node};

/// A node shared between the system definition and the driver
pub type SharedNode = Arc<RwLock<Node>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub name: String,
    pub kind: InterfaceKind,
}

/// Serialized form of the system definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub buses: Vec<BusConfig>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub can_messages: Vec<CanMessage>,
}

impl SystemConfig {
    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }
}

/// Live system definition
///
/// Nodes are shared so the driver can update element values and list CRCs
/// in place while callers keep reading them.
#[derive(Debug, Default)]
pub struct SystemDefinition {
    pub buses: Vec<BusConfig>,
    pub nodes: Vec<SharedNode>,
    pub can_messages: Vec<CanMessage>,
}

impl SystemDefinition {
    pub fn new(config: SystemConfig) -> Self {
        Self {
            buses: config.buses,
            nodes: config
                .nodes
                .into_iter()
                .map(|n| Arc::new(RwLock::new(n)))
                .collect(),
            can_messages: config.can_messages,
        }
    }

    pub fn node(&self, index: usize) -> Option<&SharedNode> {
        self.nodes.get(index)
    }

    pub fn node_name(&self, index: usize) -> String {
        self.nodes
            .get(index)
            .map(|n| n.read().name.clone())
            .unwrap_or_else(|| format!("<node {}>", index))
    }

    pub fn message(&self, name: &str) -> Option<&CanMessage> {
        self.can_messages.iter().find(|m| m.name == name)
    }
}

impl From<SystemConfig> for SystemDefinition {
    fn from(config: SystemConfig) -> Self {
        Self::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Content;
    use crate::node::{DataPoolType, DiagnosticServer};
    use std::io::Write;

    const SYSTEM: &str = r#"
        [[buses]]
        name = "CAN1"
        kind = "can"

        [[nodes]]
        name = "ESX3"
        diagnostic_server = "native"
        interfaces = [{ bus_index = 0, node_id = 1, kind = "can" }]

        [[nodes.data_pools]]
        name = "NvmParams"
        version = [1, 0, 0]
        type = "nvm"

        [[nodes.data_pools.lists]]
        name = "Limits"
        nvm_start = 256
        nvm_size = 16
        crc_active = true
        elements = [
            { name = "MaxSpeed", nvm_address = 258, value = { type = "u16", value = 120 } },
        ]

        [[can_messages]]
        name = "Status"
        id = 0x100
        dlc = 8
        signals = [{ name = "Speed", start_bit = 0, bit_length = 16 }]
    "#;

    #[test]
    fn test_parse_system() {
        let system = SystemDefinition::new(SystemConfig::from_toml_str(SYSTEM).unwrap());
        let node = system.node(0).unwrap().read();
        assert_eq!(node.diagnostic_server, DiagnosticServer::Native);
        assert_eq!(node.data_pools[0].kind, DataPoolType::Nvm);
        let element = node.element(0, 0, 0).unwrap();
        assert_eq!(element.value, Content::U16(120));
        assert!(!element.valid);
        assert_eq!(system.message("Status").unwrap().signals.len(), 1);
    }

    #[test]
    fn test_node_name_out_of_range() {
        let system = SystemDefinition::default();
        assert_eq!(system.node_name(4), "<node 4>");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SYSTEM.as_bytes()).unwrap();
        let config = SystemConfig::from_file(file.path()).unwrap();
        assert_eq!(config.nodes.len(), 1);
    }
}
