//! Node, data pool, list and element definitions

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::content::Content;

/// Diagnostic server flavour running on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticServer {
    /// openSYDE server: memory and data pool services, metadata, routing
    Native,
    /// KEFEX server: logon/logoff, CAN only, no routing
    Legacy,
    /// Third-party node without a diagnostic server
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Can,
    Ethernet,
}

/// One bus connection of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Index of the connected bus in the system definition
    pub bus_index: u8,
    /// Node id on that bus
    pub node_id: u8,
    /// Interface number on the node, used as outbound interface when routing
    #[serde(default)]
    pub number: u8,
    pub kind: InterfaceKind,
}

/// Address of a diagnostic server on one bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    pub bus_index: u8,
    pub node_id: u8,
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus {} / node {}", self.bus_index, self.node_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPoolType {
    Diag,
    Nvm,
    HalcNvm,
    Com,
}

impl DataPoolType {
    /// Whether the pool content lives in non-volatile memory
    pub fn is_nvm_based(&self) -> bool {
        matches!(self, DataPoolType::Nvm | DataPoolType::HalcNvm)
    }
}

/// One ECU in the system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub diagnostic_server: DiagnosticServer,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub data_pools: Vec<DataPool>,
}

impl Node {
    pub fn new(name: impl Into<String>, diagnostic_server: DiagnosticServer) -> Self {
        Self {
            name: name.into(),
            diagnostic_server,
            interfaces: Vec::new(),
            data_pools: Vec::new(),
        }
    }

    pub fn interface_on(&self, bus_index: u8) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.bus_index == bus_index)
    }

    /// Server address on `bus_index`, falling back to the first interface
    pub fn server_address(&self, bus_index: u8) -> Option<ServerAddress> {
        self.interface_on(bus_index)
            .or_else(|| self.interfaces.first())
            .map(|i| ServerAddress {
                bus_index: i.bus_index,
                node_id: i.node_id,
            })
    }

    pub fn list(&self, data_pool: usize, list: usize) -> Option<&List> {
        self.data_pools.get(data_pool)?.lists.get(list)
    }

    pub fn list_mut(&mut self, data_pool: usize, list: usize) -> Option<&mut List> {
        self.data_pools.get_mut(data_pool)?.lists.get_mut(list)
    }

    pub fn element(&self, data_pool: usize, list: usize, element: usize) -> Option<&Element> {
        self.list(data_pool, list)?.elements.get(element)
    }

    pub fn element_mut(
        &mut self,
        data_pool: usize,
        list: usize,
        element: usize,
    ) -> Option<&mut Element> {
        self.list_mut(data_pool, list)?.elements.get_mut(element)
    }
}

/// Named, versioned container of lists mirrored between client and server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPool {
    pub name: String,
    pub version: [u8; 3],
    #[serde(rename = "type")]
    pub kind: DataPoolType,
    #[serde(default)]
    pub lists: Vec<List>,
}

impl DataPool {
    /// Version formatted as `vMM.mmrRR`
    pub fn version_string(&self) -> String {
        format_version(&self.version)
    }
}

pub fn format_version(version: &[u8; 3]) -> String {
    format!("v{:02}.{:02}r{:02}", version[0], version[1], version[2])
}

/// Contiguous NVM region of a data pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct List {
    pub name: String,
    /// Absolute NVM start address
    pub nvm_start: u32,
    /// Reserved NVM size in bytes
    pub nvm_size: u32,
    /// Leading 2-byte CRC slot present
    #[serde(default)]
    pub crc_active: bool,
    /// Last CRC read from or written to the device
    #[serde(default)]
    pub crc: u16,
    #[serde(default)]
    pub elements: Vec<Element>,
}

impl List {
    /// Number of bytes covered by the CRC slot and all elements
    pub fn num_bytes_used(&self) -> u32 {
        let crc_bytes = if self.crc_active { 2 } else { 0 };
        self.elements
            .iter()
            .map(|e| {
                e.nvm_address
                    .saturating_sub(self.nvm_start)
                    .saturating_add(e.size() as u32)
            })
            .fold(crc_bytes, u32::max)
    }
}

/// One value inside a list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    pub name: String,
    /// Absolute NVM address
    pub nvm_address: u32,
    pub value: Content,
    /// Default value from the definition, if different from the initial value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Content>,
    /// Set after a successful decode of a device response
    #[serde(skip)]
    pub valid: bool,
}

impl Element {
    pub fn new(name: impl Into<String>, nvm_address: u32, value: Content) -> Self {
        Self {
            name: name.into(),
            nvm_address,
            value,
            default: None,
            valid: false,
        }
    }

    pub fn size(&self) -> usize {
        self.value.size()
    }

    pub fn default_value(&self) -> Content {
        self.default.unwrap_or(self.value)
    }
}
