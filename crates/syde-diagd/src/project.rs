//! Project file: driver settings, system definition and view in one TOML

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use syde_core::{ElementId, SystemConfig, ViewConfig};
use syde_diag::DriverConfig;

/// Everything the daemon needs to run one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub driver: DriverConfig,
    pub system: SystemConfig,
    pub view: ViewConfig,
    /// CAN signals logged while cycling
    #[serde(default)]
    pub subscriptions: Vec<SignalSubscription>,
}

/// Deliver one CAN signal as the value of an element
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSubscription {
    pub element: ElementId,
    pub message: String,
    pub signal: String,
}

impl ProjectConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid project {}", path.display()))
    }

    /// Built-in project on the mock bus
    pub fn demo() -> anyhow::Result<Self> {
        Self::from_toml_str(DEMO_PROJECT)
    }
}

const DEMO_PROJECT: &str = r#"
[driver.dispatcher]
type = "mock"
latency_ms = 2

[[system.buses]]
name = "CAN1"
kind = "can"

[[system.nodes]]
name = "ESX3"
diagnostic_server = "native"

[[system.nodes.interfaces]]
bus_index = 0
node_id = 1
kind = "can"

[[system.nodes.data_pools]]
name = "Live"
version = [1, 0, 0]
type = "diag"

[[system.nodes.data_pools.lists]]
name = "signals"
nvm_start = 0
nvm_size = 4

[[system.nodes.data_pools.lists.elements]]
name = "engine_speed"
nvm_address = 0
value = { type = "u16", value = 0 }

[[system.nodes.data_pools.lists.elements]]
name = "coolant_temp"
nvm_address = 2
value = { type = "i8", value = 0 }

[[system.can_messages]]
name = "EngineStatus"
id = 0x181
dlc = 8

[[system.can_messages.signals]]
name = "EngineSpeed"
start_bit = 0
bit_length = 16

[[system.can_messages.signals]]
name = "CoolantTemp"
start_bit = 16
bit_length = 8

[view]
name = "Demo"
active_bus = 0
active_nodes = [0]

[[subscriptions]]
element = { node = 0, data_pool = 0, list = 0, element = 0 }
message = "EngineStatus"
signal = "EngineSpeed"

[[subscriptions]]
element = { node = 0, data_pool = 0, list = 0, element = 1 }
message = "EngineStatus"
signal = "CoolantTemp"
"#;
