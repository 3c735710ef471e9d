//! CAN message layouts used for live signal decoding

use serde::{Deserialize, Serialize};

use crate::content::ByteOrder;

/// Role of a signal in a multiplexed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MuxType {
    /// Always present
    #[default]
    Default,
    /// Carries the selector for multiplexed signals
    Multiplexer,
    /// Present only when the multiplexer equals `selector`
    Multiplexed { selector: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanSignal {
    pub name: String,
    /// Position of the least significant bit
    pub start_bit: u16,
    pub bit_length: u16,
    #[serde(default = "default_signal_order")]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub mux: MuxType,
}

fn default_signal_order() -> ByteOrder {
    ByteOrder::Little
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanMessage {
    pub name: String,
    pub id: u32,
    #[serde(default)]
    pub extended: bool,
    pub dlc: u8,
    #[serde(default)]
    pub signals: Vec<CanSignal>,
}

impl CanMessage {
    pub fn signal(&self, name: &str) -> Option<&CanSignal> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// The multiplexer signal of this message, if any
    pub fn multiplexer(&self) -> Option<&CanSignal> {
        self.signals.iter().find(|s| s.mux == MuxType::Multiplexer)
    }
}
