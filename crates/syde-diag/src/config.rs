//! Driver configuration
//!
//! Timing, security and protocol settings of the diagnostic driver. All
//! fields have defaults so an empty `[driver]` table is a valid config.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use syde_core::ByteOrder;

/// Configuration for the diagnostic driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Interval between tester present messages
    #[serde(default = "default_tester_present_ms")]
    pub tester_present_interval_ms: u64,
    /// Pause at the end of each cyclic engine iteration
    #[serde(default = "default_cycle_yield_ms")]
    pub cycle_yield_ms: u64,
    /// Bounded wait for the cyclic engine to stop
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Timeout of a single request/response exchange
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Total time a server may answer "response pending"
    #[serde(default = "default_response_pending_timeout_ms")]
    pub response_pending_timeout_ms: u64,
    #[serde(default)]
    pub security: SecurityConfig,
    /// Maximum payload of one memory transfer
    #[serde(default = "default_nvm_block_size")]
    pub nvm_block_size: usize,
    #[serde(default)]
    pub legacy: LegacyConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tester_present_interval_ms: default_tester_present_ms(),
            cycle_yield_ms: default_cycle_yield_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            response_pending_timeout_ms: default_response_pending_timeout_ms(),
            security: SecurityConfig::default(),
            nvm_block_size: default_nvm_block_size(),
            legacy: LegacyConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl DriverConfig {
    pub fn tester_present_interval(&self) -> Duration {
        Duration::from_millis(self.tester_present_interval_ms)
    }

    pub fn cycle_yield(&self) -> Duration {
        Duration::from_millis(self.cycle_yield_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn response_pending_timeout(&self) -> Duration {
        Duration::from_millis(self.response_pending_timeout_ms)
    }
}

fn default_tester_present_ms() -> u64 {
    1000
}

fn default_cycle_yield_ms() -> u64 {
    1
}

fn default_stop_timeout_ms() -> u64 {
    2000
}

fn default_request_timeout_ms() -> u64 {
    1000
}

fn default_response_pending_timeout_ms() -> u64 {
    30000
}

fn default_nvm_block_size() -> usize {
    256
}

// =============================================================================
// Security
// =============================================================================

/// Security access settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Security level requested at session start
    #[serde(default = "default_security_level")]
    pub level: u8,
    /// Key = seed XOR mask
    #[serde(default)]
    pub key_mask: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            level: default_security_level(),
            key_mask: 0,
        }
    }
}

fn default_security_level() -> u8 {
    1
}

// =============================================================================
// Legacy protocol
// =============================================================================

/// KEFEX protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyConfig {
    /// Client address announced at logon
    #[serde(default)]
    pub client_address: u8,
    /// Byte order of the server
    #[serde(default = "default_legacy_order")]
    pub byte_order: ByteOrder,
    /// Base CAN id of the server, used when tunneling through a router
    #[serde(default = "default_legacy_base_id")]
    pub base_can_id: u32,
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            client_address: 0,
            byte_order: default_legacy_order(),
            base_can_id: default_legacy_base_id(),
        }
    }
}

fn default_legacy_order() -> ByteOrder {
    ByteOrder::Little
}

fn default_legacy_base_id() -> u32 {
    0x600
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Bus dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DispatcherConfig {
    /// Mock bus for testing and demos
    Mock(MockConfig),
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// Mock transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated latency per request
    #[serde(default)]
    pub latency_ms: u64,
}
