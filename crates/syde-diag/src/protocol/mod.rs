//! Diagnostic protocol layer
//!
//! One [`DiagProtocol`] instance exists per active node. It wraps either the
//! openSYDE protocol ([`NativeProtocol`]) or the KEFEX protocol
//! ([`LegacyProtocol`]). Operations shared by both are dispatched on the
//! variant; logoff and dispatcher attachment are only reachable through
//! [`DiagProtocol::as_legacy_mut`].

mod error;
pub mod legacy;
pub mod native;
mod nrc;

pub use error::ProtocolError;
pub use legacy::LegacyProtocol;
pub use native::NativeProtocol;
pub use nrc::NegativeResponseCode;

use std::fmt;
use std::time::Instant;

use syde_core::{ByteOrder, ElementId};

/// openSYDE service identifiers
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const WRITE_MEMORY_BY_ADDRESS: u8 = 0x3D;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
    pub const READ_DATA_POOL_DATA: u8 = 0xBA;
    pub const WRITE_DATA_POOL_DATA: u8 = 0xBB;
    pub const READ_DATA_POOL_EVENT_DRIVEN: u8 = 0xBC;
    pub const NOTIFY_NVM_DATA_CHANGES: u8 = 0xBE;
}

/// Diagnostic session identifiers
pub mod session {
    pub const DEFAULT: u8 = 0x01;
    pub const EXTENDED: u8 = 0x03;
}

/// Which protocol a node speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Native,
    Legacy,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Native => write!(f, "openSYDE"),
            ProtocolKind::Legacy => write!(f, "KEFEX"),
        }
    }
}

/// Server-side description of one data pool slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPoolMetadata {
    pub name: String,
    pub version: [u8; 3],
}

/// Event-driven value pushed by a server
#[derive(Debug, Clone)]
pub struct DataPoolEvent {
    /// Element in client indices
    pub element: ElementId,
    pub data: Vec<u8>,
    pub timestamp: Instant,
}

/// Per-node diagnostic protocol
pub enum DiagProtocol {
    Native(NativeProtocol),
    Legacy(LegacyProtocol),
}

macro_rules! dispatch {
    ($self:ident, $p:ident => $call:expr) => {
        match $self {
            DiagProtocol::Native($p) => $call,
            DiagProtocol::Legacy($p) => $call,
        }
    };
}

impl DiagProtocol {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            DiagProtocol::Native(_) => ProtocolKind::Native,
            DiagProtocol::Legacy(_) => ProtocolKind::Legacy,
        }
    }

    /// Byte order used for every multi-byte value exchanged with the server
    pub fn endianness(&self) -> ByteOrder {
        dispatch!(self, p => p.endianness())
    }

    pub fn as_native(&self) -> Option<&NativeProtocol> {
        match self {
            DiagProtocol::Native(p) => Some(p),
            DiagProtocol::Legacy(_) => None,
        }
    }

    pub fn as_native_mut(&mut self) -> Option<&mut NativeProtocol> {
        match self {
            DiagProtocol::Native(p) => Some(p),
            DiagProtocol::Legacy(_) => None,
        }
    }

    pub fn as_legacy_mut(&mut self) -> Option<&mut LegacyProtocol> {
        match self {
            DiagProtocol::Legacy(p) => Some(p),
            DiagProtocol::Native(_) => None,
        }
    }

    pub async fn read(&self, address: u32, length: usize) -> Result<Vec<u8>, ProtocolError> {
        dispatch!(self, p => p.read_memory(address, length).await)
    }

    pub async fn write(&self, address: u32, data: &[u8]) -> Result<(), ProtocolError> {
        dispatch!(self, p => p.write_memory(address, data).await)
    }

    pub async fn set_session(&mut self, session_id: u8) -> Result<(), ProtocolError> {
        match self {
            DiagProtocol::Native(p) => p.set_session(session_id).await,
            DiagProtocol::Legacy(p) => p.logon().await,
        }
    }

    pub async fn security_access(&self, level: u8) -> Result<(), ProtocolError> {
        match self {
            DiagProtocol::Native(p) => p.security_access(level).await,
            // KEFEX has no security access
            DiagProtocol::Legacy(_) => Ok(()),
        }
    }

    pub async fn tester_present(&self) -> Result<(), ProtocolError> {
        dispatch!(self, p => p.tester_present().await)
    }

    pub async fn set_event_rate(&mut self, rail: u8, rate_ms: u16) -> Result<(), ProtocolError> {
        dispatch!(self, p => p.set_event_rate(rail, rate_ms).await)
    }

    pub async fn register_cyclic_transmission(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
        rail: u8,
    ) -> Result<(), ProtocolError> {
        dispatch!(self, p => p.register_cyclic(data_pool, list, element, rail).await)
    }

    pub async fn register_change_driven_transmission(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
        rail: u8,
        threshold: u32,
    ) -> Result<(), ProtocolError> {
        dispatch!(self, p => p.register_change_driven(data_pool, list, element, rail, threshold).await)
    }

    pub async fn stop_all_event_driven(&self) -> Result<(), ProtocolError> {
        dispatch!(self, p => p.stop_all_event_driven().await)
    }

    /// Server metadata of `slot`; `None` once the slot is out of range
    pub async fn read_metadata(
        &self,
        slot: u8,
    ) -> Result<Option<DataPoolMetadata>, ProtocolError> {
        match self {
            DiagProtocol::Native(p) => p.read_metadata(slot).await,
            DiagProtocol::Legacy(_) => Err(ProtocolError::NotSupported("KEFEX")),
        }
    }

    pub async fn verify_checksum(&self, slot: u8, checksum: u32) -> Result<bool, ProtocolError> {
        match self {
            DiagProtocol::Native(p) => p.verify_checksum(slot, checksum).await,
            DiagProtocol::Legacy(_) => Err(ProtocolError::NotSupported("KEFEX")),
        }
    }

    pub async fn data_pool_read(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
    ) -> Result<Vec<u8>, ProtocolError> {
        dispatch!(self, p => p.data_pool_read(data_pool, list, element).await)
    }

    pub async fn data_pool_write(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        dispatch!(self, p => p.data_pool_write(data_pool, list, element, data).await)
    }

    pub async fn nvm_notify_of_changes(
        &self,
        data_pool: usize,
        list: usize,
    ) -> Result<bool, ProtocolError> {
        match self {
            DiagProtocol::Native(p) => p.nvm_notify_of_changes(data_pool, list).await,
            DiagProtocol::Legacy(_) => Err(ProtocolError::NotSupported("KEFEX")),
        }
    }

    /// Drive internal timers and collect event-driven responses
    ///
    /// Must be called regularly while a session is active.
    pub fn cycle(&mut self) -> Vec<DataPoolEvent> {
        dispatch!(self, p => p.cycle())
    }
}

/// Check a response for the positive response id of `service`
pub(crate) fn expect_positive(service: u8, response: &[u8]) -> Result<(), ProtocolError> {
    match response.first() {
        Some(&sid) if sid == service.wrapping_add(0x40) => Ok(()),
        Some(&sid) => Err(ProtocolError::MalformedResponse(format!(
            "unexpected response 0x{:02X} to service 0x{:02X}",
            sid, service
        ))),
        None => Err(ProtocolError::MalformedResponse(format!(
            "empty response to service 0x{:02X}",
            service
        ))),
    }
}

pub(crate) fn to_u16(value: usize, what: &str) -> Result<u16, ProtocolError> {
    u16::try_from(value).map_err(|_| ProtocolError::Range(format!("{} {} exceeds 16 bit", what, value)))
}

pub(crate) fn encode_u16(value: u16, order: ByteOrder) -> [u8; 2] {
    match order {
        ByteOrder::Little => value.to_le_bytes(),
        ByteOrder::Big => value.to_be_bytes(),
    }
}

pub(crate) fn encode_u32(value: u32, order: ByteOrder) -> [u8; 4] {
    match order {
        ByteOrder::Little => value.to_le_bytes(),
        ByteOrder::Big => value.to_be_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_positive() {
        assert!(expect_positive(0x23, &[0x63, 0x01]).is_ok());
        assert!(matches!(
            expect_positive(0x23, &[0x62]),
            Err(ProtocolError::MalformedResponse(_))
        ));
        assert!(expect_positive(0x23, &[]).is_err());
    }

    #[test]
    fn test_nack_exposes_code() {
        let err = ProtocolError::Nack {
            service: 0xBC,
            nrc: NegativeResponseCode::UploadDownloadNotAccepted,
        };
        assert_eq!(err.nrc(), Some(0x70));
        assert_eq!(ProtocolError::Timeout.nrc(), None);
    }
}
