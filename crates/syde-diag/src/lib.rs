//! syde-diag - Diagnostic communication driver for openSYDE and KEFEX servers
//!
//! This crate establishes diagnostic sessions with the nodes of a system,
//! optionally through routing nodes, verifies that the server data pools
//! match the client definition, and gives access to NVM lists and data pool
//! elements.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   CommunicationDriver                       │
//! │  session lifecycle, defect nodes, error reports             │
//! │                                                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │RoutingMgr   │  │ Verifier    │  │CyclicEngine         │  │
//! │  │ (hops)      │  │ (metadata)  │  │ (tester present,    │  │
//! │  └─────────────┘  └─────────────┘  │  signals, events)   │  │
//! │                                    └─────────────────────┘  │
//! │  ┌─────────────┐                                            │
//! │  │PollingEngine│──▶ DataDealer (NVM lists, CRC)             │
//! │  └─────────────┘          │                                 │
//! │                    ┌──────┴──────┐                          │
//! │                    │DiagProtocol │ Native | Legacy          │
//! │                    └──────┬──────┘                          │
//! │                 ┌─────────┴────────┐                        │
//! │                 │TransportAdapter  │ (BusDispatcher/mock)   │
//! │                 └──────────────────┘                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod cyclic;
pub mod dealer;
pub mod driver;
pub mod error;
pub mod polling;
pub mod protocol;
pub mod routing;
pub mod transport;
pub mod verifier;

pub use config::{DispatcherConfig, DriverConfig, LegacyConfig, MockConfig, SecurityConfig};
pub use cyclic::{SignalEvent, SubscriberRegistry};
pub use dealer::{nvm_calc_crc, DataDealer, ListSnapshot, SafeWriteStep};
pub use driver::{ActiveNode, CommunicationDriver, CyclicSetupReport, DriverState};
pub use error::{DealerError, DriverError, DriverResult, ErrorReport, ReportEntry};
pub use polling::{PollOutcome, PollOutput, PollState, PollingEngine};
pub use protocol::{
    DataPoolEvent, DataPoolMetadata, DiagProtocol, NegativeResponseCode, ProtocolError,
    ProtocolKind,
};
pub use routing::{LegacyRoutingAdapter, RoutingChainNode, RoutingError, RoutingManager};
pub use transport::{BusDispatcher, CanFrame, TransportAdapter, TransportError};
pub use verifier::{data_pool_hash, HashVariant, NodeVerification, VerificationFailure};

// Re-export for convenience
pub use syde_core::{ElementId, ListId, SystemDefinition, ViewConfig};
