//! Transport layer for diagnostic communication
//!
//! This module provides the channels the protocol layer talks through:
//! - [`TransportAdapter`]: request/response channel to one server
//! - [`BusDispatcher`]: opens channels and exposes raw bus frames
//! - Mock implementations for testing and demos
//!
//! # Example
//!
//! ```ignore
//! use syde_diag::transport::{create_dispatcher, DispatcherConfig};
//!
//! let dispatcher = create_dispatcher(&DispatcherConfig::default())?;
//! let channel = dispatcher.open(address).await?;
//! let response = channel.send_receive(&[0x10, 0x03], Duration::from_secs(1)).await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;

pub use adapter::{BusDispatcher, CanFrame, IncomingMessage, TransportAdapter};
pub use error::TransportError;

use std::sync::Arc;

use crate::config::DispatcherConfig;

/// Create a bus dispatcher based on configuration
pub fn create_dispatcher(
    config: &DispatcherConfig,
) -> Result<Arc<dyn BusDispatcher>, TransportError> {
    match config {
        DispatcherConfig::Mock(cfg) => Ok(Arc::new(mock::MockBus::new(cfg))),
    }
}
