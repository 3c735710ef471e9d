//! Bus channel errors, always tied to the server they concern

use std::time::Duration;

use syde_core::ServerAddress;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The dispatcher could not open a channel to the server
    #[error("Server {address} unreachable: {reason}")]
    Unreachable {
        address: ServerAddress,
        reason: String,
    },

    #[error("Channel to server {0} is closed")]
    ChannelClosed(ServerAddress),

    #[error("No response from server {address} within {timeout:?}")]
    NoResponse {
        address: ServerAddress,
        timeout: Duration,
    },

    /// The request never left the client
    #[error("Request to server {address} rejected: {reason}")]
    Rejected {
        address: ServerAddress,
        reason: String,
    },
}

impl TransportError {
    pub fn address(&self) -> ServerAddress {
        match self {
            TransportError::Unreachable { address, .. }
            | TransportError::NoResponse { address, .. }
            | TransportError::Rejected { address, .. } => *address,
            TransportError::ChannelClosed(address) => *address,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::NoResponse { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_server() {
        let address = ServerAddress {
            bus_index: 1,
            node_id: 7,
        };
        let err = TransportError::NoResponse {
            address,
            timeout: Duration::from_millis(50),
        };
        assert_eq!(err.to_string(), "No response from server bus 1 / node 7 within 50ms");
        assert!(err.is_timeout());
        assert_eq!(TransportError::ChannelClosed(address).address(), address);
        assert!(!TransportError::ChannelClosed(address).is_timeout());
    }
}
