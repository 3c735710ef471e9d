//! Protocol layer errors

use thiserror::Error;

use super::NegativeResponseCode;
use crate::transport::TransportError;

#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    /// Parameter rejected on the client side, nothing was sent
    #[error("Parameter out of range: {0}")]
    Range(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Response timeout")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Negative response: {nrc} (0x{nrc:02X}) for service 0x{service:02X}")]
    Nack {
        service: u8,
        nrc: NegativeResponseCode,
    },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Service not supported by the {0} protocol")]
    NotSupported(&'static str),
}

impl ProtocolError {
    /// Negative response code, if the server sent one
    pub fn nrc(&self) -> Option<u8> {
        match self {
            ProtocolError::Nack { nrc, .. } => Some((*nrc).into()),
            _ => None,
        }
    }
}

impl From<TransportError> for ProtocolError {
    fn from(err: TransportError) -> Self {
        if err.is_timeout() {
            ProtocolError::Timeout
        } else {
            ProtocolError::Transport(err.to_string())
        }
    }
}
