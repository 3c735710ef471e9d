//! Driver errors and aggregated per-node reports

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::protocol::ProtocolError;

pub type DriverResult<T> = Result<T, DriverError>;

/// Errors of the NVM data dealer
#[derive(Debug, Error, Clone)]
pub enum DealerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Index out of range: {0}")]
    Range(String),

    #[error("List does not fit: {0}")]
    Overflow(String),

    #[error("Response too short: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("CRC mismatch: stored 0x{stored:04X}, computed 0x{computed:04X}")]
    ChecksumMismatch { stored: u16, computed: u16 },

    #[error("Call sequence violated: {0}")]
    Sequence(String),
}

/// Errors surfaced to callers of the driver
#[derive(Debug, Error, Clone)]
pub enum DriverError {
    /// Uninitialized or inconsistent setup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bad index, checked before any wire traffic
    #[error("Index out of range: {0}")]
    Range(String),

    #[error("Timeout waiting for server response")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Negative response 0x{nrc:02X} ({text}) for service 0x{service:02X}")]
    ProtocolNack { service: u8, nrc: u8, text: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("Size mismatch: {0}")]
    SizeMismatch(String),

    #[error("Overflow: {0}")]
    Overflow(String),

    #[error("Call sequence violated: {0}")]
    Sequence(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Another polled operation is still running
    #[error("Busy: another request is in progress")]
    Busy,

    /// A polled operation ended without producing a result
    #[error("Request aborted: {0}")]
    Aborted(String),

    #[error("Session start failed:\n{0}")]
    SessionStart(ErrorReport),
}

impl DriverError {
    /// Negative response code, if the failure came from a server NACK
    pub fn nrc(&self) -> Option<u8> {
        match self {
            DriverError::ProtocolNack { nrc, .. } => Some(*nrc),
            _ => None,
        }
    }
}

impl From<ProtocolError> for DriverError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Range(msg) => DriverError::Range(msg),
            ProtocolError::Config(msg) => DriverError::Config(msg),
            ProtocolError::Timeout => DriverError::Timeout,
            ProtocolError::Transport(msg) => DriverError::Transport(msg),
            ProtocolError::Nack { service, nrc } => DriverError::ProtocolNack {
                service,
                nrc: nrc.into(),
                text: nrc.to_string(),
            },
            ProtocolError::MalformedResponse(msg) => DriverError::MalformedResponse(msg),
            ProtocolError::NotSupported(protocol) => {
                DriverError::NotSupported(format!("{} protocol", protocol))
            }
        }
    }
}

impl From<DealerError> for DriverError {
    fn from(err: DealerError) -> Self {
        match err {
            DealerError::Protocol(e) => e.into(),
            DealerError::Range(msg) => DriverError::Range(msg),
            DealerError::Overflow(msg) => DriverError::Overflow(msg),
            e @ DealerError::SizeMismatch { .. } => DriverError::SizeMismatch(e.to_string()),
            e @ DealerError::ChecksumMismatch { .. } => {
                DriverError::ChecksumMismatch(e.to_string())
            }
            DealerError::Sequence(msg) => DriverError::Sequence(msg),
        }
    }
}

/// One node's failure in a bulk step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub node: usize,
    pub name: String,
    pub reason: String,
}

/// Node-indexed collection of failures with a readable rendering
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorReport {
    entries: Vec<ReportEntry>,
}

impl ErrorReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: usize, name: impl Into<String>, reason: impl Into<String>) {
        self.entries.push(ReportEntry {
            node,
            name: name.into(),
            reason: reason.into(),
        });
    }

    pub fn extend(&mut self, other: ErrorReport) {
        self.entries.extend(other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    /// Indices of all nodes with at least one failure
    pub fn nodes(&self) -> BTreeSet<usize> {
        self.entries.iter().map(|e| e.node).collect()
    }

    pub fn contains_node(&self, node: usize) -> bool {
        self.entries.iter().any(|e| e.node == node)
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "- {}: {}", entry.name, entry.reason)?;
        }
        Ok(())
    }
}
