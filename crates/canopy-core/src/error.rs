//! Error types for the relay tree

use thiserror::Error;

use crate::PeerId;

/// Core relay-tree errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CanopyError {
    // Registry errors
    #[error("Registry unavailable: {0}")]
    TransientStoreFailure(String),

    // Attach errors
    #[error("Upstream {parent} did not open within the attach bound")]
    AttachTimeout { parent: PeerId },

    #[error("Downstream capacity {capacity} exhausted")]
    CapacityExceeded { capacity: usize },

    // Protocol errors
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    // Transport errors
    #[error("Transport to {peer} reported {state}")]
    TransportFailure { peer: PeerId, state: String },

    // Local errors
    #[error("Fatal local failure: {0}")]
    FatalLocalFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// The five failure classes every error is routed by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Logged, treated as no effect, retried by the next triggering event
    TransientStore,
    /// Triggers re-placement
    AttachTimeout,
    /// Offending connection is rejected; the node keeps running
    ProtocolViolation,
    /// Viewer-count correction or descendant removal
    Transport,
    /// Routed to the close path
    Fatal,
}

impl CanopyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CanopyError::TransientStoreFailure(_) => ErrorKind::TransientStore,
            CanopyError::AttachTimeout { .. } => ErrorKind::AttachTimeout,
            CanopyError::CapacityExceeded { .. }
            | CanopyError::ProtocolViolation(_)
            | CanopyError::InvalidMetadata(_) => ErrorKind::ProtocolViolation,
            CanopyError::TransportFailure { .. } => ErrorKind::Transport,
            CanopyError::FatalLocalFailure(_) | CanopyError::Config(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

/// Result type for relay-tree operations
pub type CanopyResult<T> = Result<T, CanopyError>;
