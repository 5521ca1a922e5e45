//! Common error types for Cumulus components.

use thiserror::Error;

/// Errors shared by the controller, nodes and clients.
#[derive(Debug, Error)]
pub enum GridError {
    /// Send/receive on a channel that was closed or never connected
    #[error("Channel is not connected")]
    NotConnected,

    /// First handshake message could not be decrypted or parsed, or named an unknown identity
    #[error("Malformed handshake: {0}")]
    MalformedHandshake(String),

    /// Responder echoed a different challenge than the one we sent
    #[error("Handshake challenge mismatch")]
    ChallengeMismatch,

    /// Proof of key possession failed after switching to the symmetric layer
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Integrity tag did not match the payload
    #[error("Term {payload} tampered during transmission")]
    Tampered { payload: String },

    /// No Online node advertises the operator
    #[error("No node can compute operator {0}")]
    NoCapableNode(char),

    /// Node did not answer in time or answered garbage
    #[error("Node {node} unavailable: {reason}")]
    NodeUnavailable { node: String, reason: String },

    /// Term uses an operator no Online node offers
    #[error("Operation {0} is not supported")]
    UnsupportedOperator(char),

    /// Client balance cannot cover the request
    #[error("not enough credits")]
    InsufficientCredits { required: i64, available: i64 },

    /// Peers did not all agree on the proposed resource level
    #[error("Admission rejected: {0}")]
    AdmissionRejected(String),

    /// Node reported an arithmetic failure (e.g. division by zero)
    #[error("{0}")]
    Computation(String),

    /// Request does not follow the wire grammar
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Cipher setup or operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Key file missing or malformed
    #[error("Key material error: {0}")]
    KeyMaterial(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GridError {
    /// Returns true if the connection carrying this error must be closed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::MalformedHandshake(_)
                | Self::ChallengeMismatch
                | Self::HandshakeFailed(_)
                | Self::Io(_)
        )
    }

    /// Returns true for business failures that are reported as a normal reply
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            Self::Tampered { .. }
                | Self::NoCapableNode(_)
                | Self::NodeUnavailable { .. }
                | Self::UnsupportedOperator(_)
                | Self::InsufficientCredits { .. }
                | Self::Computation(_)
        )
    }

    /// Text sent back to a client for this error
    pub fn user_message(&self) -> String {
        format!("Error: {}", self)
    }
}

pub type Result<T> = std::result::Result<T, GridError>;
