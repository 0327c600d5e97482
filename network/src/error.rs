use spv_core::{ChainError, MerkleValidationError};
use thiserror::Error;

/// Version message checks that failed during the handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Peer protocol version {version} is below required {required}")]
    ProtocolTooOld { version: u32, required: u32 },

    #[error("Peer announced invalid best height {0}")]
    InvalidHeight(i32),

    #[error("Peer chain height {announced} is behind ours ({local})")]
    StalePeerChain { announced: u32, local: u32 },

    #[error("Peer is not a full node")]
    NotFullNode,

    #[error("Peer does not support bloom filters")]
    NoBloomFilterSupport,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("Ping timed out")]
    Ping,

    #[error("Task {0} timed out")]
    Task(&'static str),
}

/// Connection level failures that say nothing about the peer's honesty
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Malformed message: {0}")]
    Decode(String),

    #[error("Unknown network error")]
    Unknown,
}

/// Reason a peer was disconnected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Invalid merkle block: {0}")]
    MerkleValidation(#[from] MerkleValidationError),

    #[error("Timeout: {0}")]
    Timeout(#[from] TimeoutError),

    #[error("Peer is too slow")]
    TooSlow,

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

impl PeerError {
    pub fn is_too_slow(&self) -> bool {
        matches!(self, PeerError::TooSlow)
    }
}
