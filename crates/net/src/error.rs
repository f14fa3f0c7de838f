//! Network error types

use std::io;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Connection timed out")]
    ConnectionTimeout,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Failed to bind port {port}: {source}")]
    PortBindFailed {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Peer disconnected unexpectedly")]
    UnexpectedDisconnect,

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Peer is no longer available")]
    PeerVanished,

    #[error("A connection request for this peer is already pending")]
    DuplicateRequest,

    #[error("A session is already active")]
    AlreadyActive,

    #[error("Not initialized")]
    NotInitialized,

    #[error("Cancelled")]
    Cancelled,
}
