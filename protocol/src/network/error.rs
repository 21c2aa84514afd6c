//! Errors raised by the peer transport.

use std::io;

use thiserror::Error;

use super::message::NodeAddress;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    /// A length prefix so large the stream cannot be resynchronised by
    /// skipping it. Fatal for the connection.
    #[error("frame length {size} exceeds the skippable limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("connect to {peer} timed out")]
    ConnectTimeout { peer: NodeAddress },

    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: NodeAddress, reason: String },

    #[error("connection {0} is closed")]
    ConnectionClosed(String),

    #[error("no connected peers")]
    NoPeers,

    #[error("network layer is shutting down")]
    ShuttingDown,
}

impl From<bincode::Error> for NetworkError {
    fn from(err: bincode::Error) -> Self {
        NetworkError::Serialization(err.to_string())
    }
}
