//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced by the ordering chain and its collaborators.
#[derive(Debug, Error)]
pub enum OrdererError {
    /// The chain has not been started yet.
    #[error("chain not running")]
    NotRunning,

    /// The chain has been halted.
    #[error("chain stopped")]
    Stopped,

    /// No leader is currently known; the submission was not enqueued.
    #[error("no leader")]
    NoLeader,

    /// Re-validation against the latest config sequence failed.
    #[error("bad message: {0}")]
    BadMessage(String),

    /// Channel-config bundle diff validation failed (C7).
    #[error("{0}")]
    Validation(String),

    /// Channel-config bundle pre-validation failed (C7 phase 1).
    #[error("{0}")]
    Prevalidation(String),

    /// RPC forwarding or block-pull failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Storage-facade I/O failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Raft library error.
    #[error("raft error: {0}")]
    Raft(String),

    /// Unrecoverable condition; the chain halts.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The actor channel to the serializer or driver was closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Encoding/decoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, OrdererError>;

impl From<std::io::Error> for OrdererError {
    fn from(e: std::io::Error) -> Self {
        OrdererError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for OrdererError {
    fn from(e: bincode::Error) -> Self {
        OrdererError::Serialization(e.to_string())
    }
}

impl From<protobuf::ProtobufError> for OrdererError {
    fn from(e: protobuf::ProtobufError) -> Self {
        OrdererError::Serialization(e.to_string())
    }
}

impl From<raft::Error> for OrdererError {
    fn from(e: raft::Error) -> Self {
        OrdererError::Raft(e.to_string())
    }
}
