//! Main Crate Error

use crate::common::{Id, NetworkId};
use crate::rpc::{ConsumerId, TokenId};

#[derive(thiserror::Error, Debug)]
/// Drt crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse payload bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// Identifiers must be exactly [ID_SIZE](crate::common::ID_SIZE) bytes.
    #[error("Invalid Id size, expected 64, got {0}")]
    InvalidIdSize(usize),

    /// Identifiers parsed from hex must be valid hex.
    #[error("Invalid Id encoding")]
    InvalidIdEncoding,

    /// A contact from another logical network was offered to the routing table.
    #[error("Network id mismatch, expected {expected:?}, found {found:?}")]
    NetworkMismatch {
        expected: NetworkId,
        found: NetworkId,
    },

    /// A message was addressed to a consumer that is not registered.
    #[error("No consumer registered for {0:?}")]
    UnknownConsumer(ConsumerId),

    /// A consumer declared a required dependency that could not be satisfied.
    #[error("Consumer {consumer:?} requires {dependency:?} which is not registered")]
    MissingDependency {
        consumer: ConsumerId,
        dependency: ConsumerId,
    },

    /// A response arrived for a token that is not pending (stale, duplicate or foreign).
    #[error("No pending token for response {0}")]
    UnmatchedResponse(TokenId),

    /// The remote peer did not answer before the timeout elapsed.
    #[error("Request timed out")]
    Timeout,

    /// The in-process peer is no longer part of the local network.
    #[error("Peer {0} is unreachable")]
    Unreachable(Id),

    /// A packet could not be decoded.
    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// A packet started with a flag that is neither Ping nor Data.
    #[error("Unknown packet flag {0}")]
    UnknownPacketFlag(u8),
}

/// Alias for results returned by this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
