//! Error types for zflow sessions.

use zflow_proto::{DecodeError, EncodeError};

use crate::flow::FlowId;

/// Alias for `Result<T, zflow::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a single flow failed.
///
/// These never escape the flow they concern: the engine terminates the
/// flow, reports the error to whoever owns it, and keeps dispatching.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum FlowError {
    /// A message arrived out of order, duplicated, or without a sequence number.
    #[error("sequence violation: expected {expected}, got {got:?}")]
    Sequence {
        /// The next sequence number this direction should carry.
        expected: u64,
        /// What the message actually carried.
        got: Option<u64>,
    },

    /// A send would exceed the credits the peer granted.
    #[error("credit violation: {requested} bytes requested, {available} available")]
    Credit {
        /// Bytes the caller tried to debit.
        requested: u64,
        /// Credits left at the time.
        available: u64,
    },

    /// The peer failed the flow.
    #[error("peer error: {condition}")]
    Peer {
        /// Condition string exactly as the peer sent it.
        condition: String,
    },

    /// The peer cancelled the flow.
    #[error("cancelled by peer")]
    Cancelled,

    /// The peer sent something the current state does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A directed send was attempted before the peer's address was known.
    #[error("no reply address learned for this flow yet")]
    NoReplyAddress,

    /// The flow has already terminated, or is closing.
    #[error("flow is closed")]
    Closed,

    /// An outbound message could not be written in the configured format.
    #[error("cannot encode message: {0}")]
    Encode(EncodeError),
}

/// Errors returned by the engine, client, and server.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A flow failed.
    #[error("flow {id}: {source}")]
    Flow {
        /// Flow that failed.
        id: FlowId,
        /// What went wrong.
        #[source]
        source: FlowError,
    },

    /// No live flow has this id.
    #[error("unknown flow {0}")]
    UnknownFlow(FlowId),

    /// An envelope could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// An envelope could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The transport shut down; no further messages can be exchanged.
    #[error("transport closed")]
    TransportClosed,

    /// Configuration is unusable.
    #[error("invalid config: {0}")]
    Config(String),

    /// Configuration file could not be parsed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// I/O error from a transport or configuration file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps a [`FlowError`] with the id of the flow it concerns.
    pub fn flow(id: &FlowId, source: FlowError) -> Self {
        Self::Flow {
            id: id.clone(),
            source,
        }
    }
}
