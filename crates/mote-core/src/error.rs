//! Error types for the core state machines.

use mote_proto::{ProtocolError, ResourcePath};
use thiserror::Error;

use crate::transport::SessionId;

/// Errors from the transaction store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// The request could not be serialized.
    #[error("request encoding failed: {0}")]
    Encode(#[from] ProtocolError),

    /// Every message ID is already outstanding towards this peer.
    #[error("no free message id towards {0}")]
    MessageIdsExhausted(SessionId),
}

/// Errors from block-wise transfer reassembly.
///
/// Every variant discards the transfer it was raised for.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    /// Block number is neither the expected one nor a duplicate of the last.
    #[error("unexpected block {actual}, expected {expected}")]
    UnexpectedBlock {
        /// Next block number the transfer was waiting for.
        expected: u32,
        /// Block number received.
        actual: u32,
    },

    /// Block size is not a power of two within the configured bounds.
    #[error("unsupported block size {0}")]
    InvalidSize(u16),

    /// Block size changed in the middle of a transfer.
    #[error("block size changed from {from} to {to}")]
    SizeChanged {
        /// Size negotiated by the first block.
        from: u16,
        /// Size of the offending block.
        to: u16,
    },

    /// A block carried more than the negotiated size.
    #[error("block of {len} bytes exceeds size {size}")]
    OversizedBlock {
        /// Payload length.
        len: usize,
        /// Negotiated block size.
        size: u16,
    },

    /// The body grew beyond the configured limit.
    #[error("transfer exceeds {limit} bytes")]
    TooLarge {
        /// Configured maximum.
        limit: usize,
    },
}

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A configuration value is out of range.
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// At least one server account is required.
    #[error("no server accounts configured")]
    NoAccounts,

    /// Two accounts share a short server id.
    #[error("duplicate short server id {0}")]
    DuplicateShortId(u16),

    /// `configure` was already called.
    #[error("engine already configured")]
    AlreadyConfigured,

    /// An operation requires `configure` to have been called first.
    #[error("engine not configured")]
    NotConfigured,
}

/// Errors reported by a [`crate::storage::ResourceStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No object, instance or resource at this path.
    #[error("{0} not found")]
    NotFound(ResourcePath),

    /// The operation is not supported on this path.
    #[error("operation not allowed on {0}")]
    MethodNotAllowed(ResourcePath),

    /// The written value is unusable.
    #[error("bad value for {path}: {reason}")]
    BadValue {
        /// Target path.
        path: ResourcePath,
        /// Why the value was rejected.
        reason: String,
    },

    /// Any other store failure.
    #[error("store failure: {0}")]
    Internal(String),
}

/// Errors reported by a [`crate::transport::Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The URI could not be parsed or resolved.
    #[error("invalid server uri {0}")]
    InvalidUri(String),

    /// The session handle is not open.
    #[error("{0} is not open")]
    UnknownSession(SessionId),

    /// The peer is currently unreachable.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// Underlying socket error.
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
}
