//! Streaming subsystem errors.

use thiserror::Error;

use weir_core::ChunkKey;
use weir_store::StoreError;

use crate::overlay::PeerId;
use crate::priority::Priority;

/// Errors surfaced by the streaming core.
///
/// Protocol-message handlers return these to the dispatcher, which logs and
/// keeps the peer running — a single bad message must not tear down the
/// link. Background tasks log and exit silently instead.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream '{0}' not registered")]
    UnknownStream(String),

    #[error("stream '{0}' already registered")]
    DuplicateStream(String),

    #[error("peer {0} not found")]
    UnknownPeer(PeerId),

    #[error("malformed batch: {0}")]
    MalformedBatch(String),

    #[error("offered chunk {0} not found")]
    DataMissing(ChunkKey),

    #[error("unsolicited delivery of chunk {0}")]
    Unsolicited(ChunkKey),

    #[error("priority queue level {0:?} is full")]
    QueueFull(Priority),

    #[error("unknown priority byte 0x{0:02x}")]
    UnknownPriority(u8),

    #[error("invalid takeover signature for stream '{0}'")]
    BadProof(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("retrieve timed out for chunk {0}")]
    Timeout(ChunkKey),

    #[error("peer shutting down")]
    Cancelled,
}
