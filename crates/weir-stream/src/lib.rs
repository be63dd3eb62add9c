//! weir-stream — the per-peer content streaming core.
//!
//! A [`Streamer`] negotiates, in both directions, the transfer of batches
//! of content-addressed chunks over established overlay connections, with
//! signed handover/takeover accounting: named, typed, prioritized streams
//! multiplexed over one peer link, interval bookkeeping so gaps in
//! historical ranges get filled, priority-ordered egress under bounded
//! queue capacity, and coalescing of concurrent in-flight retrievals.
//!
//! The overlay (routing), the peer links (framing, transport security),
//! and the chunk store are consumed through the traits in [`overlay`] and
//! `weir_store` — this crate opens no sockets of its own.

pub mod bitvector;
pub mod error;
pub mod intervals;
pub mod metrics;
pub mod overlay;
pub mod peer;
pub mod priority;
pub mod registry;
pub mod retrieve;
pub mod stream;

pub use bitvector::BitVector;
pub use error::StreamError;
pub use intervals::Intervals;
pub use metrics::{CountersSnapshot, EngineSnapshot};
pub use overlay::{proximity, LinkClosed, Overlay, PeerId, PeerLink};
pub use peer::StreamPeer;
pub use priority::{Priority, PriorityQueue, PRIORITY_LEVELS};
pub use registry::{IncomingCtor, OutgoingCtor, Streamer};
pub use retrieve::RETRIEVE_REQUEST;
pub use stream::{Batch, ChunkWait, Finalizer, IncomingStream, OutgoingStream, StreamKey};

pub use weir_core::wire::HASH_SIZE;
