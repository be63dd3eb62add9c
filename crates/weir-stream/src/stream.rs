//! Pluggable stream-type interfaces.
//!
//! A stream is a named, ordered sequence of hashes one peer (upstream)
//! produces for another (downstream). The `name` selects how hashes are
//! generated; the `key` is a type-specific sub-selector. The engine speaks
//! the batch protocol; these traits are where a stream type plugs in its
//! own hash source and chunk bookkeeping.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use weir_core::wire::{HandoverProof, TakeoverProof, HASH_SIZE};
use weir_core::ChunkKey;
use weir_store::Chunk;

use crate::error::StreamError;

/// Instance key of a stream on one peer: `name` + type-specific `key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub name: String,
    pub key: Bytes,
}

impl StreamKey {
    pub fn new(name: &str, key: &[u8]) -> Self {
        Self {
            name: name.to_owned(),
            key: Bytes::copy_from_slice(key),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.name, hex::encode(&self.key))
        }
    }
}

/// A contiguous stream section, ready to offer: `hashes` is the
/// concatenation of the section's content hashes.
#[derive(Debug, Clone)]
pub struct Batch {
    pub hashes: Bytes,
    pub from: u64,
    pub to: u64,
    pub proof: Option<HandoverProof>,
}

impl Batch {
    pub fn hash_count(&self) -> usize {
        self.hashes.len() / HASH_SIZE
    }

    /// The i-th hash of the batch. Panics past `hash_count`.
    pub fn hash_at(&self, i: usize) -> ChunkKey {
        ChunkKey::from_slice(&self.hashes[i * HASH_SIZE..(i + 1) * HASH_SIZE])
            .expect("hash slice is HASH_SIZE bytes")
    }
}

/// Future resolving once a wanted chunk has arrived and been stored.
pub type ChunkWait = BoxFuture<'static, ()>;

/// Deferred takeover signing, produced by [`IncomingStream::batch_done`]
/// and invoked once the whole batch has landed.
pub type Finalizer = Box<dyn FnOnce() -> Result<TakeoverProof, StreamError> + Send>;

/// The upstream side of a stream on this peer.
#[async_trait]
pub trait OutgoingStream: Send + Sync {
    /// Produce the next contiguous batch within `[from, to]` (`to == 0`
    /// means open-ended), adjusting the range as needed. May await
    /// indefinitely in live mode — the engine always calls this from a
    /// dedicated task, never the dispatcher. `None` means the stream has
    /// nothing more to offer.
    async fn set_next_batch(&self, from: u64, to: u64) -> Result<Option<Batch>, StreamError>;

    /// Fetch the payload for an offered hash. `None` is a protocol breach:
    /// the upstream must not offer what it cannot serve.
    async fn get_data(&self, key: &ChunkKey) -> Option<Bytes>;

    /// The retrieve stream type's hook: where request handling should push
    /// chunks that are ready to be offered. Other types leave this `None`.
    fn delivery_sink(&self) -> Option<mpsc::Sender<Chunk>> {
        None
    }
}

/// The downstream side of a stream on this peer.
#[async_trait]
pub trait IncomingStream: Send + Sync {
    /// Decide whether an offered hash is needed. `None` when the data is
    /// already present; otherwise register interest and return a wait that
    /// resolves when the chunk has arrived and been stored.
    async fn need_data(&self, key: &ChunkKey) -> Option<ChunkWait>;

    /// Called once every wait of the batch has resolved. The finalizer,
    /// when invoked, produces the signed takeover proof closing the batch.
    fn batch_done(
        &self,
        stream: &StreamKey,
        from: u64,
        hashes: &[u8],
        root: &[u8; 32],
    ) -> Option<Finalizer>;
}
