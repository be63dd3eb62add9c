//! weir-store — content-addressed chunk storage with request coalescing.
//!
//! A chunk is a content-addressed blob: its key is the BLAKE3 hash of its
//! payload. The store's distinguishing capability is
//! `get_or_create_request`: an atomic lookup-or-placeholder operation that
//! lets any number of concurrent requesters share ONE in-flight retrieval
//! per key, all waking on the same [`Pending`] signal once the data lands.
//!
//! Two backends: [`MemoryStore`] for tests and embedding,
//! [`DiskStore`] for a persistent content-addressed tree.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use weir_core::ChunkKey;

pub mod disk;
pub mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

// ── Pending signal ────────────────────────────────────────────────────────────

/// One-shot broadcast attached to a placeholder chunk.
///
/// Exactly one task fires it — after the store write has completed — and
/// every waiter observes the fire, no matter when it subscribed. Cloning is
/// cheap; clones observe the same signal.
#[derive(Clone, Debug)]
pub struct Pending {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl Pending {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Fire the signal. Idempotent; later calls are no-ops.
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as self, so wait_for cannot fail here.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Pending {
    fn default() -> Self {
        Self::new()
    }
}

// ── Chunk ─────────────────────────────────────────────────────────────────────

/// A content-addressed chunk, or the placeholder standing in for one.
///
/// Exactly one of the two optionals is populated: a stored chunk has
/// `data` and no `pending`; a placeholder has `pending` and no `data`.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub key: ChunkKey,
    pub data: Option<Bytes>,
    pub pending: Option<Pending>,
}

impl Chunk {
    pub fn stored(key: ChunkKey, data: Bytes) -> Self {
        Self {
            key,
            data: Some(data),
            pending: None,
        }
    }

    pub fn placeholder(key: ChunkKey, pending: Pending) -> Self {
        Self {
            key,
            data: None,
            pending: Some(pending),
        }
    }
}

// ── Store trait ───────────────────────────────────────────────────────────────

/// Errors from the chunk store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("chunk store i/o at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("stored chunk {0} failed verification")]
    Corrupt(ChunkKey),
}

/// Content-addressed chunk storage with request coalescing.
///
/// Implementations must be internally concurrency-safe;
/// `get_or_create_request` in particular must be atomic — a concurrent
/// lookup+insert for the same key must resolve to a single placeholder.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Look up a chunk. Returns the stored chunk, the current placeholder
    /// if a request is in flight, or `None`.
    async fn get(&self, key: &ChunkKey) -> Result<Option<Chunk>, StoreError>;

    /// Store a chunk's payload. Idempotent for identical content.
    async fn put(&self, key: &ChunkKey, data: Bytes) -> Result<(), StoreError>;

    /// Atomic lookup-or-placeholder:
    /// - present with data → `(chunk, false)` and no pending;
    /// - absent → fresh placeholder with a new pending, `(placeholder, true)`;
    /// - request already in flight → the existing placeholder, `(placeholder, false)`.
    async fn get_or_create_request(&self, key: &ChunkKey) -> Result<(Chunk, bool), StoreError>;

    /// Complete an in-flight request: write the payload, THEN fire the
    /// pending signal. Waiters must never observe the fire before the data
    /// is readable.
    async fn fulfill(&self, key: &ChunkKey, data: Bytes) -> Result<(), StoreError>;

    /// Whether the store holds actual data (not a placeholder) for the key.
    async fn has(&self, key: &ChunkKey) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_wakes_late_and_early_waiters() {
        let pending = Pending::new();
        let early = {
            let p = pending.clone();
            tokio::spawn(async move { p.wait().await })
        };
        tokio::task::yield_now().await;
        pending.fire();
        early.await.unwrap();
        // a waiter subscribing after the fire returns immediately
        pending.wait().await;
        assert!(pending.is_fired());
    }

    #[tokio::test]
    async fn pending_fire_is_idempotent() {
        let pending = Pending::new();
        pending.fire();
        pending.fire();
        pending.wait().await;
    }
}
