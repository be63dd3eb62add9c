//! The retrieve-request stream type.
//!
//! Every peer is auto-subscribed to this stream at Top priority, live, so
//! chunk retrieval rides the ordinary batch protocol: request handling
//! pushes ready chunks into the outgoing side's delivery channel, whose
//! `set_next_batch` folds them into offers; the incoming side coalesces
//! every offered hash onto the store's shared pending signal, so one
//! in-flight fetch serves any number of local requesters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, Mutex};

use weir_core::crypto::{batch_root, Keypair};
use weir_core::wire::Handover;
use weir_core::ChunkKey;
use weir_store::{Chunk, ChunkStore};

use crate::error::StreamError;
use crate::registry::Streamer;
use crate::stream::{Batch, ChunkWait, Finalizer, IncomingStream, OutgoingStream, StreamKey};

/// Name of the retrieve-request stream.
pub const RETRIEVE_REQUEST: &str = "RETRIEVE_REQUEST";

/// Install the retrieve-request constructors on a streamer.
pub(crate) fn register(streamer: &Arc<Streamer>) {
    let keypair = streamer.keypair();
    let depth = streamer.config().delivery_batch_depth.max(1);
    streamer.register_outgoing(
        RETRIEVE_REQUEST,
        Box::new(move |peer, _key| {
            Ok(Arc::new(RetrieveOutgoing::new(peer.store(), keypair.clone(), depth))
                as Arc<dyn OutgoingStream>)
        }),
    );
    streamer.register_incoming(
        RETRIEVE_REQUEST,
        Box::new(|peer, _key| {
            Ok(Arc::new(RetrieveIncoming::new(peer.store())) as Arc<dyn IncomingStream>)
        }),
    );
}

/// Upstream side: offers whatever request handling has made deliverable.
pub struct RetrieveOutgoing {
    store: Arc<dyn ChunkStore>,
    delivery_tx: mpsc::Sender<Chunk>,
    delivery_rx: Mutex<mpsc::Receiver<Chunk>>,
    /// Synthetic stream position of the next offered hash. Retrieve offers
    /// have no database index, so positions just count offered chunks.
    pos: AtomicU64,
    keypair: Arc<Keypair>,
    batch_depth: usize,
}

impl RetrieveOutgoing {
    fn new(store: Arc<dyn ChunkStore>, keypair: Arc<Keypair>, batch_depth: usize) -> Self {
        let (delivery_tx, delivery_rx) = mpsc::channel(batch_depth.max(1));
        Self {
            store,
            delivery_tx,
            delivery_rx: Mutex::new(delivery_rx),
            pos: AtomicU64::new(0),
            keypair,
            batch_depth,
        }
    }
}

#[async_trait]
impl OutgoingStream for RetrieveOutgoing {
    async fn set_next_batch(&self, _from: u64, _to: u64) -> Result<Option<Batch>, StreamError> {
        // live: block until request handling makes a chunk deliverable,
        // then sweep up whatever else is already waiting
        let mut rx = self.delivery_rx.lock().await;
        let Some(first) = rx.recv().await else {
            return Ok(None);
        };
        let mut hashes = BytesMut::with_capacity(self.batch_depth * 32);
        hashes.extend_from_slice(first.key.as_bytes());
        let mut count = 1u64;
        while (count as usize) < self.batch_depth {
            match rx.try_recv() {
                Ok(chunk) => {
                    hashes.extend_from_slice(chunk.key.as_bytes());
                    count += 1;
                }
                Err(_) => break,
            }
        }
        drop(rx);

        let hashes = hashes.freeze();
        let from = self.pos.fetch_add(count, Ordering::Relaxed);
        let to = from + count - 1;
        let handover = Handover {
            stream: RETRIEVE_REQUEST.to_owned(),
            key: Vec::new(),
            start: from,
            end: to,
            root: batch_root(&hashes),
        };
        let proof = self.keypair.sign_handover(&handover);
        Ok(Some(Batch {
            hashes,
            from,
            to,
            proof: Some(proof),
        }))
    }

    async fn get_data(&self, key: &ChunkKey) -> Option<Bytes> {
        self.store.get(key).await.ok().flatten().and_then(|c| c.data)
    }

    fn delivery_sink(&self) -> Option<mpsc::Sender<Chunk>> {
        Some(self.delivery_tx.clone())
    }
}

/// Downstream side: wants every offered hash it does not hold, waiting on
/// the store's shared pending so concurrent interest coalesces.
pub struct RetrieveIncoming {
    store: Arc<dyn ChunkStore>,
}

impl RetrieveIncoming {
    fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl IncomingStream for RetrieveIncoming {
    async fn need_data(&self, key: &ChunkKey) -> Option<ChunkWait> {
        match self.store.get_or_create_request(key).await {
            Ok((chunk, _created)) => {
                // a placeholder means the data is wanted — whether we just
                // registered the interest or are joining an earlier request
                let pending = chunk.pending?;
                Some(Box::pin(async move { pending.wait().await }))
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "store probe failed, skipping hash");
                None
            }
        }
    }

    fn batch_done(
        &self,
        _stream: &StreamKey,
        _from: u64,
        _hashes: &[u8],
        _root: &[u8; 32],
    ) -> Option<Finalizer> {
        // retrieve traffic carries no takeover accounting
        None
    }
}
