//! The Streamer engine: stream-type registry, global peer table, peer
//! lifecycle, and the receive-and-store loop.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use weir_core::config::StreamConfig;
use weir_core::crypto::Keypair;
use weir_core::wire::{ChunkDeliveryMsg, Message, RetrieveRequestMsg, SubscribeMsg};
use weir_core::ChunkKey;
use weir_store::ChunkStore;

use crate::error::StreamError;
use crate::metrics::{EngineCounters, EngineSnapshot};
use crate::overlay::{Overlay, PeerId, PeerLink};
use crate::peer::StreamPeer;
use crate::priority::Priority;
use crate::retrieve;
use crate::stream::{IncomingStream, OutgoingStream, StreamKey};

/// Constructor building a per-peer outgoing handler for a stream type.
pub type OutgoingCtor =
    Box<dyn Fn(&Arc<StreamPeer>, &[u8]) -> Result<Arc<dyn OutgoingStream>, StreamError> + Send + Sync>;

/// Constructor building a per-peer incoming handler for a stream type.
pub type IncomingCtor =
    Box<dyn Fn(&Arc<StreamPeer>, &[u8]) -> Result<Arc<dyn IncomingStream>, StreamError> + Send + Sync>;

/// Registry and engine for the streaming protocol.
///
/// One instance per node. Holds the stream-type constructor maps, the
/// per-peer state table, and the receive loop that writes delivered chunks
/// to the chunk store and wakes their waiters.
pub struct Streamer {
    outgoing: RwLock<HashMap<String, OutgoingCtor>>,
    incoming: RwLock<HashMap<String, IncomingCtor>>,
    peers: DashMap<PeerId, Arc<StreamPeer>>,
    overlay: Arc<dyn Overlay>,
    store: Arc<dyn ChunkStore>,
    keypair: Arc<Keypair>,
    config: StreamConfig,
    receive_tx: mpsc::Sender<ChunkDeliveryMsg>,
    counters: EngineCounters,
}

impl Streamer {
    /// Build the engine and start its receive loop. Must be called from
    /// within a tokio runtime.
    pub fn new(
        overlay: Arc<dyn Overlay>,
        store: Arc<dyn ChunkStore>,
        keypair: Keypair,
        config: StreamConfig,
    ) -> Arc<Self> {
        let (receive_tx, receive_rx) = mpsc::channel(config.receive_depth.max(1));
        let streamer = Arc::new(Self {
            outgoing: RwLock::new(HashMap::new()),
            incoming: RwLock::new(HashMap::new()),
            peers: DashMap::new(),
            overlay,
            store,
            keypair: Arc::new(keypair),
            config,
            receive_tx,
            counters: EngineCounters::default(),
        });
        retrieve::register(&streamer);

        let engine = streamer.clone();
        tokio::spawn(async move {
            engine.process_received(receive_rx).await;
        });

        streamer
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub(crate) fn keypair(&self) -> Arc<Keypair> {
        self.keypair.clone()
    }

    pub fn store(&self) -> Arc<dyn ChunkStore> {
        self.store.clone()
    }

    pub(crate) fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    /// Engine-level counters snapshot.
    pub fn engine_counters(&self) -> EngineSnapshot {
        self.counters.snapshot()
    }

    // ── Stream type registry ─────────────────────────────────────────────────

    /// Install an outgoing (upstream-side) constructor for a stream type.
    pub fn register_outgoing(&self, name: &str, ctor: OutgoingCtor) {
        self.outgoing.write().insert(name.to_owned(), ctor);
    }

    /// Install an incoming (downstream-side) constructor for a stream type.
    pub fn register_incoming(&self, name: &str, ctor: IncomingCtor) {
        self.incoming.write().insert(name.to_owned(), ctor);
    }

    pub(crate) fn build_outgoing(
        &self,
        peer: &Arc<StreamPeer>,
        name: &str,
        key: &[u8],
    ) -> Result<Arc<dyn OutgoingStream>, StreamError> {
        let registry = self.outgoing.read();
        let ctor = registry
            .get(name)
            .ok_or_else(|| StreamError::UnknownStream(name.to_owned()))?;
        ctor(peer, key)
    }

    pub(crate) fn build_incoming(
        &self,
        peer: &Arc<StreamPeer>,
        name: &str,
        key: &[u8],
    ) -> Result<Arc<dyn IncomingStream>, StreamError> {
        let registry = self.incoming.read();
        let ctor = registry
            .get(name)
            .ok_or_else(|| StreamError::UnknownStream(name.to_owned()))?;
        ctor(peer, key)
    }

    // ── Peer table ───────────────────────────────────────────────────────────

    pub fn peer(&self, id: &PeerId) -> Option<Arc<StreamPeer>> {
        self.peers.get(id).map(|entry| entry.value().clone())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    // ── Subscribe ────────────────────────────────────────────────────────────

    /// Become the downstream of `stream`/`key` on `peer_id`: install the
    /// incoming handler and ask the peer to start offering `[from, to]`.
    pub fn subscribe(
        &self,
        peer_id: PeerId,
        stream: &str,
        key: &[u8],
        from: u64,
        to: u64,
        priority: Priority,
        live: bool,
    ) -> Result<(), StreamError> {
        if !self.incoming.read().contains_key(stream) {
            return Err(StreamError::UnknownStream(stream.to_owned()));
        }
        let peer = self.peer(&peer_id).ok_or(StreamError::UnknownPeer(peer_id))?;
        let handler = self.build_incoming(&peer, stream, key)?;

        // live sessions discover their cutoff from the first offer;
        // historical ones walk toward the subscription's upper bound
        let session_at = if live { 0 } else { to };
        let skey = StreamKey::new(stream, key);
        peer.register_incoming_entry(skey, handler, priority, live, session_at)?;

        peer.send_priority(
            Message::Subscribe(SubscribeMsg {
                stream: stream.to_owned(),
                key: key.to_vec(),
                from,
                to,
                priority: priority as u8,
            }),
            priority,
        )?;
        tracing::debug!(peer = %peer_id, stream, from, to, live, "subscribed");
        Ok(())
    }

    // ── Retrieve ─────────────────────────────────────────────────────────────

    /// Coalesced local fetch: at most one outbound request per key is in
    /// flight per node; every concurrent caller wakes on the same signal.
    pub async fn retrieve(&self, key: &ChunkKey) -> Result<Bytes, StreamError> {
        let (chunk, created) = self.store.get_or_create_request(key).await?;
        if let Some(data) = chunk.data {
            return Ok(data);
        }
        let Some(pending) = chunk.pending else {
            // the data raced in between the two arms; read it back
            return self.read_stored(key).await;
        };

        if created {
            self.broadcast_request(key);
        }

        tokio::select! {
            _ = pending.wait() => {}
            _ = tokio::time::sleep(self.config.retrieve_timeout()) => {
                return Err(StreamError::Timeout(*key));
            }
        }
        self.read_stored(key).await
    }

    async fn read_stored(&self, key: &ChunkKey) -> Result<Bytes, StreamError> {
        match self.store.get(key).await? {
            Some(chunk) => chunk.data.ok_or(StreamError::Timeout(*key)),
            None => Err(StreamError::Timeout(*key)),
        }
    }

    /// Walk the overlay toward `key` and ask the nearest connected peer.
    /// Fan-out is one: the walk stops at the first peer that takes the
    /// request. Widening the fan-out is a local policy change here.
    pub fn broadcast_request(&self, key: &ChunkKey) {
        self.overlay.each_conn(key, 255, &mut |peer_id, po, _nearest| {
            let Some(peer) = self.peer(&peer_id) else {
                return true; // not streaming with this peer, keep walking
            };
            match peer.send_priority(
                Message::RetrieveRequest(RetrieveRequestMsg { key: *key }),
                Priority::Top,
            ) {
                Ok(()) => {
                    tracing::trace!(peer = %peer_id, po, key = %key, "retrieve request sent");
                    false
                }
                Err(err) => {
                    tracing::warn!(peer = %peer_id, key = %key, error = %err, "retrieve request push failed");
                    true
                }
            }
        });
    }

    // ── Peer lifecycle ───────────────────────────────────────────────────────

    /// Run the streaming protocol against one peer link until the link
    /// closes or the peer is shut down. Registers the peer in the global
    /// table, auto-subscribes the retrieve-request stream, dispatches
    /// decoded inbound messages serially, and cleans up on exit.
    pub async fn run(
        self: &Arc<Self>,
        link: Arc<dyn PeerLink>,
        mut inbound: mpsc::Receiver<Message>,
    ) -> Result<(), StreamError> {
        let id = link.id();
        let peer = StreamPeer::new(link, self.store.clone(), self.config.queue_capacity);
        self.peers.insert(id, peer.clone());
        tracing::debug!(peer = %id, "peer registered");

        if let Err(err) = self.subscribe(
            id,
            retrieve::RETRIEVE_REQUEST,
            &[],
            0,
            0,
            Priority::Top,
            true,
        ) {
            tracing::warn!(peer = %id, error = %err, "retrieve auto-subscribe failed");
        }

        let quit = peer.quit_token();
        loop {
            tokio::select! {
                _ = quit.cancelled() => break,
                msg = inbound.recv() => match msg {
                    None => break,
                    Some(msg) => {
                        // one bad message must not tear down the peer
                        if let Err(err) = peer.handle_msg(self, msg).await {
                            tracing::warn!(peer = %id, error = %err, "message handling failed");
                        }
                    }
                },
            }
        }

        peer.shutdown();
        self.peers.remove(&id);
        tracing::debug!(peer = %id, "peer deregistered");
        Ok(())
    }

    // ── Receive loop ─────────────────────────────────────────────────────────

    pub(crate) async fn forward_delivery(&self, msg: ChunkDeliveryMsg) {
        if self.receive_tx.send(msg).await.is_err() {
            tracing::warn!("receive loop gone, delivery dropped");
        }
    }

    /// One per engine: writes delivered chunks to the chunk store, THEN
    /// fires their pending signals. The ordering is what lets a woken
    /// waiter read its data unconditionally.
    async fn process_received(self: Arc<Self>, mut receive_rx: mpsc::Receiver<ChunkDeliveryMsg>) {
        while let Some(req) = receive_rx.recv().await {
            match self.store.get(&req.key).await {
                Ok(Some(chunk)) => {
                    if chunk.data.is_some() {
                        self.counters
                            .duplicate_deliveries
                            .fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    if let Err(err) = self.store.fulfill(&req.key, Bytes::from(req.data)).await {
                        tracing::warn!(key = %req.key, error = %err, "chunk store write failed");
                        continue;
                    }
                    self.counters.chunks_received.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(key = %req.key, "chunk stored, waiters woken");
                }
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(key = %req.key, error = %err, "store lookup failed");
                }
            }
        }
    }
}
