//! Per-peer streamer state and the protocol message handlers.
//!
//! One `StreamPeer` exists per overlay connection. It owns the two stream
//! maps (outgoing = we are upstream, incoming = we are downstream), the
//! priority egress queue, and the quit token every background task of this
//! peer watches. The inbound dispatcher processes decoded messages
//! serially; handlers therefore never await network or storage completion
//! inline — anything that waits is spawned.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use weir_core::wire::{
    ChunkDeliveryMsg, Message, SubscribeMsg, TakeoverProof, UnsyncedKeysMsg, WantedKeysMsg,
    HASH_SIZE,
};
use weir_core::ChunkKey;
use weir_store::ChunkStore;

use crate::bitvector::BitVector;
use crate::error::StreamError;
use crate::intervals::Intervals;
use crate::metrics::{CountersSnapshot, StreamCounters};
use crate::overlay::{PeerId, PeerLink};
use crate::priority::{Priority, PriorityQueue, PushError};
use crate::registry::Streamer;
use crate::retrieve;
use crate::stream::{ChunkWait, IncomingStream, OutgoingStream, StreamKey};

/// State of one stream we are upstream for.
pub struct OutgoingEntry {
    pub(crate) handler: Arc<dyn OutgoingStream>,
    pub(crate) priority: Priority,
    /// Hashes of the most recently offered batch, kept to answer the
    /// subsequent WantedKeys.
    current_batch: Mutex<bytes::Bytes>,
    /// Strongest takeover proof received for this stream.
    takeover: Mutex<Option<TakeoverProof>>,
    pub(crate) counters: StreamCounters,
}

/// State of one stream we are downstream for.
pub struct IncomingEntry {
    pub(crate) handler: Arc<dyn IncomingStream>,
    pub(crate) priority: Priority,
    pub(crate) live: bool,
    sync: Mutex<SyncState>,
    /// Single-slot gate: a WantedKeys for batch N+1 may only go out once
    /// batch N has fully landed. Seeded with one permit at registration so
    /// the first offer can be answered.
    next: Semaphore,
    pub(crate) counters: StreamCounters,
}

struct SyncState {
    intervals: Intervals,
    /// Stream position when the subscription began. For live streams this
    /// tracks the upstream's last-offered `from`; for historical streams it
    /// is the fixed cutoff gap-filling walks toward.
    session_at: u64,
}

impl IncomingEntry {
    /// Completed ranges, for inspection.
    pub fn intervals(&self) -> Intervals {
        self.sync.lock().intervals.clone()
    }

    pub fn session_at(&self) -> u64 {
        self.sync.lock().session_at
    }
}

/// The peer extension for the streaming protocol.
pub struct StreamPeer {
    id: PeerId,
    link: Arc<dyn PeerLink>,
    store: Arc<dyn ChunkStore>,
    pq: PriorityQueue<Message>,
    outgoing: RwLock<HashMap<StreamKey, Arc<OutgoingEntry>>>,
    incoming: RwLock<HashMap<StreamKey, Arc<IncomingEntry>>>,
    quit: CancellationToken,
}

impl StreamPeer {
    pub(crate) fn new(
        link: Arc<dyn PeerLink>,
        store: Arc<dyn ChunkStore>,
        queue_capacity: usize,
    ) -> Arc<Self> {
        let (pq, worker) = PriorityQueue::new(queue_capacity);
        let quit = CancellationToken::new();

        let peer = Arc::new(Self {
            id: link.id(),
            link: link.clone(),
            store,
            pq,
            outgoing: RwLock::new(HashMap::new()),
            incoming: RwLock::new(HashMap::new()),
            quit: quit.clone(),
        });

        // Egress drainer: one task per peer, dies with the quit token.
        let worker_cancel = quit.child_token();
        tokio::spawn(async move {
            worker
                .run(worker_cancel, move |msg: Message| {
                    let link = link.clone();
                    async move {
                        if let Err(err) = link.send(msg).await {
                            tracing::warn!(error = %err, "peer send failed");
                        }
                    }
                })
                .await;
        });

        peer
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub(crate) fn store(&self) -> Arc<dyn ChunkStore> {
        self.store.clone()
    }

    /// A clone of this peer's quit token, for tasks that must die with it.
    pub fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    /// Signal termination: stops the egress worker, watchers, and gated
    /// senders. Queued outbound messages are discarded.
    pub fn shutdown(&self) {
        self.quit.cancel();
    }

    /// Enqueue a message on the egress queue at the given priority.
    pub fn send_priority(&self, msg: Message, prio: Priority) -> Result<(), StreamError> {
        self.pq.push(msg, prio).map_err(|err| match err {
            PushError::Full(level) => StreamError::QueueFull(level),
            PushError::Closed | PushError::Cancelled => StreamError::Cancelled,
        })
    }

    // ── Stream registration ──────────────────────────────────────────────────

    pub(crate) fn register_outgoing_entry(
        &self,
        key: StreamKey,
        handler: Arc<dyn OutgoingStream>,
        priority: Priority,
    ) -> Result<Arc<OutgoingEntry>, StreamError> {
        let mut outgoing = self.outgoing.write();
        if outgoing.contains_key(&key) {
            return Err(StreamError::DuplicateStream(key.to_string()));
        }
        let entry = Arc::new(OutgoingEntry {
            handler,
            priority,
            current_batch: Mutex::new(bytes::Bytes::new()),
            takeover: Mutex::new(None),
            counters: StreamCounters::default(),
        });
        outgoing.insert(key, entry.clone());
        Ok(entry)
    }

    pub(crate) fn register_incoming_entry(
        &self,
        key: StreamKey,
        handler: Arc<dyn IncomingStream>,
        priority: Priority,
        live: bool,
        session_at: u64,
    ) -> Result<Arc<IncomingEntry>, StreamError> {
        let mut incoming = self.incoming.write();
        if incoming.contains_key(&key) {
            return Err(StreamError::DuplicateStream(key.to_string()));
        }
        let entry = Arc::new(IncomingEntry {
            handler,
            priority,
            live,
            sync: Mutex::new(SyncState {
                intervals: Intervals::new(),
                session_at,
            }),
            // one permit up front: the first UnsyncedKeys needs no prior batch
            next: Semaphore::new(1),
            counters: StreamCounters::default(),
        });
        incoming.insert(key, entry.clone());
        Ok(entry)
    }

    pub(crate) fn outgoing_entry(&self, key: &StreamKey) -> Result<Arc<OutgoingEntry>, StreamError> {
        self.outgoing
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StreamError::UnknownStream(key.to_string()))
    }

    pub(crate) fn incoming_entry(&self, key: &StreamKey) -> Result<Arc<IncomingEntry>, StreamError> {
        self.incoming
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StreamError::UnknownStream(key.to_string()))
    }

    /// Counters of an outgoing stream, when present.
    pub fn outgoing_counters(&self, key: &StreamKey) -> Option<CountersSnapshot> {
        self.outgoing.read().get(key).map(|e| e.counters.snapshot())
    }

    /// Counters of an incoming stream, when present.
    pub fn incoming_counters(&self, key: &StreamKey) -> Option<CountersSnapshot> {
        self.incoming.read().get(key).map(|e| e.counters.snapshot())
    }

    /// The strongest takeover proof received for an outgoing stream.
    pub fn takeover_proof(&self, key: &StreamKey) -> Option<TakeoverProof> {
        self.outgoing
            .read()
            .get(key)
            .and_then(|e| e.takeover.lock().clone())
    }

    /// Incoming entry accessor, for inspection.
    pub fn incoming_state(&self, key: &StreamKey) -> Option<Arc<IncomingEntry>> {
        self.incoming.read().get(key).cloned()
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Route one decoded message. Called serially by the peer's dispatch
    /// loop; errors are the dispatcher's to log, the peer keeps running.
    pub(crate) async fn handle_msg(
        self: &Arc<Self>,
        streamer: &Arc<Streamer>,
        msg: Message,
    ) -> Result<(), StreamError> {
        match msg {
            Message::Handshake(m) => {
                // negotiation belongs to the link layer
                tracing::debug!(peer = %self.id, version = m.version, "handshake observed");
                Ok(())
            }
            Message::Subscribe(m) => self.handle_subscribe(streamer, m),
            Message::UnsyncedKeys(m) => self.handle_unsynced_keys(m).await,
            Message::WantedKeys(m) => self.handle_wanted_keys(m).await,
            Message::TakeoverProof(m) => self.handle_takeover_proof(m),
            Message::RetrieveRequest(m) => self.handle_retrieve_request(streamer, m).await,
            Message::ChunkDelivery(m) => self.handle_chunk_delivery(streamer, m).await,
        }
    }

    // ── Subscribe ────────────────────────────────────────────────────────────

    /// The peer wants a stream section from us: build the outgoing handler
    /// and start offering. A duplicate subscription is ignored, not
    /// answered with an error — the stream is already being served.
    fn handle_subscribe(
        self: &Arc<Self>,
        streamer: &Arc<Streamer>,
        msg: SubscribeMsg,
    ) -> Result<(), StreamError> {
        let priority =
            Priority::try_from(msg.priority).map_err(|e| StreamError::UnknownPriority(e.0))?;
        let handler = streamer.build_outgoing(self, &msg.stream, &msg.key)?;
        let skey = StreamKey::new(&msg.stream, &msg.key);
        let entry = match self.register_outgoing_entry(skey.clone(), handler, priority) {
            Ok(entry) => entry,
            Err(StreamError::DuplicateStream(_)) => {
                tracing::debug!(peer = %self.id, stream = %skey, "duplicate subscription ignored");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        tracing::debug!(peer = %self.id, stream = %skey, ?priority, "peer subscribed");
        let peer = self.clone();
        tokio::spawn(async move {
            peer.send_unsynced_keys(&skey, &entry, msg.from, msg.to).await;
        });
        Ok(())
    }

    /// Produce and offer the next batch. Runs on its own task: in live mode
    /// the handler blocks until new hashes exist.
    pub(crate) async fn send_unsynced_keys(
        &self,
        skey: &StreamKey,
        entry: &Arc<OutgoingEntry>,
        from: u64,
        to: u64,
    ) {
        let batch = tokio::select! {
            _ = self.quit.cancelled() => return,
            next = entry.handler.set_next_batch(from, to) => match next {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    tracing::debug!(peer = %self.id, stream = %skey, "stream exhausted");
                    return;
                }
                Err(err) => {
                    tracing::warn!(peer = %self.id, stream = %skey, error = %err, "next batch failed");
                    return;
                }
            },
        };

        *entry.current_batch.lock() = batch.hashes.clone();
        entry.counters.batches_offered.fetch_add(1, Ordering::Relaxed);
        entry
            .counters
            .hashes_offered
            .fetch_add(batch.hash_count() as u64, Ordering::Relaxed);

        let msg = UnsyncedKeysMsg {
            stream: skey.name.clone(),
            key: skey.key.to_vec(),
            from: batch.from,
            to: batch.to,
            hashes: batch.hashes.to_vec(),
            handover: batch.proof,
        };
        tracing::trace!(peer = %self.id, %msg, "offering batch");
        if let Err(err) = self.send_priority(Message::UnsyncedKeys(msg), entry.priority) {
            tracing::warn!(peer = %self.id, stream = %skey, error = %err, "offer push failed");
        }
    }

    // ── UnsyncedKeys ─────────────────────────────────────────────────────────

    /// An upstream offer: decide which hashes we want, kick off the waits,
    /// and answer with the want mask and the next range — gated on the
    /// previous batch having fully landed.
    async fn handle_unsynced_keys(self: &Arc<Self>, msg: UnsyncedKeysMsg) -> Result<(), StreamError> {
        let skey = StreamKey::new(&msg.stream, &msg.key);
        let entry = self.incoming_entry(&skey)?;

        if msg.hashes.len() % HASH_SIZE != 0 {
            return Err(StreamError::MalformedBatch(format!(
                "ragged hash buffer: {} bytes",
                msg.hashes.len()
            )));
        }
        let count = msg.hashes.len() / HASH_SIZE;

        let mut want = BitVector::new(count);
        let mut waits: Vec<ChunkWait> = Vec::new();
        for i in 0..count {
            let key = ChunkKey::from_slice(&msg.hashes[i * HASH_SIZE..(i + 1) * HASH_SIZE])
                .expect("slice is HASH_SIZE bytes");
            if let Some(wait) = entry.handler.need_data(&key).await {
                want.set(i, true);
                waits.push(wait);
            }
        }
        entry
            .counters
            .hashes_wanted
            .fetch_add(waits.len() as u64, Ordering::Relaxed);

        // Aggregator: once every wanted chunk of THIS batch has landed,
        // close the batch with a takeover proof and open the gate for the
        // next WantedKeys. Quit aborts without signalling — no proof is
        // signed for a partial batch.
        {
            let peer = self.clone();
            let entry = entry.clone();
            let skey = skey.clone();
            let root = msg
                .handover
                .as_ref()
                .map(|p| p.handover.root)
                .unwrap_or_default();
            let hashes = msg.hashes.clone();
            let from = msg.from;
            tokio::spawn(async move {
                tokio::select! {
                    _ = peer.quit.cancelled() => return,
                    _ = futures::future::join_all(waits) => {}
                }
                if let Some(finalize) = entry.handler.batch_done(&skey, from, &hashes, &root) {
                    match finalize() {
                        Ok(proof) => {
                            entry.counters.takeovers_signed.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(peer = %peer.id, %proof, "takeover signed");
                            if let Err(err) = peer
                                .send_priority(Message::TakeoverProof(proof), entry.priority)
                            {
                                tracing::warn!(peer = %peer.id, error = %err, "takeover push failed");
                            }
                        }
                        Err(err) => {
                            tracing::warn!(peer = %peer.id, stream = %skey, error = %err, "takeover signing failed");
                        }
                    }
                }
                entry.next.add_permits(1);
            });
        }

        // Range bookkeeping. The hash count is authoritative for what was
        // offered; a ragged `to` cannot poison the interval set.
        let reply = {
            let mut sync = entry.sync.lock();
            if entry.live {
                sync.session_at = msg.from;
            }
            if count > 0 {
                sync.intervals.add(msg.from, msg.from + count as u64);
            }
            let (next_from, gap_end) = sync.intervals.next(msg.to);
            if entry.live {
                // a live gap is always open-ended: keep requesting, even
                // from position 0 of a stream yet to produce anything
                Some((next_from, 0))
            } else {
                let next_to = gap_end.map_or(sync.session_at, |end| end.min(sync.session_at));
                (next_from < next_to).then_some((next_from, next_to))
            }
        };

        let Some((next_from, next_to)) = reply else {
            tracing::debug!(peer = %self.id, stream = %skey, "range exhausted, no reply");
            return Ok(());
        };

        let wanted = WantedKeysMsg {
            stream: skey.name.clone(),
            key: skey.key.to_vec(),
            want: want.bytes().to_vec(),
            from: next_from,
            to: next_to,
        };

        // Gated sender: only after the previous batch has fully landed.
        let peer = self.clone();
        let gated = entry.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = peer.quit.cancelled() => {}
                permit = gated.next.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                        tracing::trace!(peer = %peer.id, msg = %wanted, "requesting keys");
                        if let Err(err) =
                            peer.send_priority(Message::WantedKeys(wanted), gated.priority)
                        {
                            tracing::warn!(peer = %peer.id, error = %err, "wanted keys push failed");
                        }
                    }
                }
            }
        });
        Ok(())
    }

    // ── WantedKeys ───────────────────────────────────────────────────────────

    /// The downstream's reply to our offer: start producing the next batch
    /// in parallel, then deliver exactly the wanted chunks of the current
    /// one.
    async fn handle_wanted_keys(self: &Arc<Self>, msg: WantedKeysMsg) -> Result<(), StreamError> {
        let skey = StreamKey::new(&msg.stream, &msg.key);
        let entry = self.outgoing_entry(&skey)?;

        // snapshot the batch this want mask was computed over before the
        // next one can overwrite it
        let current = entry.current_batch.lock().clone();

        // the next batch may block for new hashes — never the dispatcher's
        // problem
        {
            let peer = self.clone();
            let entry = entry.clone();
            let skey = skey.clone();
            let (from, to) = (msg.from, msg.to);
            tokio::spawn(async move {
                peer.send_unsynced_keys(&skey, &entry, from, to).await;
            });
        }
        let count = current.len() / HASH_SIZE;
        let want = BitVector::from_bytes(&msg.want, count).ok_or_else(|| {
            StreamError::MalformedBatch(format!(
                "want mask of {} bytes against {} offered hashes",
                msg.want.len(),
                count
            ))
        })?;

        for i in 0..count {
            if !want.get(i) {
                continue;
            }
            let key = ChunkKey::from_slice(&current[i * HASH_SIZE..(i + 1) * HASH_SIZE])
                .expect("slice is HASH_SIZE bytes");
            // An offered hash we cannot serve is fatal for the batch;
            // chunks already queued are unaffected.
            let data = entry
                .handler
                .get_data(&key)
                .await
                .ok_or(StreamError::DataMissing(key))?;
            self.send_priority(
                Message::ChunkDelivery(ChunkDeliveryMsg {
                    key,
                    data: data.to_vec(),
                    id: 0,
                }),
                entry.priority,
            )?;
            entry.counters.hashes_delivered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    // ── TakeoverProof ────────────────────────────────────────────────────────

    /// Downstream's signed acknowledgment. Keep the strongest proof per
    /// stream: the one reaching furthest, ties to the wider range.
    fn handle_takeover_proof(&self, msg: TakeoverProof) -> Result<(), StreamError> {
        let skey = StreamKey::new(&msg.takeover.stream, &msg.takeover.key);
        let entry = self.outgoing_entry(&skey)?;

        if let Some(public) = self.link.remote_public_key() {
            if !weir_core::crypto::verify_takeover(&msg, &public) {
                return Err(StreamError::BadProof(skey.to_string()));
            }
        }

        let mut strongest = entry.takeover.lock();
        let replace = match &*strongest {
            None => true,
            Some(old) => {
                msg.takeover.end > old.takeover.end
                    || (msg.takeover.end == old.takeover.end
                        && msg.takeover.start < old.takeover.start)
            }
        };
        if replace {
            tracing::debug!(peer = %self.id, proof = %msg, "takeover proof retained");
            *strongest = Some(msg);
        }
        Ok(())
    }

    // ── Retrieve request ─────────────────────────────────────────────────────

    /// A peer asks for a chunk. Served from the store when present;
    /// otherwise coalesced onto the (single) in-flight request, with a
    /// watcher that feeds the retrieve stream once the data lands.
    async fn handle_retrieve_request(
        self: &Arc<Self>,
        streamer: &Arc<Streamer>,
        msg: weir_core::wire::RetrieveRequestMsg,
    ) -> Result<(), StreamError> {
        let (chunk, created) = self.store.get_or_create_request(&msg.key).await?;
        let entry = self.outgoing_entry(&StreamKey::new(retrieve::RETRIEVE_REQUEST, &[]))?;
        let Some(sink) = entry.handler.delivery_sink() else {
            return Err(StreamError::UnknownStream(
                retrieve::RETRIEVE_REQUEST.to_owned(),
            ));
        };

        let Some(pending) = chunk.pending.clone() else {
            // already have the data: synthetic delivery straight into the
            // retrieve stream
            tokio::select! {
                _ = self.quit.cancelled() => {}
                _ = sink.send(chunk) => {}
            }
            return Ok(());
        };

        if created {
            streamer.broadcast_request(&msg.key);
        }

        // Watcher: chunk arrival feeds the stream; timeout and quit drop
        // silently.
        let peer = self.clone();
        let store = self.store.clone();
        let counters_entry = entry.clone();
        let timeout = streamer.config().retrieve_timeout();
        let key = msg.key;
        tokio::spawn(async move {
            tokio::select! {
                _ = peer.quit.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    counters_entry
                        .counters
                        .delivery_timeouts
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(peer = %peer.id, key = %key, "retrieve expired unanswered");
                }
                _ = pending.wait() => {
                    match store.get(&key).await {
                        Ok(Some(chunk)) if chunk.data.is_some() => {
                            let _ = sink.send(chunk).await;
                        }
                        Ok(_) => {
                            tracing::warn!(peer = %peer.id, key = %key, "fulfilled chunk missing from store");
                        }
                        Err(err) => {
                            tracing::warn!(peer = %peer.id, key = %key, error = %err, "store read failed");
                        }
                    }
                }
            }
        });
        Ok(())
    }

    // ── ChunkDelivery ────────────────────────────────────────────────────────

    /// A chunk payload arrived. Only deliveries with a matching placeholder
    /// (or stored chunk) are accepted; the actual store write happens in the
    /// engine's receive loop so waiters wake in order.
    async fn handle_chunk_delivery(
        &self,
        streamer: &Arc<Streamer>,
        msg: ChunkDeliveryMsg,
    ) -> Result<(), StreamError> {
        if self.store.get(&msg.key).await?.is_none() {
            streamer
                .counters()
                .unsolicited_deliveries
                .fetch_add(1, Ordering::Relaxed);
            return Err(StreamError::Unsolicited(msg.key));
        }
        tracing::trace!(peer = %self.id, key = %msg.key, bytes = msg.data.len(), "chunk delivered");
        streamer.forward_delivery(msg).await;
        Ok(())
    }
}
