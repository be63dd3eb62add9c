//! In-memory chunk store.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use weir_core::ChunkKey;

use crate::{Chunk, ChunkStore, Pending, StoreError};

#[derive(Debug)]
struct Slot {
    data: Option<Bytes>,
    pending: Option<Pending>,
}

/// Chunk store backed by a concurrent hash map. Placeholders and data share
/// one slot per key, so lookup-or-placeholder is a single entry operation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<ChunkKey, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with actual data stored.
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|e| e.value().data.is_some()).count()
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn get(&self, key: &ChunkKey) -> Result<Option<Chunk>, StoreError> {
        Ok(self.slots.get(key).map(|slot| match &slot.data {
            Some(data) => Chunk::stored(*key, data.clone()),
            None => Chunk {
                key: *key,
                data: None,
                pending: slot.pending.clone(),
            },
        }))
    }

    async fn put(&self, key: &ChunkKey, data: Bytes) -> Result<(), StoreError> {
        self.slots
            .entry(*key)
            .and_modify(|slot| slot.data = Some(data.clone()))
            .or_insert_with(|| Slot {
                data: Some(data.clone()),
                pending: None,
            });
        Ok(())
    }

    async fn get_or_create_request(&self, key: &ChunkKey) -> Result<(Chunk, bool), StoreError> {
        use dashmap::mapref::entry::Entry;

        match self.slots.entry(*key) {
            Entry::Occupied(occupied) => {
                let slot = occupied.get();
                match &slot.data {
                    Some(data) => Ok((Chunk::stored(*key, data.clone()), false)),
                    None => {
                        let pending = slot.pending.clone().unwrap_or_default();
                        Ok((Chunk::placeholder(*key, pending), false))
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let pending = Pending::new();
                vacant.insert(Slot {
                    data: None,
                    pending: Some(pending.clone()),
                });
                Ok((Chunk::placeholder(*key, pending), true))
            }
        }
    }

    async fn fulfill(&self, key: &ChunkKey, data: Bytes) -> Result<(), StoreError> {
        // Write the data inside the slot lock, release, then fire — waiters
        // woken by the signal must see the stored payload.
        let pending = match self.slots.entry(*key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                slot.data = Some(data);
                slot.pending.take()
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    data: Some(data),
                    pending: None,
                });
                None
            }
        };
        if let Some(pending) = pending {
            pending.fire();
        }
        Ok(())
    }

    async fn has(&self, key: &ChunkKey) -> bool {
        self.slots
            .get(key)
            .map(|slot| slot.data.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_and_get_roundtrip() {
        let store = MemoryStore::new();
        let data = Bytes::from_static(b"hello world");
        let key = ChunkKey::for_data(&data);

        store.put(&key, data.clone()).await.unwrap();
        let chunk = store.get(&key).await.unwrap().unwrap();
        assert_eq!(chunk.data.unwrap(), data);
        assert!(chunk.pending.is_none());
        assert!(store.has(&key).await);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_placeholder() {
        let store = MemoryStore::new();
        let key = ChunkKey::for_data(b"missing");

        let (first, created_first) = store.get_or_create_request(&key).await.unwrap();
        let (second, created_second) = store.get_or_create_request(&key).await.unwrap();

        assert!(created_first);
        assert!(!created_second);
        assert!(first.data.is_none() && second.data.is_none());

        // both placeholders observe the same signal
        store.fulfill(&key, Bytes::from_static(b"missing")).await.unwrap();
        first.pending.unwrap().wait().await;
        second.pending.unwrap().wait().await;
    }

    #[tokio::test]
    async fn get_or_create_returns_data_when_stored() {
        let store = MemoryStore::new();
        let data = Bytes::from_static(b"present");
        let key = ChunkKey::for_data(&data);
        store.put(&key, data.clone()).await.unwrap();

        let (chunk, created) = store.get_or_create_request(&key).await.unwrap();
        assert!(!created);
        assert_eq!(chunk.data.unwrap(), data);
        assert!(chunk.pending.is_none());
    }

    #[tokio::test]
    async fn fulfill_stores_before_waking() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let key = ChunkKey::for_data(b"ordered");

        let (chunk, _) = store.get_or_create_request(&key).await.unwrap();
        let pending = chunk.pending.unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                pending.wait().await;
                // data must be visible the instant the signal fires
                store.get(&key).await.unwrap().unwrap().data.unwrap()
            })
        };

        store.fulfill(&key, Bytes::from_static(b"ordered")).await.unwrap();
        assert_eq!(waiter.await.unwrap(), Bytes::from_static(b"ordered"));
    }

    #[tokio::test]
    async fn unfulfilled_placeholder_stays_pending() {
        let store = MemoryStore::new();
        let key = ChunkKey::for_data(b"never arrives");

        let (chunk, created) = store.get_or_create_request(&key).await.unwrap();
        assert!(created);
        assert!(!chunk.pending.unwrap().is_fired());
        assert!(!store.has(&key).await);

        // lookup sees the same placeholder, still unfired
        let again = store.get(&key).await.unwrap().unwrap();
        assert!(!again.pending.unwrap().is_fired());
    }
}
