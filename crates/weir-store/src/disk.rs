//! Content-addressed disk store.
//!
//! Chunks live in a two-level directory structure:
//!   root/{hash[0..2]}/{full_hash}
//!
//! This is the same layout Git uses for objects. Files are immutable —
//! if the hash exists, the content is correct. Writes are atomic (temp
//! file, then rename); reads go through mmap so page faults bring data
//! from disk on demand.
//!
//! In-flight request placeholders are NOT persisted: they are session
//! state, held in an in-memory overlay that coalesces concurrent
//! requests exactly like [`MemoryStore`](crate::MemoryStore).

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use memmap2::Mmap;

use weir_core::ChunkKey;

use crate::{Chunk, ChunkStore, Pending, StoreError};

/// Persistent content-addressed chunk store.
pub struct DiskStore {
    root: PathBuf,
    requests: DashMap<ChunkKey, Pending>,
}

impl DiskStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            requests: DashMap::new(),
        })
    }

    fn chunk_path(&self, key: &ChunkKey) -> PathBuf {
        let hex = hex::encode(key.as_bytes());
        // Two-level: root/ab/abc123...
        self.root.join(&hex[0..2]).join(&hex)
    }

    fn read_chunk(&self, key: &ChunkKey) -> Result<Option<Bytes>, StoreError> {
        let path = self.chunk_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let file = fs::File::open(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        // Safety: the file is opened read-only and never mutated in place —
        // writes always go to a temp file and rename over.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?
        };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    fn write_chunk(&self, key: &ChunkKey, data: &[u8]) -> Result<(), StoreError> {
        let path = self.chunk_path(key);

        // Already exists? Immutability makes this a no-op.
        if path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        // Atomic write: tmp file → rename
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path).map_err(|source| StoreError::Io {
                path: tmp_path.clone(),
                source,
            })?;
            file.write_all(data).map_err(|source| StoreError::Io {
                path: tmp_path.clone(),
                source,
            })?;
            file.sync_all().map_err(|source| StoreError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        }
        fs::rename(&tmp_path, &path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;

        tracing::trace!(key = %key, "chunk stored");
        Ok(())
    }

    /// Count stored chunks (for stats/debugging).
    pub fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    total += subdir.count();
                }
            }
        }
        total
    }

    /// Total stored bytes (for stats/debugging).
    pub fn size(&self) -> u64 {
        let mut total = 0u64;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    for chunk in subdir.flatten() {
                        if let Ok(meta) = chunk.metadata() {
                            total += meta.len();
                        }
                    }
                }
            }
        }
        total
    }
}

#[async_trait]
impl ChunkStore for DiskStore {
    async fn get(&self, key: &ChunkKey) -> Result<Option<Chunk>, StoreError> {
        if let Some(data) = self.read_chunk(key)? {
            return Ok(Some(Chunk::stored(*key, data)));
        }
        Ok(self
            .requests
            .get(key)
            .map(|pending| Chunk::placeholder(*key, pending.clone())))
    }

    async fn put(&self, key: &ChunkKey, data: Bytes) -> Result<(), StoreError> {
        self.write_chunk(key, &data)
    }

    async fn get_or_create_request(&self, key: &ChunkKey) -> Result<(Chunk, bool), StoreError> {
        use dashmap::mapref::entry::Entry;

        // The entry guard serializes racing requesters for this key; the
        // disk probe happens under it so lookup+insert cannot interleave.
        match self.requests.entry(*key) {
            Entry::Occupied(occupied) => {
                Ok((Chunk::placeholder(*key, occupied.get().clone()), false))
            }
            Entry::Vacant(vacant) => {
                if let Some(data) = self.read_chunk(key)? {
                    return Ok((Chunk::stored(*key, data), false));
                }
                let pending = Pending::new();
                vacant.insert(pending.clone());
                Ok((Chunk::placeholder(*key, pending), true))
            }
        }
    }

    async fn fulfill(&self, key: &ChunkKey, data: Bytes) -> Result<(), StoreError> {
        self.write_chunk(key, &data)?;
        if let Some((_, pending)) = self.requests.remove(key) {
            pending.fire();
        }
        Ok(())
    }

    async fn has(&self, key: &ChunkKey) -> bool {
        self.chunk_path(key).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_store() -> DiskStore {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir =
            std::env::temp_dir().join(format!("weir-store-test-{}-{}", std::process::id(), id));
        let _ = fs::remove_dir_all(&dir);
        DiskStore::new(&dir).unwrap()
    }

    #[tokio::test]
    async fn put_and_get_roundtrip() {
        let store = temp_store();
        let data = Bytes::from_static(b"hello world");
        let key = ChunkKey::for_data(&data);

        store.put(&key, data.clone()).await.unwrap();
        let chunk = store.get(&key).await.unwrap().unwrap();
        assert_eq!(chunk.data.unwrap(), data);
        assert!(store.has(&key).await);
        assert_eq!(store.count(), 1);
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let store = temp_store();
        let data = Bytes::from_static(b"idempotent");
        let key = ChunkKey::for_data(&data);

        store.put(&key, data.clone()).await.unwrap();
        store.put(&key, data).await.unwrap();
        assert_eq!(store.count(), 1);
    }

    #[tokio::test]
    async fn request_overlay_coalesces() {
        let store = temp_store();
        let key = ChunkKey::for_data(b"not yet here");

        let (first, created) = store.get_or_create_request(&key).await.unwrap();
        assert!(created);
        let (_, created_again) = store.get_or_create_request(&key).await.unwrap();
        assert!(!created_again);

        store
            .fulfill(&key, Bytes::from_static(b"not yet here"))
            .await
            .unwrap();
        first.pending.unwrap().wait().await;
        assert!(store.has(&key).await);
        // placeholder is gone once fulfilled
        let chunk = store.get(&key).await.unwrap().unwrap();
        assert!(chunk.pending.is_none());
    }

    #[tokio::test]
    async fn stored_chunk_short_circuits_request() {
        let store = temp_store();
        let data = Bytes::from_static(b"already here");
        let key = ChunkKey::for_data(&data);
        store.put(&key, data.clone()).await.unwrap();

        let (chunk, created) = store.get_or_create_request(&key).await.unwrap();
        assert!(!created);
        assert_eq!(chunk.data.unwrap(), data);
    }

    #[tokio::test]
    async fn size_sums_stored_bytes() {
        let store = temp_store();
        let a = Bytes::from_static(b"chunk one");
        let b = Bytes::from_static(b"chunk two!!");
        store.put(&ChunkKey::for_data(&a), a.clone()).await.unwrap();
        store.put(&ChunkKey::for_data(&b), b.clone()).await.unwrap();
        assert_eq!(store.size(), (a.len() + b.len()) as u64);
    }
}
