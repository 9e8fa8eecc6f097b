//! Chunk reader with an LRU cache in front of the store.
//!
//! Deduplicated snapshots cite the same digest from many files;
//! caching the decoded bytes avoids re-reading and re-verifying the
//! same object over and over during restore.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chunkvault_tools::lru_cache::LruCache;

use crate::chunk_store::{ChunkStore, StoreError};
use crate::digest::Digest;
use crate::read_chunk::ReadChunk;

pub struct CachedChunkReader {
    store: Arc<ChunkStore>,
    cache: Mutex<LruCache<Digest, Arc<Vec<u8>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedChunkReader {
    /// Cache up to `capacity` decoded chunks.
    pub fn new(store: Arc<ChunkStore>, capacity: usize) -> Self {
        Self {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// (cache hits, cache misses) served so far.
    pub fn cache_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl ReadChunk for CachedChunkReader {
    fn read_chunk(&self, digest: &Digest) -> Result<Arc<Vec<u8>>, StoreError> {
        if let Some(data) = self.cache.lock().unwrap().get(digest) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(data));
        }

        // fetch outside the cache lock
        let data = Arc::new(self.store.get(digest)?);
        self.misses.fetch_add(1, Ordering::Relaxed);

        self.cache
            .lock()
            .unwrap()
            .insert(*digest, Arc::clone(&data));
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::ChunkStoreConfig;
    use crate::digest::Hasher;

    #[test]
    fn repeated_reads_hit_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let hasher = Arc::new(Hasher::unkeyed());
        let store = Arc::new(
            ChunkStore::create(dir.path(), ChunkStoreConfig::default(), Arc::clone(&hasher))
                .unwrap(),
        );

        let data = vec![3u8; 8192];
        let digest = hasher.hash_bytes(&data);
        store.put(&digest, &data).unwrap();

        let reader = CachedChunkReader::new(Arc::clone(&store), 8);

        for _ in 0..5 {
            assert_eq!(*reader.read_chunk(&digest).unwrap(), data);
        }

        assert_eq!(reader.cache_stats(), (4, 1));
        // only the first read touched the store
        assert_eq!(store.stats().reads, 1);
    }

    #[test]
    fn missing_chunks_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let hasher = Arc::new(Hasher::unkeyed());
        let store = Arc::new(
            ChunkStore::create(dir.path(), ChunkStoreConfig::default(), Arc::clone(&hasher))
                .unwrap(),
        );

        let digest = hasher.hash_bytes(b"absent");
        let reader = CachedChunkReader::new(store, 8);

        assert!(matches!(
            reader.read_chunk(&digest),
            Err(StoreError::Missing(_))
        ));
        assert_eq!(reader.cache_stats(), (0, 0));
    }
}
