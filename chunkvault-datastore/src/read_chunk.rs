//! Chunk read interface.

use std::sync::Arc;

use crate::chunk_store::{ChunkStore, StoreError};
use crate::digest::Digest;

/// Source of chunk bytes keyed by digest.
///
/// Implemented by the chunk store directly and by caching wrappers;
/// restore-side consumers only depend on this interface.
pub trait ReadChunk: Send + Sync {
    fn read_chunk(&self, digest: &Digest) -> Result<Arc<Vec<u8>>, StoreError>;
}

impl ReadChunk for ChunkStore {
    fn read_chunk(&self, digest: &Digest) -> Result<Arc<Vec<u8>>, StoreError> {
        Ok(Arc::new(self.get(digest)?))
    }
}
