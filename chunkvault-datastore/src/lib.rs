//! Low level storage primitives of the backup engine: digests,
//! chunking, the content-addressed chunk store and the snapshot
//! catalog.

pub mod cached_chunk_reader;
pub mod catalog;
pub mod chunk_filter;
pub mod chunk_store;
pub mod chunker;
pub mod data_blob;
pub mod digest;
pub mod file_formats;
pub mod read_chunk;
pub mod snapshot;

pub use cached_chunk_reader::CachedChunkReader;
pub use catalog::{Catalog, CatalogError, IndexStats};
pub use chunk_filter::ChunkFilter;
pub use chunk_store::{ChunkStore, ChunkStoreConfig, PutOutcome, StoreError, StoreStats};
pub use chunker::{ChunkError, ChunkRecord, ChunkerOptions, FileChunker};
pub use data_blob::{ChunkBlob, ChunkCodec};
pub use digest::{Digest, Hasher, HasherState, DIGEST_LEN};
pub use read_chunk::ReadChunk;
pub use snapshot::{ChunkCite, FileEntry, Snapshot, SnapshotDescriptor, SnapshotId};
