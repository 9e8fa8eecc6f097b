//! Fixed-size file chunking.
//!
//! A [`FileChunker`] splits one regular file into consecutive chunks
//! of `chunk_size` bytes (the final chunk may be shorter) and hashes
//! each one. Records come out strictly in file order; concatenating
//! their bytes reproduces the file content as of open time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::AsyncReadExt;

use chunkvault_tools::buffer_pool::{BufferPool, PooledBuffer};

use crate::digest::{Digest, Hasher};

#[derive(Clone, Debug)]
pub struct ChunkerOptions {
    /// Target chunk length; every chunk except possibly the last has
    /// exactly this length.
    pub chunk_size: usize,
    /// Keep a second, incremental digest over the bytes as each read
    /// returns them and compare it against the digest of the
    /// assembled chunk. A mismatch means the buffer changed between
    /// read and hash.
    pub verify: bool,
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        Self {
            chunk_size: 4 * 1024 * 1024,
            verify: false,
        }
    }
}

/// One chunk of a file, with its position and identity.
///
/// The record owns the pooled buffer holding the chunk bytes; dropping
/// the record (or just the buffer) returns the buffer to the pool, so
/// consumers hold on to it until the bytes are no longer needed.
pub struct ChunkRecord {
    pub index: u64,
    pub offset: u64,
    pub length: usize,
    pub digest: Digest,
    pub buffer: PooledBuffer,
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("unable to open {path:?} - {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("read error at offset {offset} - {source}")]
    Read {
        offset: u64,
        source: std::io::Error,
    },
    #[error("chunk verification failed at offset {offset}")]
    Verify { offset: u64 },
    #[error("buffer pool error - {0}")]
    Pool(#[from] anyhow::Error),
}

pub struct FileChunker {
    file: File,
    chunk_size: usize,
    verify: bool,
    hasher: Arc<Hasher>,
    pool: Arc<BufferPool>,
    /// File size at open time; later growth is not read.
    open_size: u64,
    index: u64,
    offset: u64,
    done: bool,
    truncated: bool,
}

impl FileChunker {
    pub async fn open(
        path: &Path,
        options: &ChunkerOptions,
        hasher: Arc<Hasher>,
        pool: Arc<BufferPool>,
    ) -> Result<Self, ChunkError> {
        assert!(options.chunk_size > 0, "chunk size must be non-zero");

        let file = File::open(path).await.map_err(|source| ChunkError::Open {
            path: path.to_owned(),
            source,
        })?;
        let open_size = file
            .metadata()
            .await
            .map_err(|source| ChunkError::Open {
                path: path.to_owned(),
                source,
            })?
            .len();

        Ok(Self {
            file,
            chunk_size: options.chunk_size,
            verify: options.verify,
            hasher,
            pool,
            open_size,
            index: 0,
            offset: 0,
            done: false,
            truncated: false,
        })
    }

    /// Bytes emitted so far; after the stream ends this is the file's
    /// logical size as committed to the snapshot.
    pub fn bytes_read(&self) -> u64 {
        self.offset
    }

    /// True once a read hit end-of-file before the length seen at open
    /// time, i.e. the file shrank while being chunked.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Produce the next chunk record, or `None` after the last chunk.
    ///
    /// Suspends on buffer acquisition under pool backpressure and on
    /// file reads. Read failures surface the file offset at which the
    /// read was attempted.
    pub async fn next_chunk(&mut self) -> Result<Option<ChunkRecord>, ChunkError> {
        if self.done {
            return Ok(None);
        }

        let remaining = self.open_size.saturating_sub(self.offset);
        if remaining == 0 {
            self.done = true;
            return Ok(None);
        }

        let target = (self.chunk_size as u64).min(remaining) as usize;
        let mut buffer = self.pool.acquire(target).await?;

        // digest the bytes as each read delivers them, so the final
        // hash of the assembled buffer can be cross-checked against it
        let mut read_digest = self.verify.then(|| self.hasher.streaming());

        let mut filled = 0;
        while filled < target {
            let n = self
                .file
                .read(&mut buffer.buf_mut()[filled..target])
                .await
                .map_err(|source| ChunkError::Read {
                    offset: self.offset + filled as u64,
                    source,
                })?;
            if n == 0 {
                // file shrank under us; commit what we got
                self.truncated = true;
                self.done = true;
                break;
            }
            if let Some(ref mut state) = read_digest {
                state.update(&buffer.buf_mut()[filled..filled + n]);
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }

        buffer.set_filled(filled);

        let digest = self.hasher.hash_bytes(buffer.as_slice());
        if let Some(state) = read_digest {
            if state.finalize() != digest {
                return Err(ChunkError::Verify {
                    offset: self.offset,
                });
            }
        }

        let record = ChunkRecord {
            index: self.index,
            offset: self.offset,
            length: filled,
            digest,
            buffer,
        };

        self.index += 1;
        self.offset += filled as u64;
        if self.offset >= self.open_size {
            self.done = true;
        }

        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkvault_tools::buffer_pool::BufferPoolConfig;

    fn test_pool() -> Arc<BufferPool> {
        Arc::new(
            BufferPool::new(BufferPoolConfig {
                size_classes: vec![1024, 4096, 16 * 1024],
                ..Default::default()
            })
            .unwrap(),
        )
    }

    async fn chunk_file(data: &[u8], chunk_size: usize) -> Vec<(u64, u64, usize, Digest, Vec<u8>)> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input");
        std::fs::write(&path, data).unwrap();

        let options = ChunkerOptions {
            chunk_size,
            verify: true,
        };
        let mut chunker = FileChunker::open(&path, &options, Arc::new(Hasher::unkeyed()), test_pool())
            .await
            .unwrap();

        let mut out = Vec::new();
        while let Some(record) = chunker.next_chunk().await.unwrap() {
            out.push((
                record.index,
                record.offset,
                record.length,
                record.digest,
                record.buffer.as_slice().to_vec(),
            ));
        }
        out
    }

    #[tokio::test]
    async fn empty_file_yields_no_chunks() {
        assert!(chunk_file(b"", 1024).await.is_empty());
    }

    #[tokio::test]
    async fn concatenation_reproduces_input() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let chunks = chunk_file(&data, 1024).await;

        assert_eq!(chunks.len(), 10);

        let mut rebuilt = Vec::new();
        let hasher = Hasher::unkeyed();
        for (i, (index, offset, length, digest, bytes)) in chunks.iter().enumerate() {
            assert_eq!(*index, i as u64);
            assert_eq!(*offset, (i * 1024) as u64);
            assert_eq!(*length, bytes.len());
            assert_eq!(hasher.hash_bytes(bytes), *digest);
            rebuilt.extend_from_slice(bytes);
        }
        assert_eq!(rebuilt, data);
    }

    #[tokio::test]
    async fn aligned_file_has_no_short_tail() {
        let data = vec![9u8; 4096];
        let chunks = chunk_file(&data, 1024).await;

        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|(_, _, length, _, _)| *length == 1024));
    }

    #[tokio::test]
    async fn one_byte_past_alignment_gets_tiny_tail() {
        let data = vec![9u8; 1025];
        let chunks = chunk_file(&data, 1024).await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].2, 1024);
        assert_eq!(chunks[1].2, 1);
    }

    #[tokio::test]
    async fn growth_after_open_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("growing");
        std::fs::write(&path, vec![1u8; 2048]).unwrap();

        let options = ChunkerOptions {
            chunk_size: 1024,
            verify: false,
        };
        let mut chunker = FileChunker::open(&path, &options, Arc::new(Hasher::unkeyed()), test_pool())
            .await
            .unwrap();

        let first = chunker.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.length, 1024);
        drop(first);

        // file grows mid-stream; the tail past the open-time size stays out
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&vec![2u8; 4096]).unwrap();
        drop(f);

        let second = chunker.next_chunk().await.unwrap().unwrap();
        assert_eq!(second.length, 1024);
        drop(second);

        assert!(chunker.next_chunk().await.unwrap().is_none());
        assert_eq!(chunker.bytes_read(), 2048);
        assert!(!chunker.truncated());
    }

    #[tokio::test]
    async fn shrink_after_open_commits_short_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shrinking");
        std::fs::write(&path, vec![1u8; 4096]).unwrap();

        let options = ChunkerOptions {
            chunk_size: 1024,
            verify: false,
        };
        let mut chunker = FileChunker::open(&path, &options, Arc::new(Hasher::unkeyed()), test_pool())
            .await
            .unwrap();

        let first = chunker.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.length, 1024);
        drop(first);

        // truncate to half; the next read runs into early EOF
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(1536).unwrap();
        drop(f);

        let second = chunker.next_chunk().await.unwrap().unwrap();
        assert_eq!(second.length, 512);
        drop(second);

        assert!(chunker.next_chunk().await.unwrap().is_none());
        assert_eq!(chunker.bytes_read(), 1536);
        assert!(chunker.truncated());
    }

    #[tokio::test]
    async fn missing_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileChunker::open(
            &dir.path().join("nope"),
            &ChunkerOptions::default(),
            Arc::new(Hasher::unkeyed()),
            test_pool(),
        )
        .await;
        assert!(matches!(result, Err(ChunkError::Open { .. })));
    }
}
