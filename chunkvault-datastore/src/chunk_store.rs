//! Write-once, digest-keyed chunk store on a local filesystem.
//!
//! Layout under the store root:
//!
//! ```text
//! objects/XX/YY/<full-digest-hex>   chunk object files
//! tmp/                              in-progress writes
//! filter.json                       optional membership filter sidecar
//! ```
//!
//! Inserts write to `tmp/`, fsync, then rename into `objects/`; a
//! chunk is either fully visible under its digest or absent, never
//! partial. Anything left in `tmp/` at open time is an orphan from an
//! interrupted run and gets deleted.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};

use chunkvault_tools::fs::{fsync_dir, make_tmp_path};

use crate::data_blob::{ChunkBlob, ChunkCodec};
use crate::digest::{Digest, Hasher};
use crate::file_formats::{CHUNK_BLOB_HEADER_LEN, MAX_CHUNK_SIZE};

const LOCK_SHARDS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store poisoned by earlier digest collision")]
    Poisoned,
    #[error("digest collision detected for chunk {0}")]
    DigestCollision(Digest),
    #[error("chunk {0} missing from store")]
    Missing(Digest),
    #[error("integrity failure for chunk {0}")]
    IntegrityFailure(Digest),
    #[error("read error for chunk {digest} - {source}")]
    ReadError {
        digest: Digest,
        source: std::io::Error,
    },
    #[error("chunk store I/O error - {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(#[from] Error),
}

/// Result of a `put`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The bytes were physically written.
    Inserted,
    /// The digest was already resident; nothing was written.
    AlreadyPresent,
}

#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    /// Distinct digests resident in the store.
    pub distinct_chunks: u64,
    /// Sum of the (uncompressed) chunk lengths over distinct digests.
    pub stored_bytes: u64,
    /// Physical inserts performed by this instance.
    pub insertions: u64,
    /// Puts answered from already resident chunks by this instance.
    pub dedup_hits: u64,
    /// Chunk reads served by this instance.
    pub reads: u64,
}

#[derive(Clone, Debug)]
pub struct ChunkStoreConfig {
    /// Codec applied to chunk payloads on disk.
    pub codec: ChunkCodec,
    /// Verify chunk bytes against the digest on every `get`, and
    /// compare full content instead of lengths on duplicate `put`s.
    pub verify_reads: bool,
    /// Fsync the object directory after every insert instead of only
    /// at close.
    pub fsync_dirs: bool,
}

impl Default for ChunkStoreConfig {
    fn default() -> Self {
        Self {
            codec: ChunkCodec::default(),
            verify_reads: true,
            fsync_dirs: false,
        }
    }
}

/// Filesystem backed, content-addressed chunk store.
///
/// All methods take `&self`; mutation is serialized per digest through
/// a shard of insert locks, so concurrent puts of distinct digests
/// proceed in parallel while duplicate puts of one digest are
/// linearized (exactly one physical write).
pub struct ChunkStore {
    base: PathBuf,
    objects_dir: PathBuf,
    tmp_dir: PathBuf,
    config: ChunkStoreConfig,
    hasher: Arc<Hasher>,
    locks: Vec<Mutex<()>>,
    poisoned: AtomicBool,
    distinct_chunks: AtomicU64,
    stored_bytes: AtomicU64,
    insertions: AtomicU64,
    dedup_hits: AtomicU64,
    reads: AtomicU64,
}

impl ChunkStore {
    fn paths(base: &Path) -> (PathBuf, PathBuf) {
        (base.join("objects"), base.join("tmp"))
    }

    /// Initialize a fresh store under `base`.
    pub fn create<P: Into<PathBuf>>(
        base: P,
        config: ChunkStoreConfig,
        hasher: Arc<Hasher>,
    ) -> Result<Self, StoreError> {
        let base: PathBuf = base.into();
        let (objects_dir, tmp_dir) = Self::paths(&base);

        std::fs::create_dir_all(&base)?;
        std::fs::create_dir(&objects_dir).map_err(|err| {
            StoreError::Other(format_err!(
                "unable to create chunk store at {:?} - {}",
                objects_dir,
                err
            ))
        })?;
        std::fs::create_dir_all(&tmp_dir)?;

        Ok(Self::assemble(base, objects_dir, tmp_dir, config, hasher))
    }

    /// Open an existing store, deleting orphaned temp files and
    /// scanning the object tree to recover resident-chunk statistics.
    pub fn open<P: Into<PathBuf>>(
        base: P,
        config: ChunkStoreConfig,
        hasher: Arc<Hasher>,
    ) -> Result<Self, StoreError> {
        let base: PathBuf = base.into();
        let (objects_dir, tmp_dir) = Self::paths(&base);

        if !objects_dir.is_dir() {
            return Err(StoreError::Other(format_err!(
                "unable to open chunk store at {:?} - no object directory",
                base
            )));
        }
        std::fs::create_dir_all(&tmp_dir)?;

        let store = Self::assemble(base, objects_dir, tmp_dir, config, hasher);
        store.sweep_tmp_orphans()?;
        store.scan_objects()?;
        Ok(store)
    }

    /// Open, creating the store first if it does not exist yet.
    pub fn open_or_create<P: Into<PathBuf>>(
        base: P,
        config: ChunkStoreConfig,
        hasher: Arc<Hasher>,
    ) -> Result<Self, StoreError> {
        let base: PathBuf = base.into();
        if Self::paths(&base).0.is_dir() {
            Self::open(base, config, hasher)
        } else {
            Self::create(base, config, hasher)
        }
    }

    fn assemble(
        base: PathBuf,
        objects_dir: PathBuf,
        tmp_dir: PathBuf,
        config: ChunkStoreConfig,
        hasher: Arc<Hasher>,
    ) -> Self {
        Self {
            base,
            objects_dir,
            tmp_dir,
            config,
            hasher,
            locks: std::iter::repeat_with(|| Mutex::new(())).take(LOCK_SHARDS).collect(),
            poisoned: AtomicBool::new(false),
            distinct_chunks: AtomicU64::new(0),
            stored_bytes: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            dedup_hits: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path of the membership filter sidecar for this store.
    pub fn filter_path(&self) -> PathBuf {
        self.base.join(crate::chunk_filter::FILTER_FILE_NAME)
    }

    /// `objects/XX/YY/<hex>` path plus the hex form of `digest`.
    pub fn chunk_path(&self, digest: &Digest) -> (PathBuf, String) {
        let hex = digest.to_hex();
        let mut path = self.objects_dir.clone();
        path.push(&hex[0..2]);
        path.push(&hex[2..4]);
        path.push(&hex);
        (path, hex)
    }

    fn shard_lock(&self, digest: &Digest) -> &Mutex<()> {
        &self.locks[digest.as_bytes()[0] as usize % LOCK_SHARDS]
    }

    /// Whether `digest` is resident.
    pub fn contains(&self, digest: &Digest) -> Result<bool, StoreError> {
        let (path, _) = self.chunk_path(digest);
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Admit chunk bytes under `digest`.
    ///
    /// Idempotent and write-once: the first writer of a digest
    /// performs the single physical write, every later (or racing)
    /// writer observes `AlreadyPresent`. A duplicate put whose bytes
    /// do not match the resident chunk is a digest collision; the
    /// store reports it and refuses all further writes.
    pub fn put(&self, digest: &Digest, data: &[u8]) -> Result<PutOutcome, StoreError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(StoreError::Poisoned);
        }
        if data.len() > MAX_CHUNK_SIZE {
            return Err(StoreError::Other(format_err!(
                "chunk too large ({} bytes)",
                data.len()
            )));
        }

        let (chunk_path, digest_hex) = self.chunk_path(digest);

        let _guard = self.shard_lock(digest).lock().unwrap();

        if let Ok(meta) = std::fs::metadata(&chunk_path) {
            if !meta.is_file() {
                return Err(StoreError::Other(format_err!(
                    "got unexpected file type for chunk {}",
                    digest_hex
                )));
            }

            let matches = if self.config.verify_reads {
                self.read_decoded(digest, &chunk_path)? == data
            } else {
                self.stored_len(&chunk_path)? == data.len() as u64
            };

            if !matches {
                self.poisoned.store(true, Ordering::Release);
                log::error!("digest collision for chunk {} - store poisoned", digest_hex);
                return Err(StoreError::DigestCollision(*digest));
            }

            self.dedup_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(PutOutcome::AlreadyPresent);
        }

        let blob = ChunkBlob::encode(data, &self.config.codec).map_err(StoreError::Other)?;

        let tmp_path = make_tmp_path(&self.tmp_dir, "chunk");
        let result: Result<(), std::io::Error> = (|| {
            let mut file = File::create(&tmp_path)?;
            file.write_all(blob.raw_data())?;
            nix::unistd::fsync(file.as_raw_fd())?;
            Ok(())
        })();
        if let Err(err) = result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(StoreError::Other(format_err!(
                "inserting chunk {} failed - {}",
                digest_hex,
                err
            )));
        }

        let chunk_dir = chunk_path.parent().expect("chunk path has parent");
        std::fs::create_dir_all(chunk_dir)?;

        if let Err(err) = std::fs::rename(&tmp_path, &chunk_path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(StoreError::Other(format_err!(
                "inserting chunk {} failed - rename: {}",
                digest_hex,
                err
            )));
        }

        if self.config.fsync_dirs {
            fsync_dir(chunk_dir).map_err(StoreError::Other)?;
        }

        self.insertions.fetch_add(1, Ordering::Relaxed);
        self.distinct_chunks.fetch_add(1, Ordering::Relaxed);
        self.stored_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

        Ok(PutOutcome::Inserted)
    }

    /// Fetch and decode the chunk bytes for `digest`.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>, StoreError> {
        let (chunk_path, _) = self.chunk_path(digest);
        self.reads.fetch_add(1, Ordering::Relaxed);

        let data = self.read_decoded(digest, &chunk_path)?;

        if self.config.verify_reads && self.hasher.hash_bytes(&data) != *digest {
            return Err(StoreError::IntegrityFailure(*digest));
        }

        Ok(data)
    }

    fn read_decoded(&self, digest: &Digest, chunk_path: &Path) -> Result<Vec<u8>, StoreError> {
        let raw = match std::fs::read(chunk_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::Missing(*digest));
            }
            Err(err) => {
                return Err(StoreError::ReadError {
                    digest: *digest,
                    source: err,
                });
            }
        };

        ChunkBlob::from_raw(raw)
            .decode(&self.config.codec)
            .map_err(|err| {
                log::warn!("corrupt chunk object {} - {}", digest, err);
                StoreError::IntegrityFailure(*digest)
            })
    }

    fn stored_len(&self, chunk_path: &Path) -> Result<u64, StoreError> {
        if self.config.codec.is_identity() {
            return Ok(std::fs::metadata(chunk_path)?.len());
        }
        let mut header = [0u8; CHUNK_BLOB_HEADER_LEN];
        let mut file = File::open(chunk_path)?;
        file.read_exact(&mut header)?;
        ChunkBlob::from_raw(header.to_vec())
            .declared_len(&self.config.codec)
            .map_err(StoreError::Other)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            distinct_chunks: self.distinct_chunks.load(Ordering::Relaxed),
            stored_bytes: self.stored_bytes.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
        }
    }

    /// Flush and quiesce. Inserted chunks are durable once this
    /// returns.
    pub fn close(&self) -> Result<(), StoreError> {
        fsync_dir(&self.objects_dir).map_err(StoreError::Other)?;
        Ok(())
    }

    /// Call `f` for every resident digest.
    pub fn for_each_digest<F>(&self, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(&Digest) -> Result<(), Error>,
    {
        self.walk_objects(|digest, _path| f(digest))
    }

    fn sweep_tmp_orphans(&self) -> Result<(), StoreError> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.tmp_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            log::info!("removed {} orphaned temp files from {:?}", removed, self.tmp_dir);
        }
        Ok(())
    }

    /// Rebuild the resident-chunk counters from the object tree.
    fn scan_objects(&self) -> Result<(), StoreError> {
        let mut distinct = 0u64;
        let mut stored = 0u64;

        self.walk_objects(|_digest, path| {
            distinct += 1;
            stored += self.stored_len(path).map_err(Error::from)?;
            Ok(())
        })?;

        self.distinct_chunks.store(distinct, Ordering::Relaxed);
        self.stored_bytes.store(stored, Ordering::Relaxed);
        Ok(())
    }

    fn walk_objects<F>(&self, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(&Digest, &Path) -> Result<(), Error>,
    {
        for level1 in std::fs::read_dir(&self.objects_dir)? {
            let level1 = level1?;
            if !level1.file_type()?.is_dir() {
                continue;
            }
            for level2 in std::fs::read_dir(level1.path())? {
                let level2 = level2?;
                if !level2.file_type()?.is_dir() {
                    continue;
                }
                for object in std::fs::read_dir(level2.path())? {
                    let object = object?;
                    if !object.file_type()?.is_file() {
                        continue;
                    }
                    let name = object.file_name();
                    let name = match name.to_str() {
                        Some(name) => name,
                        None => continue,
                    };
                    let digest = match Digest::from_hex(name) {
                        Ok(digest) => digest,
                        // skip files that are not chunk objects
                        Err(_) => continue,
                    };
                    f(&digest, &object.path()).map_err(StoreError::Other)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store(dir: &Path) -> ChunkStore {
        ChunkStore::create(dir, ChunkStoreConfig::default(), Arc::new(Hasher::unkeyed())).unwrap()
    }

    #[test]
    fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let hasher = Hasher::unkeyed();

        let data = b"chunk payload".to_vec();
        let digest = hasher.hash_bytes(&data);

        assert!(!store.contains(&digest).unwrap());
        assert_eq!(store.put(&digest, &data).unwrap(), PutOutcome::Inserted);
        assert!(store.contains(&digest).unwrap());
        assert_eq!(store.get(&digest).unwrap(), data);

        let stats = store.stats();
        assert_eq!(stats.distinct_chunks, 1);
        assert_eq!(stats.stored_bytes, data.len() as u64);
        assert_eq!(stats.insertions, 1);
    }

    #[test]
    fn duplicate_put_is_a_dedup_hit() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let hasher = Hasher::unkeyed();

        let data = vec![0xEEu8; 8192];
        let digest = hasher.hash_bytes(&data);

        assert_eq!(store.put(&digest, &data).unwrap(), PutOutcome::Inserted);
        assert_eq!(store.put(&digest, &data).unwrap(), PutOutcome::AlreadyPresent);

        let stats = store.stats();
        assert_eq!(stats.insertions, 1);
        assert_eq!(stats.dedup_hits, 1);
        assert_eq!(stats.stored_bytes, data.len() as u64);
    }

    #[test]
    fn mismatched_bytes_poison_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let hasher = Hasher::unkeyed();

        let data = b"original".to_vec();
        let digest = hasher.hash_bytes(&data);
        store.put(&digest, &data).unwrap();

        // same digest argument, different bytes: caller bug or collision
        let result = store.put(&digest, b"tampered!");
        assert!(matches!(result, Err(StoreError::DigestCollision(d)) if d == digest));

        // all further writes are refused
        let other = hasher.hash_bytes(b"other");
        assert!(matches!(store.put(&other, b"other"), Err(StoreError::Poisoned)));
    }

    #[test]
    fn get_of_absent_digest_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        let digest = Hasher::unkeyed().hash_bytes(b"never inserted");
        assert!(matches!(store.get(&digest), Err(StoreError::Missing(d)) if d == digest));
    }

    #[test]
    fn corrupted_object_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let hasher = Hasher::unkeyed();

        let data = vec![5u8; 4096];
        let digest = hasher.hash_bytes(&data);
        store.put(&digest, &data).unwrap();

        let (path, _) = store.chunk_path(&digest);
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        std::fs::write(&path, &raw).unwrap();

        assert!(matches!(
            store.get(&digest),
            Err(StoreError::IntegrityFailure(d)) if d == digest
        ));
    }

    #[test]
    fn reopen_recovers_stats_and_sweeps_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let hasher = Arc::new(Hasher::unkeyed());

        let digest;
        {
            let store =
                ChunkStore::create(dir.path(), ChunkStoreConfig::default(), Arc::clone(&hasher))
                    .unwrap();
            let data = vec![1u8; 10_000];
            digest = hasher.hash_bytes(&data);
            store.put(&digest, &data).unwrap();
            store.close().unwrap();

            // simulate a crashed in-progress write
            std::fs::write(dir.path().join("tmp").join("chunk.999.0.tmp"), b"junk").unwrap();
        }

        let store =
            ChunkStore::open(dir.path(), ChunkStoreConfig::default(), Arc::clone(&hasher)).unwrap();

        let stats = store.stats();
        assert_eq!(stats.distinct_chunks, 1);
        assert_eq!(stats.stored_bytes, 10_000);
        assert!(store.contains(&digest).unwrap());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("tmp"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn object_paths_use_two_level_fanout() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        let digest = Hasher::unkeyed().hash_bytes(b"fanout");
        let (path, hex) = store.chunk_path(&digest);

        let rel: Vec<_> = path
            .strip_prefix(dir.path())
            .unwrap()
            .components()
            .map(|c| c.as_os_str().to_str().unwrap().to_owned())
            .collect();
        assert_eq!(rel, vec!["objects", &hex[0..2], &hex[2..4], &hex[..]]);
    }
}
