//! Restore orchestration.
//!
//! Reads a sealed snapshot from the catalog and rebuilds every file
//! from the chunk store, in snapshot order. A missing chunk, a digest
//! mismatch or a write error is fatal; the partially written file is
//! removed before the error surfaces, so the target ends up with each
//! file either absent or complete.

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{format_err, Context, Error};
use tokio_util::sync::CancellationToken;

use chunkvault_datastore::{
    CachedChunkReader, Catalog, ChunkStore, FileEntry, Hasher, ReadChunk, SnapshotId, StoreError,
};

use crate::events::{Event, EventSink, LogEventSink};
use crate::Cancelled;

/// The restore target already holds a file and overwriting was not
/// requested.
#[derive(Debug, thiserror::Error)]
#[error("restore target {0:?} already exists")]
pub struct TargetExists(pub PathBuf);

#[derive(Clone, Debug)]
pub struct RestoreOptions {
    /// Replace existing files instead of failing on them.
    pub overwrite_existing: bool,
    /// Re-verify each chunk against its digest before writing.
    pub verify_integrity: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            overwrite_existing: false,
            verify_integrity: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RestoreResult {
    pub files_restored: u64,
    pub bytes_restored: u64,
    pub chunks_read: u64,
    pub duration: Duration,
}

/// Decoded chunks kept around for re-use across files citing the same
/// digest.
const CHUNK_CACHE_CAPACITY: usize = 32;

/// A configured restore run against one store and catalog.
pub struct RestoreTask {
    store: Arc<ChunkStore>,
    catalog: Arc<Catalog>,
    hasher: Arc<Hasher>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    options: RestoreOptions,
}

impl RestoreTask {
    pub fn new(
        store: Arc<ChunkStore>,
        catalog: Arc<Catalog>,
        hasher: Arc<Hasher>,
        options: RestoreOptions,
    ) -> Self {
        Self {
            store,
            catalog,
            hasher,
            sink: Arc::new(LogEventSink),
            cancel: CancellationToken::new(),
            options,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Materialize snapshot `snapshot_id` under `target`.
    pub async fn run(
        &self,
        snapshot_id: SnapshotId,
        target: &Path,
    ) -> Result<RestoreResult, Error> {
        let start = Instant::now();

        let snapshot = self.catalog.load_snapshot(snapshot_id)?;

        std::fs::create_dir_all(target)
            .with_context(|| format!("unable to create restore target {:?}", target))?;

        let reader = Arc::new(CachedChunkReader::new(
            Arc::clone(&self.store),
            CHUNK_CACHE_CAPACITY,
        ));

        let mut result = RestoreResult::default();

        for entry in &snapshot.files {
            if self.cancel.is_cancelled() {
                return Err(Cancelled.into());
            }

            self.sink.emit(Event::FileStarted {
                path: entry.display_path(),
            });

            let reader = Arc::clone(&reader);
            let hasher = Arc::clone(&self.hasher);
            let options = self.options.clone();
            let entry_owned = entry.clone();
            let target_owned = target.to_owned();

            let (bytes, chunks) = tokio::task::spawn_blocking(move || {
                restore_one_file(reader.as_ref(), &hasher, &options, &entry_owned, &target_owned)
            })
            .await
            .map_err(|join_err| format_err!("restore worker panicked - {}", join_err))??;

            result.files_restored += 1;
            result.bytes_restored += bytes;
            result.chunks_read += chunks;

            self.sink.emit(Event::FileCompleted {
                path: entry.display_path(),
                size: bytes,
                chunks,
            });
        }

        result.duration = start.elapsed();
        Ok(result)
    }
}

/// Rebuild one file; returns (bytes written, chunks read).
fn restore_one_file(
    reader: &dyn ReadChunk,
    hasher: &Hasher,
    options: &RestoreOptions,
    entry: &FileEntry,
    target: &Path,
) -> Result<(u64, u64), Error> {
    let path = target.join(entry.relative_path());

    if path.symlink_metadata().is_ok() && !options.overwrite_existing {
        return Err(TargetExists(path).into());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("unable to create directory {:?}", parent))?;
    }

    let result = write_file_contents(reader, hasher, options, entry, &path);

    if result.is_err() {
        // never leave a half-written file behind
        let _ = std::fs::remove_file(&path);
        return result;
    }

    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(entry.mode))
        .with_context(|| format!("unable to set mode on {:?}", path))?;
    chunkvault_tools::fs::set_mtime(&path, entry.mtime)?;

    result
}

fn write_file_contents(
    reader: &dyn ReadChunk,
    hasher: &Hasher,
    options: &RestoreOptions,
    entry: &FileEntry,
    path: &Path,
) -> Result<(u64, u64), Error> {
    let mut file =
        File::create(path).with_context(|| format!("unable to create {:?}", path))?;

    let mut bytes = 0u64;
    let mut chunks = 0u64;

    for cite in &entry.chunks {
        let data = reader.read_chunk(&cite.digest)?;
        chunks += 1;

        if options.verify_integrity && hasher.hash_bytes(&data) != cite.digest {
            return Err(StoreError::IntegrityFailure(cite.digest).into());
        }
        if data.len() as u64 != cite.length {
            return Err(format_err!(
                "chunk {} has length {} but the snapshot cites {}",
                cite.digest,
                data.len(),
                cite.length
            ));
        }

        file.write_all(&data)
            .with_context(|| format!("write to {:?} failed", path))?;
        bytes += data.len() as u64;
    }

    if bytes != entry.size {
        return Err(format_err!(
            "restored {} bytes for {:?} but the snapshot records {}",
            bytes,
            path,
            entry.size
        ));
    }

    nix::unistd::fsync(file.as_raw_fd())
        .map_err(|err| format_err!("fsync {:?} failed - {}", path, err))?;

    Ok((bytes, chunks))
}
