//! Backup orchestration.
//!
//! Walks a source tree in deterministic pre-order, chunks regular
//! files in parallel and funnels the chunk records through a bounded
//! channel into a pool of store writers. Each writer decides
//! insert-or-skip per digest (membership filter first, then the
//! store), acknowledges durability back to the file task, and only
//! then does the file task hand its ordered entry to the catalog.
//! When every file is in, the snapshot is sealed.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{format_err, Context, Error};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use chunkvault_datastore::{
    Catalog, ChunkCite, ChunkFilter, ChunkRecord, ChunkStore, ChunkerOptions, FileChunker,
    FileEntry, Hasher, PutOutcome, SnapshotId, StoreError,
};
use chunkvault_tools::buffer_pool::BufferPool;

use crate::events::{Event, EventSink, LogEventSink};
use crate::Cancelled;

/// How long in-flight work may drain after cancellation.
const CANCEL_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct BackupOptions {
    /// Fixed chunk length; only the last chunk of a file may be
    /// shorter.
    pub chunk_size: usize,
    /// Rehash chunks after the read.
    pub verify_chunks: bool,
    /// Files chunked concurrently.
    pub max_parallel_files: usize,
    /// Store writers consuming chunk records.
    pub max_parallel_chunks: usize,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            chunk_size: 4 * 1024 * 1024,
            verify_chunks: false,
            max_parallel_files: 4,
            max_parallel_chunks: 8,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BackupResult {
    pub snapshot_id: SnapshotId,
    pub files_processed: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub bytes_processed: u64,
    pub chunks_created: u64,
    pub chunks_deduped: u64,
    pub bytes_newly_stored: u64,
    pub duration: Duration,
}

#[derive(Default)]
struct BackupCounters {
    files_processed: AtomicU64,
    files_skipped: AtomicU64,
    files_failed: AtomicU64,
    bytes_processed: AtomicU64,
    chunks_created: AtomicU64,
    chunks_deduped: AtomicU64,
    bytes_newly_stored: AtomicU64,
}

/// One chunk on its way to the store, with the channel to acknowledge
/// durability (or surface the store error) back to the file task.
struct WriteJob {
    record: ChunkRecord,
    ack: oneshot::Sender<Result<PutOutcome, StoreError>>,
}

/// A configured backup run against one store and catalog.
pub struct BackupTask {
    store: Arc<ChunkStore>,
    catalog: Arc<Catalog>,
    hasher: Arc<Hasher>,
    pool: Arc<BufferPool>,
    filter: Option<Arc<ChunkFilter>>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    options: BackupOptions,
}

impl BackupTask {
    pub fn new(
        store: Arc<ChunkStore>,
        catalog: Arc<Catalog>,
        hasher: Arc<Hasher>,
        pool: Arc<BufferPool>,
        options: BackupOptions,
    ) -> Self {
        Self {
            store,
            catalog,
            hasher,
            pool,
            filter: None,
            sink: Arc::new(LogEventSink),
            cancel: CancellationToken::new(),
            options,
        }
    }

    /// Install a membership filter consulted before store lookups.
    pub fn with_filter(mut self, filter: Arc<ChunkFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run a backup of `source` and seal the resulting snapshot.
    ///
    /// File-level failures (unreadable file, mid-read error) drop the
    /// file from the snapshot and continue; store or catalog failures
    /// abort the run and roll the snapshot back. On cancellation,
    /// in-flight work drains for a bounded grace period, then the
    /// snapshot is rolled back; chunks already committed simply stay
    /// unreferenced.
    pub async fn run(&self, source: &Path) -> Result<BackupResult, Error> {
        let start = Instant::now();

        let source = source
            .canonicalize()
            .with_context(|| format!("unable to resolve backup source {:?}", source))?;
        let created_at = unix_now();

        let snapshot_id = self
            .catalog
            .begin_snapshot(&source.to_string_lossy(), created_at)?;

        let counters = Arc::new(BackupCounters::default());

        match self.run_pipeline(&source, snapshot_id, &counters).await {
            Ok(()) => {
                self.catalog.seal_snapshot(snapshot_id)?;

                if let Some(ref filter) = self.filter {
                    if let Err(err) = filter.save(self.store.filter_path()) {
                        log::warn!("unable to persist membership filter - {}", err);
                    }
                }

                self.store.close()?;
                self.catalog.close()?;

                Ok(BackupResult {
                    snapshot_id,
                    files_processed: counters.files_processed.load(Ordering::Relaxed),
                    files_skipped: counters.files_skipped.load(Ordering::Relaxed),
                    files_failed: counters.files_failed.load(Ordering::Relaxed),
                    bytes_processed: counters.bytes_processed.load(Ordering::Relaxed),
                    chunks_created: counters.chunks_created.load(Ordering::Relaxed),
                    chunks_deduped: counters.chunks_deduped.load(Ordering::Relaxed),
                    bytes_newly_stored: counters.bytes_newly_stored.load(Ordering::Relaxed),
                    duration: start.elapsed(),
                })
            }
            Err(err) => {
                self.sink.emit(Event::Error {
                    message: format!("backup failed - {}", err),
                });
                if let Err(rollback_err) = self.catalog.rollback_snapshot(snapshot_id) {
                    log::error!(
                        "rollback of snapshot {} failed - {}",
                        snapshot_id,
                        rollback_err
                    );
                }
                Err(err)
            }
        }
    }

    async fn run_pipeline(
        &self,
        source: &Path,
        snapshot_id: SnapshotId,
        counters: &Arc<BackupCounters>,
    ) -> Result<(), Error> {
        let writer_count = self.options.max_parallel_chunks.max(1);
        let (job_tx, job_rx) = mpsc::channel::<WriteJob>(writer_count * 2);

        let mut writers = Vec::new();
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        for _ in 0..writer_count {
            writers.push(tokio::spawn(store_writer(
                Arc::clone(&self.store),
                self.filter.clone(),
                Arc::clone(&job_rx),
            )));
        }

        let file_slots = Arc::new(Semaphore::new(self.options.max_parallel_files.max(1)));
        let mut file_tasks = Vec::new();

        let walk_result = self
            .walk_and_spawn(source, snapshot_id, counters, &job_tx, &file_slots, &mut file_tasks)
            .await;

        drop(job_tx);

        // drain file tasks even on a walk error, so writers finish
        let mut first_error = walk_result.err();
        for task in file_tasks {
            let result = if self.cancel.is_cancelled() {
                match tokio::time::timeout(CANCEL_GRACE, task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        first_error.get_or_insert_with(|| {
                            format_err!("in-flight files did not drain within grace period")
                        });
                        continue;
                    }
                }
            } else {
                task.await
            };
            match result {
                Ok(Ok(())) => (),
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    first_error.get_or_insert_with(|| format_err!("file task panicked - {}", join_err));
                }
            }
        }

        for joined in futures::future::join_all(writers).await {
            if let Err(join_err) = joined {
                first_error
                    .get_or_insert_with(|| format_err!("store writer panicked - {}", join_err));
            }
        }

        match first_error {
            Some(err) => Err(err),
            None if self.cancel.is_cancelled() => Err(Cancelled.into()),
            None => Ok(()),
        }
    }

    async fn walk_and_spawn(
        &self,
        source: &Path,
        snapshot_id: SnapshotId,
        counters: &Arc<BackupCounters>,
        job_tx: &mpsc::Sender<WriteJob>,
        file_slots: &Arc<Semaphore>,
        file_tasks: &mut Vec<tokio::task::JoinHandle<Result<(), Error>>>,
    ) -> Result<(), Error> {
        for entry in WalkDir::new(source).sort_by_file_name() {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let entry = entry.map_err(|err| format_err!("walking {:?} failed - {}", source, err))?;
            let file_type = entry.file_type();

            if file_type.is_dir() {
                continue;
            }

            let rel_path = entry
                .path()
                .strip_prefix(source)
                .expect("walked entries live under the source root");
            let display_path = rel_path.to_string_lossy().into_owned();

            if !file_type.is_file() {
                let reason = if file_type.is_symlink() {
                    "symlink"
                } else {
                    "not a regular file"
                };
                self.sink.emit(Event::FileSkipped {
                    path: display_path,
                    reason: reason.to_string(),
                });
                counters.files_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    self.sink.emit(Event::FileFailed {
                        path: display_path,
                        message: format!("stat failed - {}", err),
                    });
                    counters.files_failed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let mtime = metadata.mtime();
            let mode = metadata.mode() & 0o7777;

            let components: Vec<String> = rel_path
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();

            let slot = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                permit = Arc::clone(file_slots).acquire_owned() => {
                    permit.map_err(|_| format_err!("file scheduler closed"))?
                }
            };

            let job = FileJob {
                store_path: entry.path().to_owned(),
                components,
                display_path,
                mtime,
                mode,
            };

            let catalog = Arc::clone(&self.catalog);
            let hasher = Arc::clone(&self.hasher);
            let pool = Arc::clone(&self.pool);
            let sink = Arc::clone(&self.sink);
            let cancel = self.cancel.clone();
            let counters = Arc::clone(counters);
            let job_tx = job_tx.clone();
            let chunker_options = ChunkerOptions {
                chunk_size: self.options.chunk_size,
                verify: self.options.verify_chunks,
            };

            file_tasks.push(tokio::spawn(async move {
                let _slot = slot;
                backup_one_file(
                    job,
                    snapshot_id,
                    catalog,
                    hasher,
                    pool,
                    chunker_options,
                    job_tx,
                    sink,
                    cancel,
                    counters,
                )
                .await
            }));
        }

        Ok(())
    }
}

struct FileJob {
    store_path: PathBuf,
    components: Vec<String>,
    display_path: String,
    mtime: i64,
    mode: u32,
}

/// Chunk one file, wait for all its chunks to be durable, then append
/// the ordered file entry to the catalog.
///
/// Returns `Ok` with the file recorded or (after a file-level failure
/// event) dropped; returns `Err` only for failures that must abort the
/// whole backup.
#[allow(clippy::too_many_arguments)]
async fn backup_one_file(
    job: FileJob,
    snapshot_id: SnapshotId,
    catalog: Arc<Catalog>,
    hasher: Arc<Hasher>,
    pool: Arc<BufferPool>,
    chunker_options: ChunkerOptions,
    job_tx: mpsc::Sender<WriteJob>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    counters: Arc<BackupCounters>,
) -> Result<(), Error> {
    sink.emit(Event::FileStarted {
        path: job.display_path.clone(),
    });

    let mut chunker =
        match FileChunker::open(&job.store_path, &chunker_options, hasher, pool).await {
            Ok(chunker) => chunker,
            Err(err) => {
                sink.emit(Event::FileFailed {
                    path: job.display_path,
                    message: err.to_string(),
                });
                counters.files_failed.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

    let mut cites: Vec<ChunkCite> = Vec::new();
    let mut acks = Vec::new();
    let mut failed: Option<String> = None;

    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            record = chunker.next_chunk() => record,
        };
        let record = match record {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(err) => {
                // source-side failure: drop the file, keep the backup going
                failed = Some(err.to_string());
                break;
            }
        };

        cites.push(ChunkCite {
            digest: record.digest,
            length: record.length as u64,
        });

        let (ack_tx, ack_rx) = oneshot::channel();
        let send = tokio::select! {
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            send = job_tx.send(WriteJob { record, ack: ack_tx }) => send,
        };
        if send.is_err() {
            return Err(format_err!("store writers terminated early"));
        }
        acks.push(ack_rx);
    }

    let truncated = chunker.truncated();
    let logical_size = chunker.bytes_read();
    drop(chunker);

    // wait for every chunk of this file to be durable (or deduped);
    // chunks of a file dropped after a read failure stay in the store
    // unreferenced and are not credited to the result counters
    let credit = failed.is_none();
    for (cite, ack) in cites.iter().zip(acks) {
        let outcome = ack
            .await
            .map_err(|_| format_err!("store writer dropped a chunk acknowledgement"))?;
        match outcome {
            Ok(PutOutcome::Inserted) if credit => {
                counters.chunks_created.fetch_add(1, Ordering::Relaxed);
                counters
                    .bytes_newly_stored
                    .fetch_add(cite.length, Ordering::Relaxed);
                sink.emit(Event::ChunkInserted {
                    digest: cite.digest,
                    length: cite.length,
                });
            }
            Ok(PutOutcome::AlreadyPresent) if credit => {
                counters.chunks_deduped.fetch_add(1, Ordering::Relaxed);
                sink.emit(Event::ChunkDeduped { digest: cite.digest });
            }
            Ok(_) => (),
            // store-level failures abort the whole backup
            Err(err) => return Err(err.into()),
        }
    }

    if let Some(message) = failed {
        sink.emit(Event::FileFailed {
            path: job.display_path,
            message,
        });
        counters.files_failed.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }

    if truncated {
        sink.emit(Event::TruncatedRead {
            path: job.display_path.clone(),
        });
    }

    let chunk_count = cites.len() as u64;
    let entry = FileEntry {
        path: job.components,
        size: logical_size,
        mtime: job.mtime,
        mode: job.mode,
        chunks: cites,
    };

    catalog.append_file(snapshot_id, entry)?;

    counters.files_processed.fetch_add(1, Ordering::Relaxed);
    counters
        .bytes_processed
        .fetch_add(logical_size, Ordering::Relaxed);
    sink.emit(Event::FileCompleted {
        path: job.display_path,
        size: logical_size,
        chunks: chunk_count,
    });

    Ok(())
}

/// Store writer: consume chunk records, decide insert-or-skip per
/// digest, acknowledge the outcome. The chunk buffer is released here,
/// after the store is done with the bytes.
async fn store_writer(
    store: Arc<ChunkStore>,
    filter: Option<Arc<ChunkFilter>>,
    jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<WriteJob>>>,
) {
    loop {
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };
        let job = match job {
            Some(job) => job,
            None => return,
        };

        let store = Arc::clone(&store);
        let filter = filter.clone();
        let record = job.record;

        let outcome = tokio::task::spawn_blocking(move || {
            let digest = record.digest;

            // a negative filter answer is definite, skip the lookup
            let maybe_present = match filter {
                Some(ref filter) => filter.might_contain(&digest),
                None => true,
            };

            if maybe_present && store.contains(&digest)? {
                return Ok(PutOutcome::AlreadyPresent);
            }

            let outcome = store.put(&digest, record.buffer.as_slice())?;
            if outcome == PutOutcome::Inserted {
                if let Some(ref filter) = filter {
                    filter.insert(&digest);
                }
            }
            Ok(outcome)
            // record (and with it the pooled buffer) drops here
        })
        .await
        .unwrap_or_else(|join_err| {
            Err(StoreError::Other(format_err!(
                "store writer panicked - {}",
                join_err
            )))
        });

        // the file task may be gone after a failure; nothing to do then
        let _ = job.ack.send(outcome);
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
