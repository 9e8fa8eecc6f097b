//! Snapshot verification.
//!
//! Re-reads every chunk a sealed snapshot references and checks it
//! against its digest and recorded length. The chunk reads run on a
//! small pool of verifier threads fed from a bounded channel; corrupt
//! or missing chunks are tallied and the scan keeps going, so one
//! damaged chunk does not hide the rest. Hard store errors (anything
//! that is not plain damage) are latched, stop the feed and fail the
//! verification.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{format_err, Error};
use crossbeam_channel::{bounded, Sender};

use chunkvault_datastore::{Catalog, ChunkCite, ChunkStore, SnapshotId, StoreError};

#[derive(Clone, Debug, Default)]
pub struct VerifyResult {
    pub files_checked: u64,
    pub chunks_verified: u64,
    pub bytes_verified: u64,
    pub corrupt_chunks: u64,
    pub missing_chunks: u64,
}

impl VerifyResult {
    pub fn is_ok(&self) -> bool {
        self.corrupt_chunks == 0 && self.missing_chunks == 0
    }
}

#[derive(Default)]
struct VerifyTally {
    chunks_verified: AtomicU64,
    bytes_verified: AtomicU64,
    corrupt_chunks: AtomicU64,
    missing_chunks: AtomicU64,
}

/// Worker pool re-reading cited chunks from the store.
///
/// Each worker pulls `ChunkCite`s off the shared queue, fetches the
/// chunk (the store verifies the digest on read) and classifies the
/// outcome into the tally. A worker that hits a hard store error
/// latches it and exits; once every worker is gone, queuing fails and
/// `finish` surfaces the latched error.
struct ChunkVerifier {
    workers: Vec<JoinHandle<()>>,
    queue: Option<Sender<ChunkCite>>,
    tally: Arc<VerifyTally>,
    hard_error: Arc<Mutex<Option<StoreError>>>,
}

impl ChunkVerifier {
    fn spawn(store: Arc<ChunkStore>, threads: usize) -> Self {
        let threads = threads.max(1);
        let (queue, jobs) = bounded::<ChunkCite>(threads * 2);
        let tally = Arc::new(VerifyTally::default());
        let hard_error: Arc<Mutex<Option<StoreError>>> = Arc::new(Mutex::new(None));

        let mut workers = Vec::new();
        for i in 0..threads {
            let jobs = jobs.clone();
            let store = Arc::clone(&store);
            let tally = Arc::clone(&tally);
            let hard_error = Arc::clone(&hard_error);

            workers.push(
                std::thread::Builder::new()
                    .name(format!("verify chunk ({})", i))
                    .spawn(move || {
                        while let Ok(cite) = jobs.recv() {
                            match store.get(&cite.digest) {
                                Ok(data) => {
                                    if data.len() as u64 == cite.length {
                                        tally.chunks_verified.fetch_add(1, Ordering::Relaxed);
                                        tally.bytes_verified.fetch_add(cite.length, Ordering::Relaxed);
                                    } else {
                                        log::error!(
                                            "chunk {} has length {} but the snapshot cites {}",
                                            cite.digest,
                                            data.len(),
                                            cite.length
                                        );
                                        tally.corrupt_chunks.fetch_add(1, Ordering::Relaxed);
                                    }
                                }
                                Err(StoreError::Missing(_)) => {
                                    log::error!("chunk {} is missing", cite.digest);
                                    tally.missing_chunks.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(StoreError::IntegrityFailure(_)) => {
                                    log::error!("chunk {} is corrupt", cite.digest);
                                    tally.corrupt_chunks.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(err) => {
                                    let mut guard = hard_error.lock().unwrap();
                                    if guard.is_none() {
                                        *guard = Some(err);
                                    }
                                    return;
                                }
                            }
                        }
                    })
                    .unwrap(),
            );
        }

        Self {
            workers,
            queue: Some(queue),
            tally,
            hard_error,
        }
    }

    /// Hand one citation to the pool; blocks while the queue is full.
    fn push(&self, cite: ChunkCite) -> Result<(), Error> {
        if self.hard_error.lock().unwrap().is_some() {
            return Err(format_err!("verification aborted on a store error"));
        }
        self.queue
            .as_ref()
            .expect("queue open until finish")
            .send(cite)
            .map_err(|_| format_err!("verification workers exited early"))
    }

    /// Drain the queue, join the workers and report the tally.
    fn finish(mut self) -> Result<Arc<VerifyTally>, Error> {
        drop(self.queue.take());

        let mut panicked = 0;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(format_err!("{} verification workers panicked", panicked));
        }

        if let Some(err) = self.hard_error.lock().unwrap().take() {
            return Err(err.into());
        }

        Ok(Arc::clone(&self.tally))
    }
}

// join the workers even when verification bails out early
impl Drop for ChunkVerifier {
    fn drop(&mut self) {
        drop(self.queue.take());
        while let Some(worker) = self.workers.pop() {
            let _ = worker.join();
        }
    }
}

/// Verify all chunks referenced by snapshot `snapshot_id`.
///
/// Each distinct digest is read and checked once, on `threads` worker
/// threads. Hard I/O errors abort; corruption and missing chunks are
/// tallied in the result.
pub fn verify_snapshot(
    store: Arc<ChunkStore>,
    catalog: &Catalog,
    snapshot_id: SnapshotId,
    threads: usize,
) -> Result<VerifyResult, Error> {
    let snapshot = catalog.load_snapshot(snapshot_id)?;

    let verifier = ChunkVerifier::spawn(store, threads);

    let mut files_checked = 0u64;
    let mut seen = HashSet::new();

    for entry in &snapshot.files {
        for cite in &entry.chunks {
            if seen.insert(cite.digest) {
                verifier.push(cite.clone())?;
            }
        }
        files_checked += 1;
    }

    let tally = verifier.finish()?;

    let result = VerifyResult {
        files_checked,
        chunks_verified: tally.chunks_verified.load(Ordering::Relaxed),
        bytes_verified: tally.bytes_verified.load(Ordering::Relaxed),
        corrupt_chunks: tally.corrupt_chunks.load(Ordering::Relaxed),
        missing_chunks: tally.missing_chunks.load(Ordering::Relaxed),
    };

    if result.is_ok() {
        log::info!(
            "snapshot {} verified: {} files, {} chunks, {} bytes",
            snapshot_id,
            result.files_checked,
            result.chunks_verified,
            result.bytes_verified
        );
    } else {
        log::error!(
            "snapshot {} has {} corrupt and {} missing chunks",
            snapshot_id,
            result.corrupt_chunks,
            result.missing_chunks
        );
    }

    Ok(result)
}
