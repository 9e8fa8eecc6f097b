//! Durable snapshot catalog.
//!
//! The catalog is an append-only journal of JSON records plus an
//! in-memory view rebuilt by replay on open. A snapshot becomes
//! durable at seal time: the seal record is fsynced, the per-digest
//! reference counts are committed and a canonical JSON export is
//! materialized. Snapshots that were begun but never sealed (crash,
//! cancellation) are rolled back in full on the next open and the
//! journal is compacted; their file entries never contribute to
//! reference counts. Snapshot ids are allocated from a high-water
//! mark that is itself journaled, so an id is never reused.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};

use chunkvault_tools::fs::replace_file;

use crate::digest::Digest;
use crate::snapshot::{FileEntry, Snapshot, SnapshotDescriptor, SnapshotId};

const JOURNAL_FILE_NAME: &str = "journal.jsonl";
const SNAPSHOT_DIR_NAME: &str = "snapshots";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("snapshot {0} is sealed")]
    SealedSnapshot(SnapshotId),
    #[error("unknown snapshot {0}")]
    UnknownSnapshot(SnapshotId),
    #[error("catalog I/O error - {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(#[from] Error),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "kebab-case")]
enum JournalRecord {
    /// High-water mark for id allocation; written on compaction.
    NextId { next: u64 },
    Begin {
        id: SnapshotId,
        root: String,
        created_at: i64,
    },
    AppendFile {
        id: SnapshotId,
        entry: FileEntry,
    },
    Seal { id: SnapshotId },
    Rollback { id: SnapshotId },
}

#[derive(Clone, Debug, Default)]
struct DigestEntry {
    length: u64,
    ref_count: u64,
}

struct SnapshotState {
    snapshot: Snapshot,
    sealed: bool,
}

/// Catalog statistics, exactly derivable from the stored relations.
#[derive(Clone, Debug)]
pub struct IndexStats {
    pub snapshot_count: u64,
    pub distinct_digests: u64,
    pub total_references: u64,
    pub total_logical_bytes: u64,
    pub total_stored_bytes: u64,
    pub deduplication_ratio: f64,
}

struct CatalogInner {
    next_id: u64,
    snapshots: BTreeMap<u64, SnapshotState>,
    digests: BTreeMap<Digest, DigestEntry>,
    journal: File,
}

/// Transactional snapshot catalog backed by a journal directory.
pub struct Catalog {
    dir: PathBuf,
    inner: Mutex<CatalogInner>,
}

impl Catalog {
    /// Open (or initialize) the catalog at `dir`, replaying the
    /// journal and rolling back any snapshot left unsealed.
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self, CatalogError> {
        let dir: PathBuf = dir.into();
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(dir.join(SNAPSHOT_DIR_NAME))?;

        let journal_path = dir.join(JOURNAL_FILE_NAME);

        let mut next_id = 1u64;
        let mut snapshots: BTreeMap<u64, SnapshotState> = BTreeMap::new();
        let mut digests: BTreeMap<Digest, DigestEntry> = BTreeMap::new();
        let mut dirty = false;

        if journal_path.exists() {
            let text = std::fs::read_to_string(&journal_path)?;
            for line in text.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let record: JournalRecord = match serde_json::from_str(line) {
                    Ok(record) => record,
                    Err(err) => {
                        // torn tail from a crash mid-append
                        log::warn!("catalog journal has trailing garbage - {}", err);
                        dirty = true;
                        break;
                    }
                };
                match record {
                    JournalRecord::NextId { next } => {
                        next_id = next_id.max(next);
                    }
                    JournalRecord::Begin {
                        id,
                        root,
                        created_at,
                    } => {
                        next_id = next_id.max(id.0 + 1);
                        snapshots.insert(
                            id.0,
                            SnapshotState {
                                snapshot: Snapshot {
                                    id,
                                    root,
                                    created_at,
                                    files: Vec::new(),
                                },
                                sealed: false,
                            },
                        );
                    }
                    JournalRecord::AppendFile { id, entry } => {
                        match snapshots.get_mut(&id.0) {
                            Some(state) if !state.sealed => state.snapshot.files.push(entry),
                            _ => {
                                log::warn!("stray file record for snapshot {}", id);
                                dirty = true;
                            }
                        }
                    }
                    JournalRecord::Seal { id } => match snapshots.get_mut(&id.0) {
                        Some(state) if !state.sealed => {
                            state.sealed = true;
                            for entry in &state.snapshot.files {
                                commit_references(&mut digests, entry);
                            }
                        }
                        _ => {
                            log::warn!("stray seal record for snapshot {}", id);
                            dirty = true;
                        }
                    },
                    JournalRecord::Rollback { id } => {
                        snapshots.remove(&id.0);
                        dirty = true;
                    }
                }
            }
        }

        // roll back whatever was begun but never sealed
        let unsealed: Vec<u64> = snapshots
            .iter()
            .filter(|(_, state)| !state.sealed)
            .map(|(&id, _)| id)
            .collect();
        for id in unsealed {
            log::info!("rolling back unsealed snapshot {}", id);
            snapshots.remove(&id);
            dirty = true;
        }

        if dirty {
            Self::compact(&journal_path, next_id, &snapshots)?;
        }

        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)?;

        let catalog = Self {
            dir,
            inner: Mutex::new(CatalogInner {
                next_id,
                snapshots,
                digests,
                journal,
            }),
        };

        catalog.ensure_exports()?;

        Ok(catalog)
    }

    /// Rewrite the journal to contain only sealed snapshots (plus the
    /// id high-water mark).
    fn compact(
        journal_path: &Path,
        next_id: u64,
        snapshots: &BTreeMap<u64, SnapshotState>,
    ) -> Result<(), CatalogError> {
        let mut out = Vec::new();

        append_record(&mut out, &JournalRecord::NextId { next: next_id })?;
        for state in snapshots.values() {
            debug_assert!(state.sealed);
            let snapshot = &state.snapshot;
            append_record(
                &mut out,
                &JournalRecord::Begin {
                    id: snapshot.id,
                    root: snapshot.root.clone(),
                    created_at: snapshot.created_at,
                },
            )?;
            for entry in &snapshot.files {
                append_record(
                    &mut out,
                    &JournalRecord::AppendFile {
                        id: snapshot.id,
                        entry: entry.clone(),
                    },
                )?;
            }
            append_record(&mut out, &JournalRecord::Seal { id: snapshot.id })?;
        }

        replace_file(journal_path, &out, true).map_err(CatalogError::Other)
    }

    /// Make sure every sealed snapshot has its canonical JSON export,
    /// e.g. after a crash between seal and export.
    fn ensure_exports(&self) -> Result<(), CatalogError> {
        let inner = self.inner.lock().unwrap();
        for state in inner.snapshots.values() {
            if !state.sealed {
                continue;
            }
            let path = self.snapshot_export_path(state.snapshot.id);
            if !path.exists() {
                write_export(&path, &state.snapshot)?;
            }
        }
        Ok(())
    }

    fn snapshot_export_path(&self, id: SnapshotId) -> PathBuf {
        self.dir
            .join(SNAPSHOT_DIR_NAME)
            .join(format!("{}.json", id))
    }

    /// Start a new, unsealed snapshot and durably allocate its id.
    pub fn begin_snapshot(&self, root: &str, created_at: i64) -> Result<SnapshotId, CatalogError> {
        let mut inner = self.inner.lock().unwrap();

        let id = SnapshotId(inner.next_id);
        inner.next_id += 1;

        write_record(
            &mut inner.journal,
            &JournalRecord::Begin {
                id,
                root: root.to_owned(),
                created_at,
            },
        )?;
        // the id allocation must survive a crash, never to be reused
        inner.journal.sync_all()?;

        inner.snapshots.insert(
            id.0,
            SnapshotState {
                snapshot: Snapshot {
                    id,
                    root: root.to_owned(),
                    created_at,
                    files: Vec::new(),
                },
                sealed: false,
            },
        );

        Ok(id)
    }

    /// Record one file entry for an unsealed snapshot.
    pub fn append_file(&self, id: SnapshotId, entry: FileEntry) -> Result<(), CatalogError> {
        entry.check().map_err(CatalogError::Other)?;

        let mut inner = self.inner.lock().unwrap();

        match inner.snapshots.get(&id.0) {
            None => return Err(CatalogError::UnknownSnapshot(id)),
            Some(state) if state.sealed => return Err(CatalogError::SealedSnapshot(id)),
            Some(_) => (),
        }

        write_record(
            &mut inner.journal,
            &JournalRecord::AppendFile {
                id,
                entry: entry.clone(),
            },
        )?;

        inner
            .snapshots
            .get_mut(&id.0)
            .expect("checked above")
            .snapshot
            .files
            .push(entry);

        Ok(())
    }

    /// Atomically transition a snapshot to sealed.
    ///
    /// The fsynced seal record is the commit point; afterwards the
    /// snapshot is visible to readers, immutable, and its chunk
    /// citations are counted.
    pub fn seal_snapshot(&self, id: SnapshotId) -> Result<(), CatalogError> {
        let mut inner = self.inner.lock().unwrap();

        match inner.snapshots.get(&id.0) {
            None => return Err(CatalogError::UnknownSnapshot(id)),
            Some(state) if state.sealed => return Err(CatalogError::SealedSnapshot(id)),
            Some(_) => (),
        }

        write_record(&mut inner.journal, &JournalRecord::Seal { id })?;
        inner.journal.sync_all()?;

        let inner = &mut *inner;
        let state = inner.snapshots.get_mut(&id.0).expect("checked above");
        state.sealed = true;
        for entry in &state.snapshot.files {
            commit_references(&mut inner.digests, entry);
        }

        write_export(&self.snapshot_export_path(id), &state.snapshot)?;

        Ok(())
    }

    /// Discard an unsealed snapshot.
    pub fn rollback_snapshot(&self, id: SnapshotId) -> Result<(), CatalogError> {
        let mut inner = self.inner.lock().unwrap();

        match inner.snapshots.get(&id.0) {
            None => return Err(CatalogError::UnknownSnapshot(id)),
            Some(state) if state.sealed => return Err(CatalogError::SealedSnapshot(id)),
            Some(_) => (),
        }

        write_record(&mut inner.journal, &JournalRecord::Rollback { id })?;
        inner.snapshots.remove(&id.0);

        Ok(())
    }

    /// Descriptors of all sealed snapshots, in id order.
    pub fn list_snapshots(&self) -> Vec<SnapshotDescriptor> {
        let inner = self.inner.lock().unwrap();
        inner
            .snapshots
            .values()
            .filter(|state| state.sealed)
            .map(|state| state.snapshot.descriptor())
            .collect()
    }

    /// Load a sealed snapshot in full.
    pub fn load_snapshot(&self, id: SnapshotId) -> Result<Snapshot, CatalogError> {
        let inner = self.inner.lock().unwrap();
        match inner.snapshots.get(&id.0) {
            Some(state) if state.sealed => Ok(state.snapshot.clone()),
            _ => Err(CatalogError::UnknownSnapshot(id)),
        }
    }

    /// Number of (snapshot, file, position) citations of `digest`
    /// across all sealed snapshots.
    pub fn digest_ref_count(&self, digest: &Digest) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .digests
            .get(digest)
            .map(|entry| entry.ref_count)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> IndexStats {
        let inner = self.inner.lock().unwrap();

        let sealed = inner.snapshots.values().filter(|s| s.sealed);
        let total_logical_bytes: u64 = sealed.clone().map(|s| s.snapshot.logical_bytes()).sum();
        let total_stored_bytes: u64 = inner.digests.values().map(|d| d.length).sum();
        let total_references: u64 = inner.digests.values().map(|d| d.ref_count).sum();

        let deduplication_ratio = if total_stored_bytes == 0 {
            1.0
        } else {
            total_logical_bytes as f64 / total_stored_bytes as f64
        };

        IndexStats {
            snapshot_count: sealed.count() as u64,
            distinct_digests: inner.digests.len() as u64,
            total_references,
            total_logical_bytes,
            total_stored_bytes,
            deduplication_ratio,
        }
    }

    /// Flush and quiesce.
    pub fn close(&self) -> Result<(), CatalogError> {
        let inner = self.inner.lock().unwrap();
        inner.journal.sync_all()?;
        Ok(())
    }
}

fn commit_references(digests: &mut BTreeMap<Digest, DigestEntry>, entry: &FileEntry) {
    for cite in &entry.chunks {
        let slot = digests.entry(cite.digest).or_insert(DigestEntry {
            length: cite.length,
            ref_count: 0,
        });
        if slot.length != cite.length {
            log::warn!(
                "digest {} cited with length {} but recorded as {}",
                cite.digest,
                cite.length,
                slot.length
            );
        }
        slot.ref_count += 1;
    }
}

fn append_record(out: &mut Vec<u8>, record: &JournalRecord) -> Result<(), CatalogError> {
    let line = serde_json::to_string(record)
        .map_err(|err| CatalogError::Other(format_err!("journal encode failed - {}", err)))?;
    out.extend_from_slice(line.as_bytes());
    out.push(b'\n');
    Ok(())
}

fn write_record(journal: &mut File, record: &JournalRecord) -> Result<(), CatalogError> {
    let mut line = serde_json::to_string(record)
        .map_err(|err| CatalogError::Other(format_err!("journal encode failed - {}", err)))?;
    line.push('\n');
    journal.write_all(line.as_bytes())?;
    Ok(())
}

fn write_export(path: &Path, snapshot: &Snapshot) -> Result<(), CatalogError> {
    let text = serde_json::to_string_pretty(&snapshot.to_canonical_json())
        .map_err(|err| CatalogError::Other(format_err!("snapshot encode failed - {}", err)))?;
    replace_file(path, text.as_bytes(), true).map_err(CatalogError::Other)
}
