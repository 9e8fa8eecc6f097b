//! Snapshot data model: file entries, descriptors and the canonical
//! JSON export format.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::digest::Digest;

/// Identifier of a snapshot, unique within one catalog and never
/// reused, even across restarts.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Ok(SnapshotId(s.parse::<u64>()?))
    }
}

/// One citation of a chunk by a file, with the chunk's length.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCite {
    pub digest: Digest,
    pub length: u64,
}

/// One regular file inside a snapshot.
///
/// The path is stored as components relative to the backup root;
/// concatenating the cited chunks in order reproduces the file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
    pub chunks: Vec<ChunkCite>,
}

impl FileEntry {
    /// Validate internal consistency: sane path components and chunk
    /// lengths summing to the logical size.
    pub fn check(&self) -> Result<(), Error> {
        if self.path.is_empty() {
            bail!("file entry with empty path");
        }
        for component in &self.path {
            if component.is_empty()
                || component == "."
                || component == ".."
                || component.contains('/')
                || component.contains('\0')
            {
                bail!("invalid path component {:?}", component);
            }
        }

        let total: u64 = self.chunks.iter().map(|c| c.length).sum();
        if total != self.size {
            bail!(
                "chunk lengths of {:?} sum to {} but size is {}",
                self.path,
                total,
                self.size
            );
        }
        Ok(())
    }

    /// The entry's path as a relative [`PathBuf`].
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::new();
        for component in &self.path {
            path.push(component);
        }
        path
    }

    pub fn display_path(&self) -> String {
        self.path.join("/")
    }
}

/// A sealed (or in-progress) snapshot with its full file listing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub root: String,
    pub created_at: i64,
    pub files: Vec<FileEntry>,
}

impl Snapshot {
    pub fn logical_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Canonical JSON export of the snapshot:
    ///
    /// ```json
    /// { "id": "...", "root": "...", "created_at": <unix-seconds>,
    ///   "files": [ { "path": ["a","b"], "size": 1, "mtime": 1, "mode": 420,
    ///                "chunks": ["<hex>", ...] } ] }
    /// ```
    pub fn to_canonical_json(&self) -> Value {
        json!({
            "id": self.id.to_string(),
            "root": self.root,
            "created_at": self.created_at,
            "files": self
                .files
                .iter()
                .map(|file| {
                    json!({
                        "path": file.path,
                        "size": file.size,
                        "mtime": file.mtime,
                        "mode": file.mode,
                        "chunks": file
                            .chunks
                            .iter()
                            .map(|c| Value::String(c.digest.to_hex()))
                            .collect::<Vec<_>>(),
                    })
                })
                .collect::<Vec<_>>(),
        })
    }

    pub fn descriptor(&self) -> SnapshotDescriptor {
        SnapshotDescriptor {
            id: self.id,
            root: self.root.clone(),
            created_at: self.created_at,
            file_count: self.files.len() as u64,
            logical_bytes: self.logical_bytes(),
        }
    }
}

/// Summary of a sealed snapshot, as returned by listing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub id: SnapshotId,
    pub root: String,
    pub created_at: i64,
    pub file_count: u64,
    pub logical_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Hasher;

    fn entry(path: &[&str], sizes: &[u64]) -> FileEntry {
        let hasher = Hasher::unkeyed();
        let chunks: Vec<ChunkCite> = sizes
            .iter()
            .enumerate()
            .map(|(i, &length)| ChunkCite {
                digest: hasher.hash_bytes(&(i as u64).to_le_bytes()),
                length,
            })
            .collect();
        FileEntry {
            path: path.iter().map(|s| s.to_string()).collect(),
            size: sizes.iter().sum(),
            mtime: 1_700_000_000,
            mode: 0o644,
            chunks,
        }
    }

    #[test]
    fn check_accepts_consistent_entries() {
        entry(&["a", "b", "c.bin"], &[1024, 7]).check().unwrap();
        entry(&["empty"], &[]).check().unwrap();
    }

    #[test]
    fn check_rejects_bad_paths_and_lengths() {
        assert!(entry(&[], &[]).check().is_err());
        assert!(entry(&[".."], &[]).check().is_err());
        assert!(entry(&["a/b"], &[]).check().is_err());

        let mut broken = entry(&["f"], &[100]);
        broken.size = 99;
        assert!(broken.check().is_err());
    }

    #[test]
    fn canonical_json_matches_schema() {
        let snapshot = Snapshot {
            id: SnapshotId(7),
            root: "/data".into(),
            created_at: 1_700_000_000,
            files: vec![entry(&["a", "c.bin"], &[1234])],
        };

        let value = snapshot.to_canonical_json();
        assert_eq!(value["id"], "7");
        assert_eq!(value["root"], "/data");
        assert_eq!(value["files"][0]["path"][1], "c.bin");
        assert_eq!(value["files"][0]["size"], 1234);
        assert!(value["files"][0]["chunks"][0].as_str().unwrap().len() == 64);
    }

    #[test]
    fn snapshot_id_parses_back() {
        let id: SnapshotId = "42".parse().unwrap();
        assert_eq!(id, SnapshotId(42));
        assert!("x7".parse::<SnapshotId>().is_err());
    }
}
