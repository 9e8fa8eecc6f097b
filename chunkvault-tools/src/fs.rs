//! Small filesystem helpers shared by the store and the catalog.

use std::fs::File;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, format_err, Error};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique temporary file path inside `dir`.
pub fn make_tmp_path<P: AsRef<Path>>(dir: P, prefix: &str) -> PathBuf {
    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}.{}.{}.tmp", prefix, std::process::id(), seq);
    dir.as_ref().join(name)
}

/// Atomically replace the file at `path` with `data`.
///
/// Writes to a temporary file in the same directory, optionally fsyncs
/// it, then renames into place. After a successful rename the new
/// content is visible under `path`; a crash before the rename leaves
/// the old content untouched.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8], fsync: bool) -> Result<(), Error> {
    let path = path.as_ref();
    let dir = path
        .parent()
        .ok_or_else(|| format_err!("replace_file {:?} has no parent directory", path))?;

    let tmp_path = make_tmp_path(dir, ".replace");

    let mut file = File::create(&tmp_path)
        .map_err(|err| format_err!("unable to create {:?} - {}", tmp_path, err))?;

    let result: Result<(), Error> = (|| {
        file.write_all(data)?;
        if fsync {
            nix::unistd::fsync(file.as_raw_fd())?;
        }
        Ok(())
    })();

    if let Err(err) = result {
        let _ = std::fs::remove_file(&tmp_path);
        bail!("writing {:?} failed - {}", tmp_path, err);
    }

    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        bail!("atomic rename {:?} failed - {}", path, err);
    }

    if fsync {
        fsync_dir(dir)?;
    }

    Ok(())
}

/// Fsync a directory handle so a previous rename within it is durable.
pub fn fsync_dir<P: AsRef<Path>>(dir: P) -> Result<(), Error> {
    let dir = dir.as_ref();
    let handle =
        File::open(dir).map_err(|err| format_err!("unable to open dir {:?} - {}", dir, err))?;
    nix::unistd::fsync(handle.as_raw_fd())
        .map_err(|err| format_err!("fsync {:?} failed - {}", dir, err))?;
    Ok(())
}

/// Set access and modification time (seconds precision) on `path`.
pub fn set_mtime<P: AsRef<Path>>(path: P, mtime: i64) -> Result<(), Error> {
    let path = path.as_ref();

    let times: [libc::timespec; 2] = [
        libc::timespec {
            tv_sec: mtime,
            tv_nsec: 0,
        },
        libc::timespec {
            tv_sec: mtime,
            tv_nsec: 0,
        },
    ];

    use nix::NixPath;

    let res = path.with_nix_path(|cstr| unsafe {
        let tmp = libc::utimensat(libc::AT_FDCWD, cstr.as_ptr(), &times[0], 0);
        nix::errno::Errno::result(tmp)
    })?;

    if let Err(err) = res {
        bail!("utimensat {:?} failed - {}", path, err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_file_is_atomic_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.bin");

        replace_file(&target, b"first", false).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"first");

        replace_file(&target, b"second", true).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"second");

        // no stray temp files left behind
        let stray: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "data.bin")
            .collect();
        assert!(stray.is_empty());
    }

    #[test]
    fn set_mtime_applies_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("stamped");
        std::fs::write(&target, b"x").unwrap();

        set_mtime(&target, 1_700_000_000).unwrap();

        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(&target).unwrap();
        assert_eq!(meta.mtime(), 1_700_000_000);
    }
}
