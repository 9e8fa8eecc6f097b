//! Progress observer interface of the orchestrators.
//!
//! Worker tasks report through a single sink; implementations must be
//! thread-safe since events arrive from any worker context.

use chunkvault_datastore::Digest;

#[derive(Clone, Debug)]
pub enum Event {
    FileStarted {
        path: String,
    },
    FileCompleted {
        path: String,
        size: u64,
        chunks: u64,
    },
    /// Non-regular directory entry (symlink, socket, device) left out
    /// of the snapshot.
    FileSkipped {
        path: String,
        reason: String,
    },
    /// File-level failure; the file is omitted from the snapshot.
    FileFailed {
        path: String,
        message: String,
    },
    ChunkInserted {
        digest: Digest,
        length: u64,
    },
    ChunkDeduped {
        digest: Digest,
    },
    /// The source file shrank while being read; the snapshot holds the
    /// shortened content.
    TruncatedRead {
        path: String,
    },
    Error {
        message: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Default sink forwarding events to the `log` crate.
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: Event) {
        match event {
            Event::FileStarted { path } => log::debug!("processing {}", path),
            Event::FileCompleted { path, size, chunks } => {
                log::debug!("completed {} ({} bytes, {} chunks)", path, size, chunks)
            }
            Event::FileSkipped { path, reason } => log::info!("skipping {} ({})", path, reason),
            Event::FileFailed { path, message } => log::warn!("failed {} - {}", path, message),
            Event::ChunkInserted { digest, length } => {
                log::trace!("new chunk {} ({} bytes)", digest, length)
            }
            Event::ChunkDeduped { digest } => log::trace!("known chunk {}", digest),
            Event::TruncatedRead { path } => {
                log::warn!("{} shrank while being read, stored the shortened content", path)
            }
            Event::Error { message } => log::error!("{}", message),
        }
    }
}

/// Sink that drops everything, for tests and embedding.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: Event) {}
}
