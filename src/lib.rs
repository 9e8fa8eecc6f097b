//! Content-addressed deduplicating backup engine.
//!
//! Splits source files into fixed-size chunks identified by their
//! digest, stores each distinct chunk exactly once and records
//! snapshots of file trees in a durable catalog. See the `backup`,
//! `restore` and `verify` modules for the orchestrators on top of
//! [`chunkvault_datastore`].

pub mod backup;
pub mod events;
pub mod restore;
pub mod verify;

pub use backup::{BackupOptions, BackupResult, BackupTask};
pub use events::{Event, EventSink, LogEventSink, NullEventSink};
pub use restore::{RestoreOptions, RestoreResult, RestoreTask, TargetExists};
pub use verify::{verify_snapshot, VerifyResult};

/// Cooperative cancellation surfaced as an error.
#[derive(Debug, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;
