//! Command line front-end for the backup engine.
//!
//! Exit codes: 0 success, 2 usage error, 3 I/O error, 4 integrity
//! failure, 5 not found.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{format_err, Error};
use clap::{Parser, Subcommand};

use chunkvault::{
    verify_snapshot, BackupOptions, BackupTask, RestoreOptions, RestoreTask, TargetExists,
};
use chunkvault_datastore::{
    Catalog, CatalogError, ChunkFilter, ChunkStore, ChunkStoreConfig, Hasher, SnapshotId,
    StoreError,
};
use chunkvault_tools::buffer_pool::{BufferPool, BufferPoolConfig};
use chunkvault_tools::format::{render_bytes, render_speed};

#[derive(Parser)]
#[command(name = "chunkvault", about = "Content-addressed deduplicating backup engine")]
struct Cli {
    /// Content store directory (defaults to $STORE_DIR)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Metadata index directory (defaults to $INDEX_PATH)
    #[arg(long, global = true)]
    index: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a directory tree into a new snapshot
    Backup {
        source: PathBuf,

        /// Chunk size in bytes
        #[arg(long, default_value_t = 4 * 1024 * 1024)]
        chunk_size: usize,

        /// Rehash chunks after reading
        #[arg(long)]
        verify: bool,

        /// Files chunked concurrently
        #[arg(long, default_value_t = 4)]
        parallel_files: usize,

        /// Concurrent store writers
        #[arg(long, default_value_t = 8)]
        parallel_chunks: usize,

        /// Key the chunk digests with this seed
        #[arg(long)]
        seed: Option<String>,

        /// Skip the membership filter optimization
        #[arg(long)]
        no_filter: bool,
    },
    /// Restore a snapshot into a target directory
    Restore {
        snapshot_id: u64,
        target: PathBuf,

        /// Replace existing files in the target
        #[arg(long)]
        overwrite: bool,

        /// Skip digest re-verification of restored chunks
        #[arg(long)]
        no_verify: bool,

        /// Digest seed the snapshot was created with
        #[arg(long)]
        seed: Option<String>,
    },
    /// List sealed snapshots and catalog statistics
    Snapshots {
        /// Emit the snapshot list as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-read and verify every chunk a snapshot references
    Verify {
        snapshot_id: u64,

        /// Verification worker threads
        #[arg(long, default_value_t = 4)]
        threads: usize,

        /// Digest seed the snapshot was created with
        #[arg(long)]
        seed: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct UsageError(String);

fn resolve_dir(flag: Option<PathBuf>, env_var: &str, what: &str) -> Result<PathBuf, Error> {
    flag.or_else(|| std::env::var_os(env_var).map(PathBuf::from))
        .ok_or_else(|| {
            UsageError(format!(
                "no {} configured - pass --{} or set ${}",
                what,
                what.replace(' ', "-"),
                env_var
            ))
            .into()
        })
}

fn make_hasher(seed: &Option<String>) -> Result<Arc<Hasher>, Error> {
    Ok(Arc::new(match seed {
        Some(seed) => Hasher::with_seed(seed.as_bytes())?,
        None => Hasher::unkeyed(),
    }))
}

fn exit_code(err: &Error) -> i32 {
    if let Some(store_err) = err.downcast_ref::<StoreError>() {
        return match store_err {
            StoreError::IntegrityFailure(_)
            | StoreError::DigestCollision(_)
            | StoreError::Poisoned => 4,
            StoreError::Missing(_) => 5,
            _ => 3,
        };
    }
    if let Some(catalog_err) = err.downcast_ref::<CatalogError>() {
        return match catalog_err {
            CatalogError::UnknownSnapshot(_) => 5,
            CatalogError::SealedSnapshot(_) => 2,
            _ => 3,
        };
    }
    if err.downcast_ref::<TargetExists>().is_some() || err.downcast_ref::<UsageError>().is_some() {
        return 2;
    }
    3
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            std::process::exit(exit_code(&err));
        }
    }
}

async fn run(cli: Cli) -> Result<i32, Error> {
    let store_dir = resolve_dir(cli.store, "STORE_DIR", "store")?;
    let index_dir = resolve_dir(cli.index, "INDEX_PATH", "index")?;

    match cli.command {
        Commands::Backup {
            source,
            chunk_size,
            verify,
            parallel_files,
            parallel_chunks,
            seed,
            no_filter,
        } => {
            if chunk_size == 0 {
                return Err(UsageError("chunk size must be non-zero".into()).into());
            }

            let hasher = make_hasher(&seed)?;
            let store = Arc::new(ChunkStore::open_or_create(
                &store_dir,
                ChunkStoreConfig::default(),
                Arc::clone(&hasher),
            )?);
            let catalog = Arc::new(Catalog::open(&index_dir)?);
            let pool = Arc::new(BufferPool::new(BufferPoolConfig::default())?);

            let options = BackupOptions {
                chunk_size,
                verify_chunks: verify,
                max_parallel_files: parallel_files,
                max_parallel_chunks: parallel_chunks,
            };

            let mut task = BackupTask::new(
                Arc::clone(&store),
                Arc::clone(&catalog),
                hasher,
                pool,
                options,
            );

            if !no_filter {
                let filter = ChunkFilter::load_or_rebuild(&store, 1_000_000, 0.01)?;
                task = task.with_filter(Arc::new(filter));
            }

            let cancel = tokio_util::sync::CancellationToken::new();
            let signal_token = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("interrupted, draining in-flight work");
                    signal_token.cancel();
                }
            });
            task = task.with_cancel(cancel);

            let result = task.run(&source).await?;
            let seconds = result.duration.as_secs_f64();
            let stats = catalog.stats();

            println!("snapshot {} sealed", result.snapshot_id);
            println!(
                "processed {} files, {} ({})",
                result.files_processed,
                render_bytes(result.bytes_processed),
                render_speed(result.bytes_processed, seconds),
            );
            println!(
                "chunks: {} new ({}), {} deduplicated",
                result.chunks_created,
                render_bytes(result.bytes_newly_stored),
                result.chunks_deduped,
            );
            if result.files_skipped > 0 || result.files_failed > 0 {
                println!(
                    "skipped {} entries, failed {} files",
                    result.files_skipped, result.files_failed
                );
            }
            println!("deduplication ratio: {:.2}", stats.deduplication_ratio);

            Ok(0)
        }

        Commands::Restore {
            snapshot_id,
            target,
            overwrite,
            no_verify,
            seed,
        } => {
            let hasher = make_hasher(&seed)?;
            let store = Arc::new(ChunkStore::open(
                &store_dir,
                ChunkStoreConfig::default(),
                Arc::clone(&hasher),
            )?);
            let catalog = Arc::new(Catalog::open(&index_dir)?);

            let options = RestoreOptions {
                overwrite_existing: overwrite,
                verify_integrity: !no_verify,
            };

            let task = RestoreTask::new(store, catalog, hasher, options);
            let result = task.run(SnapshotId(snapshot_id), &target).await?;
            let seconds = result.duration.as_secs_f64();

            println!(
                "restored {} files, {} ({}) from {} chunks",
                result.files_restored,
                render_bytes(result.bytes_restored),
                render_speed(result.bytes_restored, seconds),
                result.chunks_read,
            );

            Ok(0)
        }

        Commands::Snapshots { json } => {
            let catalog = Catalog::open(&index_dir)?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&catalog.list_snapshots())?
                );
                return Ok(0);
            }

            for descriptor in catalog.list_snapshots() {
                println!(
                    "{:>8}  {:>12}  {:>10} files  {}",
                    descriptor.id.to_string(),
                    render_bytes(descriptor.logical_bytes),
                    descriptor.file_count,
                    descriptor.root,
                );
            }

            let stats = catalog.stats();
            println!(
                "{} snapshots, {} referenced / {} stored, deduplication ratio {:.2}",
                stats.snapshot_count,
                render_bytes(stats.total_logical_bytes),
                render_bytes(stats.total_stored_bytes),
                stats.deduplication_ratio,
            );

            Ok(0)
        }

        Commands::Verify {
            snapshot_id,
            threads,
            seed,
        } => {
            let hasher = make_hasher(&seed)?;
            let store = Arc::new(ChunkStore::open(
                &store_dir,
                ChunkStoreConfig::default(),
                hasher,
            )?);
            let catalog = Catalog::open(&index_dir)?;

            let store_for_verify = Arc::clone(&store);
            let result = tokio::task::spawn_blocking(move || {
                verify_snapshot(store_for_verify, &catalog, SnapshotId(snapshot_id), threads)
            })
            .await
            .map_err(|err| format_err!("verification worker panicked - {}", err))??;

            println!(
                "checked {} files: {} chunks ({}) verified, {} corrupt, {} missing",
                result.files_checked,
                result.chunks_verified,
                render_bytes(result.bytes_verified),
                result.corrupt_chunks,
                result.missing_chunks,
            );

            Ok(if result.is_ok() { 0 } else { 4 })
        }
    }
}
