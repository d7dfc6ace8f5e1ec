//! # shaman-gc
//!
//! Mark-and-sweep garbage collection for the blob store.
//!
//! A run has three phases, all judged against one age threshold computed
//! when the run starts:
//!
//! 1. **Scan**: every file in the store older than the threshold becomes a
//!    deletion candidate (path → mtime).
//! 2. **Mark**: every symlink below the checkout root and the extra
//!    checkout directories is resolved; its target stops being a candidate.
//! 3. **Sweep**: each remaining candidate is stat'ed again and deleted only
//!    if its mtime did not move since the scan.
//!
//! There is no locking against uploads or checkouts. Blobs that are about to
//! be referenced get touched by their users, which either keeps them out of
//! the scan or makes the sweep skip them.

mod periodic;

pub use periodic::spawn_periodic;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use shaman_config::{log_gc_debug, log_gc_info, log_gc_warn};
use shaman_store::Storage;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum GcError {
    #[error("checkout root {root} is unavailable: {source}")]
    RootUnavailable { root: PathBuf, source: io::Error },

    #[error("unable to walk checkout root {root}: {source}")]
    RootWalk {
        root: PathBuf,
        source: walkdir::Error,
    },

    #[error("collection task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, GcError>;

/// Outcome of one collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Symlinks resolved during the mark phase
    pub num_symlinks_checked: u64,
    /// Files older than the threshold
    pub num_old_files: u64,
    /// Old files no symlink points to
    pub num_unused_old_files: u64,
    /// Old files that are still referenced
    pub num_still_used_old_files: u64,
    /// Candidates whose mtime changed between scan and sweep
    pub num_recently_touched: u64,
    /// Deleted files (would-be deletions in a dry run)
    pub num_files_deleted: u64,
    /// Candidates that could not be deleted
    pub num_files_not_deleted: u64,
    pub bytes_deleted: u64,
    pub dry_run: bool,
    /// A shutdown interrupted the run; counters cover the work done so far
    pub aborted: bool,
}

/// Candidates of one run: blob path → mtime at scan time.
type OldFiles = HashMap<PathBuf, SystemTime>;

/// Reclaims blobs no checkout refers to.
#[derive(Debug)]
pub struct GarbageCollector {
    storage: Arc<dyn Storage>,
    checkout_root: PathBuf,
    extra_checkout_dirs: Vec<PathBuf>,
    max_age: Duration,
}

impl GarbageCollector {
    pub fn new(
        storage: Arc<dyn Storage>,
        checkout_root: impl Into<PathBuf>,
        extra_checkout_dirs: Vec<PathBuf>,
        max_age: Duration,
    ) -> Self {
        Self {
            storage,
            checkout_root: checkout_root.into(),
            extra_checkout_dirs,
            max_age,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Run one collection. With `dry_run` nothing is deleted, the counters
    /// report what would have been.
    pub fn collect(&self, dry_run: bool, cancel: &CancellationToken) -> Result<GcStats> {
        let threshold = SystemTime::now()
            .checked_sub(self.max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut stats = GcStats {
            dry_run,
            ..Default::default()
        };

        log_gc_info!(
            "Garbage collection starting",
            dry_run = dry_run,
            max_age_secs = self.max_age.as_secs(),
        );

        let mut old_files = self.find_old_files(threshold, cancel);
        stats.num_old_files = old_files.len() as u64;
        if cancel.is_cancelled() {
            return Ok(self.aborted(stats));
        }
        if old_files.is_empty() {
            log_gc_debug!("No old files, nothing to collect");
            return Ok(stats);
        }

        // Any root may hold the only reference to a blob, so all of them are
        // walked before anything gets deleted.
        let mut roots = vec![(self.checkout_root.clone(), false)];
        roots.extend(self.extra_checkout_dirs.iter().map(|d| (d.clone(), true)));
        for (root, required) in roots {
            if !self.filter_linked_files(&root, required, &mut old_files, &mut stats, cancel)? {
                return Ok(self.aborted(stats));
            }
        }
        stats.num_unused_old_files = old_files.len() as u64;

        self.delete_old_files(old_files, &mut stats, cancel);
        if stats.aborted {
            return Ok(self.aborted(stats));
        }

        log_gc_info!(
            "Garbage collection finished",
            dry_run = dry_run,
            old = stats.num_old_files,
            still_used = stats.num_still_used_old_files,
            deleted = stats.num_files_deleted,
            not_deleted = stats.num_files_not_deleted,
            bytes_deleted = stats.bytes_deleted,
        );
        Ok(stats)
    }

    fn aborted(&self, mut stats: GcStats) -> GcStats {
        stats.aborted = true;
        log_gc_warn!(
            "Garbage collection aborted by shutdown",
            deleted = stats.num_files_deleted,
        );
        stats
    }

    /// Scan phase. Unreadable entries are logged and skipped; they simply
    /// don't become candidates.
    fn find_old_files(&self, threshold: SystemTime, cancel: &CancellationToken) -> OldFiles {
        let mut old_files = OldFiles::new();

        for entry in WalkDir::new(self.storage.base_path()) {
            if cancel.is_cancelled() {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log_gc_warn!("Skipping unreadable store entry", error = tracing::field::display(&e));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let mtime = match entry.metadata().map_err(io::Error::from).and_then(|m| m.modified()) {
                Ok(mtime) => mtime,
                Err(e) => {
                    log_gc_warn!(
                        "Unable to stat blob",
                        path = tracing::field::display(entry.path().display()),
                        error = tracing::field::display(&e),
                    );
                    continue;
                }
            };
            if mtime < threshold {
                old_files.insert(entry.into_path(), mtime);
            }
        }

        log_gc_debug!("Scan finished", old_files = old_files.len());
        old_files
    }

    /// Mark phase for one root. Returns `false` when cancelled.
    ///
    /// Broken links are ignored. Failing to walk the root is fatal: a
    /// reference hidden in an unreadable directory would otherwise be missed.
    fn filter_linked_files(
        &self,
        root: &Path,
        required: bool,
        old_files: &mut OldFiles,
        stats: &mut GcStats,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if let Err(source) = fs::metadata(root) {
            if !required && source.kind() == io::ErrorKind::NotFound {
                // No checkout was ever created.
                log_gc_debug!("Checkout root does not exist", root = tracing::field::display(root.display()));
                return Ok(true);
            }
            return Err(GcError::RootUnavailable {
                root: root.to_path_buf(),
                source,
            });
        }

        for entry in WalkDir::new(root) {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            let entry = entry.map_err(|source| GcError::RootWalk {
                root: root.to_path_buf(),
                source,
            })?;
            if !entry.path_is_symlink() {
                continue;
            }
            stats.num_symlinks_checked += 1;

            match fs::canonicalize(entry.path()) {
                Ok(target) => {
                    if old_files.remove(&target).is_some() {
                        stats.num_still_used_old_files += 1;
                    }
                }
                Err(e) => {
                    log_gc_debug!(
                        "Ignoring broken symlink",
                        path = tracing::field::display(entry.path().display()),
                        error = tracing::field::display(&e),
                    );
                }
            }
        }
        Ok(true)
    }

    /// Sweep phase. Per-file failures are counted and logged, never fatal.
    fn delete_old_files(&self, old_files: OldFiles, stats: &mut GcStats, cancel: &CancellationToken) {
        let uploading = self.storage.uploading_path();

        for (path, scanned_mtime) in old_files {
            if cancel.is_cancelled() {
                stats.aborted = true;
                return;
            }

            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    log_gc_debug!("Candidate vanished before sweep", path = tracing::field::display(path.display()));
                    continue;
                }
                Err(e) => {
                    log_gc_warn!(
                        "Unable to stat candidate",
                        path = tracing::field::display(path.display()),
                        error = tracing::field::display(&e),
                    );
                    stats.num_files_not_deleted += 1;
                    continue;
                }
            };
            if meta.modified().ok() != Some(scanned_mtime) {
                // Touched or re-uploaded since the scan: about to be used.
                stats.num_recently_touched += 1;
                continue;
            }

            if stats.dry_run {
                log_gc_info!("Would delete", path = tracing::field::display(path.display()), size = meta.len());
            } else {
                let removed = if path.starts_with(&uploading) {
                    self.storage.remove_uploaded(&path)
                } else {
                    self.storage.remove_stored(&path)
                };
                if let Err(e) = removed {
                    log_gc_warn!(
                        "Unable to delete blob",
                        path = tracing::field::display(path.display()),
                        error = tracing::field::display(&e),
                    );
                    stats.num_files_not_deleted += 1;
                    continue;
                }
                log_gc_debug!("Deleted", path = tracing::field::display(path.display()), size = meta.len());
            }
            stats.num_files_deleted += 1;
            stats.bytes_deleted += meta.len();
        }
    }
}

/// Run a collection on the blocking pool.
pub async fn collect_in_background(
    collector: Arc<GarbageCollector>,
    dry_run: bool,
    cancel: CancellationToken,
) -> Result<GcStats> {
    tokio::task::spawn_blocking(move || collector.collect(dry_run, &cancel)).await?
}
