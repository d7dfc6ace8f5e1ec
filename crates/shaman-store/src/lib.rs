//! # shaman-store
//!
//! Content-addressed blob store for Shaman.
//!
//! Blobs are identified by their SHA-256 checksum and their size. The store
//! keeps two bins next to each other: `uploading/` holds in-flight uploads,
//! any number of them per identity, and `stored/` holds exactly one verified
//! file per identity.
//!
//! ## Directory Layout
//!
//! ```text
//! file-store/
//! ├── uploading/
//! │   └── ab/
//! │       └── cdef0123...89/
//! │           ├── 1234-k3j9d0aa.tmp   # size-random.tmp
//! │           └── 1234-x8qpz1b2.tmp
//! └── stored/
//!     └── ab/
//!         └── cdef0123...89/
//!             └── 1234.blob            # size.blob
//! ```
//!
//! Concurrent writers never share a temp file (exclusive create with a
//! random name) and promotion into `stored/` is a single `rename(2)`, so
//! several processes may operate on the same store without locking.

pub mod permissions;
pub mod touch;

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use shaman_config::{log_store_debug, log_store_warn};
use tracing::instrument;

/// Length of a hex-encoded SHA-256 digest.
pub const CHECKSUM_LEN: usize = 64;

const UPLOADING_DIR: &str = "uploading";
const STORED_DIR: &str = "stored";
const STORED_SUFFIX: &str = ".blob";
const UPLOADING_SUFFIX: &str = ".tmp";

/// Errors that can occur during blob store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid checksum {0:?}: expected 64 lowercase hex characters")]
    InvalidChecksum(String),

    #[error("{path} is not in the upload bin of {key}")]
    NotInUploadBin { path: PathBuf, key: BlobKey },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Identity of a blob: its checksum plus its size in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobKey {
    checksum: String,
    size: u64,
}

impl BlobKey {
    /// Build a key, rejecting anything that is not a lowercase SHA-256 hex digest.
    pub fn new(checksum: impl Into<String>, size: u64) -> Result<Self> {
        let checksum = checksum.into();
        let valid = checksum.len() == CHECKSUM_LEN
            && checksum
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(StoreError::InvalidChecksum(checksum));
        }
        Ok(Self { checksum, size })
    }

    /// Key of the given content.
    pub fn for_content(data: &[u8]) -> Self {
        Self {
            checksum: compute_checksum(data),
            size: data.len() as u64,
        }
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Two-level shard directory, relative to a bin: `ab/cdef...`.
    fn shard_dir(&self) -> PathBuf {
        Path::new(&self.checksum[..2]).join(&self.checksum[2..])
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.checksum, self.size)
    }
}

/// SHA-256 of the given bytes, hex encoded.
pub fn compute_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Where a blob currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    #[serde(rename = "unknown")]
    DoesNotExist,
    Uploading,
    Stored,
}

impl FileStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::DoesNotExist => "unknown",
            FileStatus::Uploading => "uploading",
            FileStatus::Stored => "stored",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of resolving a blob key against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Missing,
    /// One of possibly several in-flight temp files.
    Uploading(PathBuf),
    Stored(PathBuf),
}

impl Resolved {
    pub fn status(&self) -> FileStatus {
        match self {
            Resolved::Missing => FileStatus::DoesNotExist,
            Resolved::Uploading(_) => FileStatus::Uploading,
            Resolved::Stored(_) => FileStatus::Stored,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Resolved::Missing => None,
            Resolved::Uploading(p) | Resolved::Stored(p) => Some(p),
        }
    }
}

/// A freshly created temp file in the upload bin.
#[derive(Debug)]
pub struct UploadFile {
    pub file: File,
    pub path: PathBuf,
}

/// Capabilities the rest of Shaman needs from a blob store.
pub trait Storage: Send + Sync + fmt::Debug {
    /// Root directory of the store (parent of both bins).
    fn base_path(&self) -> &Path;

    /// Root directory of the `stored` bin.
    fn stored_path(&self) -> PathBuf;

    /// Root directory of the `uploading` bin.
    fn uploading_path(&self) -> PathBuf;

    /// Locate a blob. With `stored_only` the upload bin is not consulted.
    fn resolve(&self, key: &BlobKey, stored_only: bool) -> Resolved;

    /// Create a new uniquely named temp file for an upload of `key`.
    fn open_for_upload(&self, key: &BlobKey) -> Result<UploadFile>;

    /// Atomically promote a finished upload into the `stored` bin.
    fn move_to_stored(&self, key: &BlobKey, temp_path: &Path) -> Result<PathBuf>;

    /// Delete a temp file from the upload bin, pruning empty shard directories.
    fn remove_uploaded(&self, path: &Path) -> Result<()>;

    /// Delete a stored blob, pruning empty shard directories.
    fn remove_stored(&self, path: &Path) -> Result<()>;
}

/// Filesystem-backed blob store.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store at the given root directory.
    ///
    /// Both bins are created if they don't exist. The root is canonicalized:
    /// blob paths double as symlink targets and must be absolute.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root.join(UPLOADING_DIR))?;
        fs::create_dir_all(root.join(STORED_DIR))?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    /// Path a stored blob with this key has (whether or not it exists).
    pub fn stored_blob_path(&self, key: &BlobKey) -> PathBuf {
        self.stored_path()
            .join(key.shard_dir())
            .join(format!("{}{}", key.size(), STORED_SUFFIX))
    }

    fn uploading_shard(&self, key: &BlobKey) -> PathBuf {
        self.uploading_path().join(key.shard_dir())
    }

    fn upload_prefix(key: &BlobKey) -> String {
        format!("{}-", key.size())
    }

    fn is_upload_name_for(key: &BlobKey, name: &str) -> bool {
        name.starts_with(&Self::upload_prefix(key)) && name.ends_with(UPLOADING_SUFFIX)
    }

    /// First in-flight temp file of this key, if any.
    fn find_uploading(&self, key: &BlobKey) -> Option<PathBuf> {
        let shard = self.uploading_shard(key);
        let entries = match fs::read_dir(&shard) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    log_store_debug!(
                        "Unable to list upload shard",
                        path = tracing::field::display(shard.display()),
                        error = tracing::field::display(&e),
                    );
                }
                return None;
            }
        };
        entries
            .flatten()
            .find(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| Self::is_upload_name_for(key, name))
            })
            .map(|entry| entry.path())
    }

    /// Remove now-empty shard directories between `path` and `bin_root`.
    /// Failures are ignored: a non-empty directory simply stays.
    fn prune_empty_parents(path: &Path, bin_root: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == bin_root || !dir.starts_with(bin_root) {
                break;
            }
            if fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }

    fn remove_in_bin(&self, path: &Path, bin_root: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Self::prune_empty_parents(path, bin_root);
        Ok(())
    }

    /// Get statistics about the store.
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();

        for (bin, is_stored) in [(self.uploading_path(), false), (self.stored_path(), true)] {
            if !bin.exists() {
                continue;
            }
            for entry in walkdir::WalkDir::new(&bin) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        log_store_debug!("Skipping unreadable entry in stats walk", error = tracing::field::display(&e));
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                if is_stored {
                    stats.stored_files += 1;
                    stats.stored_bytes += size;
                } else {
                    stats.uploading_files += 1;
                    stats.uploading_bytes += size;
                }
            }
        }

        Ok(stats)
    }
}

impl Storage for FileStore {
    fn base_path(&self) -> &Path {
        &self.root
    }

    fn stored_path(&self) -> PathBuf {
        self.root.join(STORED_DIR)
    }

    fn uploading_path(&self) -> PathBuf {
        self.root.join(UPLOADING_DIR)
    }

    fn resolve(&self, key: &BlobKey, stored_only: bool) -> Resolved {
        let stored = self.stored_blob_path(key);
        if stored.is_file() {
            return Resolved::Stored(stored);
        }
        if stored_only {
            return Resolved::Missing;
        }
        match self.find_uploading(key) {
            Some(path) => Resolved::Uploading(path),
            None => Resolved::Missing,
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn open_for_upload(&self, key: &BlobKey) -> Result<UploadFile> {
        let shard = self.uploading_shard(key);
        let prefix = Self::upload_prefix(key);

        // Exclusive create with a random name; many uploads of one key may coexist.
        let temp = with_parent_dir(&shard, || {
            tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(UPLOADING_SUFFIX)
                .rand_bytes(8)
                .tempfile_in(&shard)
        })?;
        let (file, path) = temp.keep().map_err(io::Error::from)?;

        // Workers running as another user must be able to read the blob.
        permissions::make_shareable(&path)?;

        Ok(UploadFile { file, path })
    }

    #[instrument(skip(self), level = "debug")]
    fn move_to_stored(&self, key: &BlobKey, temp_path: &Path) -> Result<PathBuf> {
        let shard = self.uploading_shard(key);
        let in_upload_bin = temp_path.parent() == Some(shard.as_path())
            && temp_path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| Self::is_upload_name_for(key, name));
        if !in_upload_bin {
            return Err(StoreError::NotInUploadBin {
                path: temp_path.to_path_buf(),
                key: key.clone(),
            });
        }

        let target = self.stored_blob_path(key);
        let parent = target.parent().unwrap_or(&self.root);

        // Atomic rename - a concurrent promotion of the same key carries the same content
        with_parent_dir(parent, || fs::rename(temp_path, &target))?;
        Self::prune_empty_parents(temp_path, &self.uploading_path());

        log_store_debug!("Blob stored", path = tracing::field::display(target.display()));
        Ok(target)
    }

    fn remove_uploaded(&self, path: &Path) -> Result<()> {
        self.remove_in_bin(path, &self.uploading_path())
    }

    fn remove_stored(&self, path: &Path) -> Result<()> {
        let result = self.remove_in_bin(path, &self.stored_path());
        if let Err(ref e) = result {
            log_store_warn!(
                "Unable to remove stored blob",
                path = tracing::field::display(path.display()),
                error = tracing::field::display(&e),
            );
        }
        result
    }
}

/// Run `op` after making sure `dir` exists.
///
/// Removal of a blob prunes empty shard directories, which can race with a
/// writer that just created one. A vanished directory is recreated once.
fn with_parent_dir<T>(dir: &Path, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    fs::create_dir_all(dir)?;
    match op() {
        Err(e) if e.kind() == io::ErrorKind::NotFound && !dir.exists() => {
            fs::create_dir_all(dir)?;
            op()
        }
        result => result,
    }
}

/// Statistics about the blob store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Temp files currently in the upload bin
    pub uploading_files: u64,
    pub uploading_bytes: u64,
    /// Verified blobs
    pub stored_files: u64,
    pub stored_bytes: u64,
}

impl StoreStats {
    /// Calculate average stored blob size
    pub fn avg_blob_size(&self) -> u64 {
        if self.stored_files == 0 {
            0
        } else {
            self.stored_bytes / self.stored_files
        }
    }
}
