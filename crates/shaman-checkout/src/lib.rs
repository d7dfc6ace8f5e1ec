//! # shaman-checkout
//!
//! A checkout is the working directory of one render job: a tree of symlinks
//! pointing into the `stored` bin of the blob store. Nothing is copied.
//!
//! ## Directory Layout
//!
//! ```text
//! jobs/
//! └── 5d/                                        # last two chars of the ID
//!     └── 5e5be786-e6d7-480c-90e6-437f9ef5bf5d/
//!         ├── scene.blend -> .../stored/ab/cdef.../1234.blob
//!         └── textures/
//!             └── wood.png -> .../stored/01/23ab.../98765.blob
//! ```
//!
//! Checkout IDs usually end in random characters, so sharding on the tail
//! spreads them evenly.

mod entry;
mod id;

pub use entry::FileEntry;
pub use id::{validate_checkout_id, MAX_CHECKOUT_ID_LEN};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use shaman_config::{log_checkout_error, log_checkout_info};
use shaman_store::touch::touch_in_background;
use shaman_store::{Resolved, StoreError, Storage};
use thiserror::Error;
use tracing::{debug, warn};

/// How often `create_checkout` retries with a random suffix before giving up.
const UNIQUE_ID_ATTEMPTS: usize = 10;
/// Length of the random suffix, without its `-` separator.
const SUFFIX_LEN: usize = 6;
/// How often `prepare` recreates a shard directory pruned under its feet.
const SHARD_RETRIES: usize = 10;

#[derive(Error, Debug)]
pub enum CheckoutError {
    #[error("invalid checkout ID {0:?}")]
    InvalidCheckoutId(String),

    #[error("checkout {0:?} already exists")]
    AlreadyExists(String),

    #[error("{} file(s) are not in the stored bin yet", .missing.len())]
    MissingFiles { missing: Vec<FileEntry> },

    #[error("invalid path {0:?} in checkout entry")]
    InvalidEntryPath(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, CheckoutError>;

/// Where a checkout lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutPaths {
    /// Final checkout ID (may carry a uniqueness suffix)
    pub checkout_id: String,
    /// Path relative to the checkout root: `<shard>/<id>`
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
}

/// Builds and erases checkouts below one root directory.
#[derive(Debug, Clone)]
pub struct CheckoutManager {
    root: PathBuf,
    storage: Arc<dyn Storage>,
}

impl CheckoutManager {
    /// Create a manager for the checkout tree at `root`, creating it if needed.
    pub fn new<P: AsRef<Path>>(root: P, storage: Arc<dyn Storage>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.canonicalize()?,
            storage,
        })
    }

    /// Root of the checkout tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate `checkout_id` and compute where its checkout lives.
    pub fn path_for_id(&self, checkout_id: &str) -> Result<CheckoutPaths> {
        validate_checkout_id(checkout_id)?;

        let relative_path = Path::new(id::shard_of(checkout_id)).join(checkout_id);
        Ok(CheckoutPaths {
            checkout_id: checkout_id.to_string(),
            absolute_path: self.root.join(&relative_path),
            relative_path,
        })
    }

    /// Create the (empty) checkout directory.
    pub fn prepare(&self, checkout_id: &str) -> Result<CheckoutPaths> {
        let paths = self.path_for_id(checkout_id)?;

        match fs::symlink_metadata(&paths.absolute_path) {
            Ok(meta) => {
                if !meta.is_dir() {
                    log_checkout_error!(
                        "Checkout path exists but is not a directory",
                        checkout_id = checkout_id,
                        path = tracing::field::display(paths.absolute_path.display()),
                    );
                }
                return Err(CheckoutError::AlreadyExists(checkout_id.to_string()));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        match create_checkout_dir(&paths.absolute_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(CheckoutError::AlreadyExists(checkout_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        debug!(checkout_id, path = %paths.absolute_path.display(), "Checkout prepared");
        Ok(paths)
    }

    /// Build a checkout of `entries`.
    ///
    /// When `checkout_id` is taken, a random suffix is appended (a few times at
    /// most); the returned paths carry the ID actually used. Either every entry
    /// is linked or the checkout directory is gone again.
    pub fn create_checkout(&self, checkout_id: &str, entries: &[FileEntry]) -> Result<CheckoutPaths> {
        for entry in entries {
            entry.validate()?;
        }

        let paths = self.prepare_unique(checkout_id)?;
        if let Err(e) = self.populate(&paths, entries) {
            self.rollback(&paths);
            return Err(e);
        }

        log_checkout_info!(
            "Checkout created",
            checkout_id = paths.checkout_id.as_str(),
            files = entries.len(),
        );
        Ok(paths)
    }

    fn prepare_unique(&self, checkout_id: &str) -> Result<CheckoutPaths> {
        let mut attempt_id = checkout_id.to_string();
        let mut last_err = None;
        // Suffixed IDs must stay within the length limit.
        let base = id::truncate_to(checkout_id, MAX_CHECKOUT_ID_LEN - SUFFIX_LEN - 1);

        for _ in 0..UNIQUE_ID_ATTEMPTS {
            match self.prepare(&attempt_id) {
                Err(CheckoutError::AlreadyExists(id)) => {
                    debug!(checkout_id = %id, "Checkout exists, trying another suffix");
                    last_err = Some(CheckoutError::AlreadyExists(id));
                    attempt_id = format!("{}-{}", base, random_suffix());
                }
                result => return result,
            }
        }

        Err(last_err.unwrap_or_else(|| CheckoutError::AlreadyExists(checkout_id.to_string())))
    }

    fn populate(&self, paths: &CheckoutPaths, entries: &[FileEntry]) -> Result<()> {
        let mut linked = Vec::with_capacity(entries.len());
        let mut missing = Vec::new();

        for entry in entries {
            match self.storage.resolve(&entry.key()?, true) {
                Resolved::Stored(blob) => linked.push((entry, blob)),
                _ => missing.push(entry.clone()),
            }
        }
        if !missing.is_empty() {
            debug!(
                checkout_id = %paths.checkout_id,
                missing = missing.len(),
                "Checkout refers to blobs that are not stored"
            );
            return Err(CheckoutError::MissingFiles { missing });
        }

        for (entry, blob) in linked {
            symlink_to_checkout(&blob, &paths.absolute_path, Path::new(&entry.path))?;
            // The blob is referenced from now on; keep a running GC away from it.
            touch_in_background(blob);
        }
        Ok(())
    }

    fn rollback(&self, paths: &CheckoutPaths) {
        if let Err(e) = self.erase_paths(paths) {
            log_checkout_error!(
                "Unable to roll back checkout",
                checkout_id = paths.checkout_id.as_str(),
                error = tracing::field::display(&e),
            );
        }
    }

    /// Remove a checkout and, if it is now empty, its shard directory.
    pub fn erase(&self, checkout_id: &str) -> Result<()> {
        let paths = self.path_for_id(checkout_id)?;
        self.erase_paths(&paths)
    }

    fn erase_paths(&self, paths: &CheckoutPaths) -> Result<()> {
        match fs::remove_dir_all(&paths.absolute_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(checkout_id = %paths.checkout_id, "Checkout already gone");
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(shard) = paths.absolute_path.parent() {
            let _ = fs::remove_dir(shard);
        }
        debug!(checkout_id = %paths.checkout_id, "Checkout erased");
        Ok(())
    }
}

/// Create the directory of one checkout, and its shard directory if needed.
///
/// `create_dir` (not `_all`) on the checkout itself, so a concurrent prepare
/// of the same ID loses cleanly. Erasing another checkout prunes an empty
/// shard, which can happen between creating the shard and the checkout; a
/// vanished shard is recreated a few times.
fn create_checkout_dir(path: &Path) -> io::Result<()> {
    let mut attempt = 0;
    loop {
        if let Some(shard) = path.parent() {
            fs::create_dir_all(shard)?;
        }
        match fs::create_dir(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound && attempt < SHARD_RETRIES => {
                debug!(path = %path.display(), "Shard directory vanished, recreating");
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Link `blob` at `relative` inside `checkout_dir`.
///
/// Intermediate directories are only created when the first attempt fails
/// because they're missing; most entries share already-created directories.
fn symlink_to_checkout(blob: &Path, checkout_dir: &Path, relative: &Path) -> Result<()> {
    let link = checkout_dir.join(relative);

    match make_symlink(blob, &link) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent)?;
            }
            make_symlink(blob, &link).map_err(Into::into)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            // Same path listed twice: fine as long as it's the same blob.
            match fs::read_link(&link) {
                Ok(existing) if existing == blob => Ok(()),
                _ => {
                    warn!(path = %link.display(), "Checkout path listed twice with different content");
                    Err(e.into())
                }
            }
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..SUFFIX_LEN].to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use shaman_store::{BlobKey, FileStore};
    use std::io::Write;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        store: Arc<FileStore>,
        manager: CheckoutManager,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(temp.path().join("file-store")).unwrap());
        let manager = CheckoutManager::new(temp.path().join("jobs"), store.clone()).unwrap();
        Fixture {
            _temp: temp,
            store,
            manager,
        }
    }

    fn store_blob(store: &FileStore, data: &[u8]) -> BlobKey {
        let key = BlobKey::for_content(data);
        let mut upload = store.open_for_upload(&key).unwrap();
        upload.file.write_all(data).unwrap();
        store.move_to_stored(&key, &upload.path).unwrap();
        key
    }

    fn entry(key: &BlobKey, path: &str) -> FileEntry {
        FileEntry::new(key.checksum(), key.size(), path)
    }

    #[test]
    fn test_path_for_id_shards_on_tail() {
        let f = fixture();
        let paths = f
            .manager
            .path_for_id("5e5be786-e6d7-480c-90e6-437f9ef5bf5d")
            .unwrap();
        assert_eq!(
            paths.relative_path,
            PathBuf::from("5d/5e5be786-e6d7-480c-90e6-437f9ef5bf5d")
        );
        assert_eq!(paths.absolute_path, f.manager.root().join(&paths.relative_path));
    }

    #[test]
    fn test_path_for_id_rejects_traversal() {
        let f = fixture();
        assert!(matches!(
            f.manager.path_for_id("../../etc"),
            Err(CheckoutError::InvalidCheckoutId(_))
        ));
    }

    #[test]
    fn test_prepare_twice_conflicts() {
        let f = fixture();
        let paths = f.manager.prepare("job-1234").unwrap();
        assert!(paths.absolute_path.is_dir());
        assert!(matches!(
            f.manager.prepare("job-1234"),
            Err(CheckoutError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_prepare_conflicts_with_file() {
        let f = fixture();
        let paths = f.manager.path_for_id("job-5678").unwrap();
        fs::create_dir_all(paths.absolute_path.parent().unwrap()).unwrap();
        fs::write(&paths.absolute_path, b"not a dir").unwrap();

        assert!(matches!(
            f.manager.prepare("job-5678"),
            Err(CheckoutError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_create_checkout_links_blobs() {
        let f = fixture();
        let scene = store_blob(&f.store, b"blend data");
        let texture = store_blob(&f.store, b"png data");

        let entries = vec![
            entry(&scene, "scene.blend"),
            entry(&texture, "textures/wood/oak.png"),
        ];
        let paths = f.manager.create_checkout("job-abcd", &entries).unwrap();
        assert_eq!(paths.checkout_id, "job-abcd");

        let link = paths.absolute_path.join("textures/wood/oak.png");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), f.store.stored_blob_path(&texture));
        assert_eq!(fs::read(&link).unwrap(), b"png data");
        assert_eq!(fs::read(paths.absolute_path.join("scene.blend")).unwrap(), b"blend data");
    }

    #[test]
    fn test_create_checkout_adjusts_taken_id() {
        let f = fixture();
        let blob = store_blob(&f.store, b"data");
        let entries = vec![entry(&blob, "a.txt")];

        let first = f.manager.create_checkout("render-42", &entries).unwrap();
        let second = f.manager.create_checkout("render-42", &entries).unwrap();

        assert_eq!(first.checkout_id, "render-42");
        assert_ne!(second.checkout_id, "render-42");
        assert!(second.checkout_id.starts_with("render-42-"));
        assert!(second.absolute_path.join("a.txt").exists());
    }

    #[test]
    fn test_longest_taken_id_gets_suffix_within_limit() {
        let f = fixture();
        let blob = store_blob(&f.store, b"data");
        let entries = vec![entry(&blob, "a.txt")];
        let long_id = "r".repeat(MAX_CHECKOUT_ID_LEN);

        let first = f.manager.create_checkout(&long_id, &entries).unwrap();
        let second = f.manager.create_checkout(&long_id, &entries).unwrap();

        assert_eq!(first.checkout_id, long_id);
        assert_ne!(second.checkout_id, long_id);
        assert_eq!(second.checkout_id.len(), MAX_CHECKOUT_ID_LEN);
        let base = &long_id[..MAX_CHECKOUT_ID_LEN - SUFFIX_LEN - 1];
        assert!(second.checkout_id.starts_with(&format!("{}-", base)));
        assert!(second.absolute_path.join("a.txt").exists());
    }

    #[test]
    fn test_missing_blob_rolls_back() {
        let f = fixture();
        let mut entries: Vec<_> = (0..10)
            .map(|i| {
                let key = store_blob(&f.store, format!("present {}", i).as_bytes());
                entry(&key, &format!("file{}.txt", i))
            })
            .collect();
        let absent = BlobKey::for_content(b"never uploaded");
        entries.insert(5, entry(&absent, "missing.txt"));

        let result = f.manager.create_checkout("job-missing", &entries);
        match result {
            Err(CheckoutError::MissingFiles { missing }) => {
                assert_eq!(missing.len(), 1);
                assert_eq!(missing[0].path, "missing.txt");
            }
            other => panic!("expected MissingFiles, got {:?}", other),
        }

        let paths = f.manager.path_for_id("job-missing").unwrap();
        assert!(!paths.absolute_path.exists(), "checkout must be rolled back");
    }

    #[test]
    fn test_uploading_blob_counts_as_missing() {
        let f = fixture();
        let key = BlobKey::for_content(b"still uploading");
        let _upload = f.store.open_for_upload(&key).unwrap();

        let result = f.manager.create_checkout("job-upl", &[entry(&key, "x")]);
        assert!(matches!(result, Err(CheckoutError::MissingFiles { .. })));
    }

    #[test]
    fn test_conflicting_duplicate_paths_roll_back() {
        let f = fixture();
        let a = store_blob(&f.store, b"aaa");
        let b = store_blob(&f.store, b"bbb");

        let result = f
            .manager
            .create_checkout("job-dup", &[entry(&a, "same.txt"), entry(&b, "same.txt")]);
        assert!(matches!(result, Err(CheckoutError::Io(_))));
        assert!(!f.manager.path_for_id("job-dup").unwrap().absolute_path.exists());
    }

    #[test]
    fn test_identical_duplicate_entries_are_fine() {
        let f = fixture();
        let a = store_blob(&f.store, b"aaa");
        let paths = f
            .manager
            .create_checkout("job-same", &[entry(&a, "same.txt"), entry(&a, "same.txt")])
            .unwrap();
        assert!(paths.absolute_path.join("same.txt").exists());
    }

    #[test]
    fn test_escaping_entry_path_is_rejected_without_side_effects() {
        let f = fixture();
        let a = store_blob(&f.store, b"aaa");
        let result = f
            .manager
            .create_checkout("job-escape", &[entry(&a, "../../outside.txt")]);
        assert!(matches!(result, Err(CheckoutError::InvalidEntryPath(_))));
        assert!(!f.manager.path_for_id("job-escape").unwrap().absolute_path.exists());
    }

    #[test]
    fn test_erase_removes_checkout_and_shard() {
        let f = fixture();
        let a = store_blob(&f.store, b"aaa");
        let paths = f.manager.create_checkout("job-er", &[entry(&a, "a/b/c.txt")]).unwrap();

        f.manager.erase("job-er").unwrap();
        assert!(!paths.absolute_path.exists());
        assert!(!paths.absolute_path.parent().unwrap().exists());
        // The blob itself is untouched
        assert!(f.store.stored_blob_path(&a).exists());
        // Erasing again is not an error
        f.manager.erase("job-er").unwrap();
    }
}
