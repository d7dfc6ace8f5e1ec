use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shaman_checkout::FileEntry;
use shaman_config::log_upload_debug;
use shaman_store::touch::touch_in_background;
use shaman_store::{FileStatus, Resolved, Storage, StoreError};

/// A checkout entry the client still has to act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredFile {
    #[serde(flatten)]
    pub entry: FileEntry,
    /// `unknown` (upload it) or `uploading` (check again later)
    pub status: FileStatus,
}

/// Works out which files of an upcoming checkout are not stored yet.
#[derive(Debug, Clone)]
pub struct RequirementsNegotiator {
    storage: Arc<dyn Storage>,
}

impl RequirementsNegotiator {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Return the entries that are unknown or still uploading, first
    /// occurrence of each blob only, in request order.
    ///
    /// Stored blobs are left out and touched, since a checkout is about to
    /// link them.
    pub fn requirements(&self, entries: &[FileEntry]) -> Result<Vec<RequiredFile>, StoreError> {
        let mut seen = HashSet::with_capacity(entries.len());
        let mut required = Vec::new();

        for entry in entries {
            let key = entry.key()?;
            if !seen.insert(key.clone()) {
                continue;
            }

            match self.storage.resolve(&key, false) {
                Resolved::Stored(path) => touch_in_background(path),
                resolved => required.push(RequiredFile {
                    entry: entry.clone(),
                    status: resolved.status(),
                }),
            }
        }

        log_upload_debug!(
            "Checkout requirements",
            requested = entries.len(),
            unique = seen.len(),
            required = required.len(),
        );
        Ok(required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use shaman_store::{BlobKey, FileStore};
    use std::io::Write;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

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
    fn test_reports_unknown_and_uploading_once() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(temp.path()).unwrap());
        let negotiator = RequirementsNegotiator::new(store.clone());

        let stored = store_blob(&store, b"stored");
        let unknown = BlobKey::for_content(b"unknown");
        let uploading = BlobKey::for_content(b"uploading");
        let _partial = store.open_for_upload(&uploading).unwrap();

        let required = negotiator
            .requirements(&[
                entry(&unknown, "a.png"),
                entry(&stored, "b.png"),
                entry(&uploading, "c.png"),
                entry(&unknown, "copy-of-a.png"),
            ])
            .unwrap();

        assert_eq!(
            required,
            vec![
                RequiredFile {
                    entry: entry(&unknown, "a.png"),
                    status: FileStatus::DoesNotExist,
                },
                RequiredFile {
                    entry: entry(&uploading, "c.png"),
                    status: FileStatus::Uploading,
                },
            ]
        );
    }

    #[test]
    fn test_touches_stored_blobs() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(temp.path()).unwrap());
        let key = store_blob(&store, b"old but wanted");
        let path = store.stored_blob_path(&key);
        let long_ago = SystemTime::now() - Duration::from_secs(40 * 24 * 3600);
        filetime::set_file_mtime(&path, FileTime::from_system_time(long_ago)).unwrap();

        // No runtime here, so the touch happens inline.
        let required = RequirementsNegotiator::new(store)
            .requirements(&[entry(&key, "x")])
            .unwrap();

        assert!(required.is_empty());
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert!(mtime > long_ago + Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_invalid_checksum_is_rejected() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(temp.path()).unwrap());
        let result =
            RequirementsNegotiator::new(store).requirements(&[FileEntry::new("xyz", 1, "x")]);
        assert!(matches!(result, Err(StoreError::InvalidChecksum(_))));
    }

    #[test]
    fn test_wire_shape() {
        let key = BlobKey::for_content(b"abc");
        let json = serde_json::to_value(RequiredFile {
            entry: entry(&key, "dir/file"),
            status: FileStatus::DoesNotExist,
        })
        .unwrap();
        assert_eq!(json["path"], "dir/file");
        assert_eq!(json["size"], 3);
        assert_eq!(json["status"], "unknown");
    }
}
