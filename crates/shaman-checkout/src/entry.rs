use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use shaman_store::{BlobKey, StoreError};

use crate::{CheckoutError, Result};

/// One file of a checkout: which blob goes where.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEntry {
    pub checksum: String,
    pub size: u64,
    /// Location inside the checkout, relative, `/`-separated
    pub path: String,
}

impl FileEntry {
    pub fn new(checksum: impl Into<String>, size: u64, path: impl Into<String>) -> Self {
        Self {
            checksum: checksum.into(),
            size,
            path: path.into(),
        }
    }

    /// Blob identity of this entry.
    pub fn key(&self) -> std::result::Result<BlobKey, StoreError> {
        BlobKey::new(self.checksum.clone(), self.size)
    }

    /// Check the checksum format and that the path stays inside the checkout.
    pub fn validate(&self) -> Result<()> {
        self.key()?;

        let path = Path::new(&self.path);
        let mut has_name = false;
        let safe = !self.path.contains('\0')
            && path.components().all(|c| match c {
                Component::Normal(_) => {
                    has_name = true;
                    true
                }
                Component::CurDir => true,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => false,
            });

        if safe && has_name {
            Ok(())
        } else {
            Err(CheckoutError::InvalidEntryPath(self.path.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> FileEntry {
        let key = BlobKey::for_content(b"x");
        FileEntry::new(key.checksum(), key.size(), path)
    }

    #[test]
    fn test_valid_paths() {
        for path in ["scene.blend", "textures/wood.png", "./a/b/c.exr", "dir with space/x"] {
            assert!(entry(path).validate().is_ok(), "{} should be valid", path);
        }
    }

    #[test]
    fn test_invalid_paths() {
        for path in ["", ".", "/etc/passwd", "../x", "a/../../x", "a\0b"] {
            assert!(
                matches!(entry(path).validate(), Err(CheckoutError::InvalidEntryPath(_))),
                "{:?} should be rejected",
                path
            );
        }
    }

    #[test]
    fn test_invalid_checksum() {
        let e = FileEntry::new("not-a-checksum", 3, "x");
        assert!(matches!(e.validate(), Err(CheckoutError::Store(StoreError::InvalidChecksum(_)))));
    }

    #[test]
    fn test_json_shape() {
        let e: FileEntry =
            serde_json::from_str(r#"{"checksum":"abc","size":12,"path":"a/b.txt"}"#).unwrap();
        assert_eq!(e, FileEntry::new("abc", 12, "a/b.txt"));
    }
}
