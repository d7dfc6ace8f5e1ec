//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary storage root (file store + checkout tree)
//! - An extra checkout directory for GC reachability tests
//! - A matching [`Config`]
//!
//! # Usage
//!
//! ```ignore
//! use shaman_config::testing::TestEnvironment;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let config = env.config();
//!     // config points at env.storage_root, env.checkout_root, env.extra_checkout_dir
//! }
//! ```

use std::path::PathBuf;
use tempfile::TempDir;

use crate::Config;

/// Isolated test environment with its own storage tree
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Storage root for this test
    pub storage_root: PathBuf,
    /// Checkout tree root
    pub checkout_root: PathBuf,
    /// Directory outside the checkout tree that may hold references to blobs
    pub extra_checkout_dir: PathBuf,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = TempDir::new()?;
        // Canonical paths so symlink targets compare equal to store paths.
        let root = temp_dir.path().canonicalize()?;

        let storage_root = root.join("storage");
        let checkout_root = storage_root.join(crate::CHECKOUT_DIR);
        let extra_checkout_dir = root.join("extra-checkouts");

        std::fs::create_dir_all(storage_root.join(crate::FILE_STORE_DIR))?;
        std::fs::create_dir_all(&checkout_root)?;
        std::fs::create_dir_all(&extra_checkout_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            storage_root,
            checkout_root,
            extra_checkout_dir,
        })
    }

    /// Root of the blob store inside this environment
    pub fn file_store_path(&self) -> PathBuf {
        self.storage_root.join(crate::FILE_STORE_DIR)
    }

    /// Build a Config that points at this environment.
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.shaman.storage_root = self.storage_root.clone();
        cfg.shaman.checkout_root = Some(self.checkout_root.clone());
        cfg.garbage_collect.extra_checkout_dirs = vec![self.extra_checkout_dir.clone()];
        cfg
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
