//! Refreshing blob modification times.
//!
//! The garbage collector only reclaims blobs whose mtime is older than its
//! threshold. Anything about to be referenced by a checkout gets its mtime
//! bumped so a collection running concurrently leaves it alone.

use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use shaman_config::log_store_debug;

/// Set access and modification time of `path` to now.
pub fn touch(path: &Path) -> io::Result<()> {
    let now = FileTime::now();
    filetime::set_file_times(path, now, now)
}

/// Touch `path` without making the caller wait for the filesystem.
///
/// Inside a Tokio runtime this runs on the blocking pool; outside of one it
/// happens inline. Failures are logged and otherwise ignored.
pub fn touch_in_background(path: PathBuf) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || touch_logged(&path));
        }
        Err(_) => touch_logged(&path),
    }
}

fn touch_logged(path: &Path) {
    if let Err(e) = touch(path) {
        log_store_debug!(
            "Unable to touch blob",
            path = tracing::field::display(path.display()),
            error = tracing::field::display(&e),
        );
    }
}
