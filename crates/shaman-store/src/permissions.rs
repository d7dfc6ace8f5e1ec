//! File permissions for blobs.
//!
//! Blobs are written by the Shaman server but read by render workers, which
//! often run as a different user and possibly on a different machine sharing
//! the storage over the network. Files created through the usual
//! umask-restricted `open(2)` would be unreadable for them, so every upload
//! file gets an explicit mode after creation (`chmod(2)` ignores the umask).

use std::io;
use std::path::Path;

/// Read/write for everybody: 0666. No execute bits, blobs are data.
#[cfg(unix)]
pub const BLOB_FILE_MODE: u32 = (libc::S_IRUSR
    | libc::S_IWUSR
    | libc::S_IRGRP
    | libc::S_IWGRP
    | libc::S_IROTH
    | libc::S_IWOTH) as u32;

/// Apply [`BLOB_FILE_MODE`] to a file.
#[cfg(unix)]
pub fn make_shareable(path: &Path) -> io::Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(BLOB_FILE_MODE))
}

/// No-op where the platform has no POSIX modes; ACLs are inherited instead.
#[cfg(not(unix))]
pub fn make_shareable(path: &Path) -> io::Result<()> {
    let _ = path;
    Ok(())
}
