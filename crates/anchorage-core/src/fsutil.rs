//! Small filesystem helpers shared by the persisted stores.

use std::fs;
use std::io;
use std::path::Path;

/// Write `contents` to `path` atomically: write a sibling temp file, then
/// rename over the destination. A crash mid-write never leaves a
/// half-written store on disk.
pub(crate) fn atomic_write(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

/// Remove a directory tree if it exists.
pub(crate) fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
