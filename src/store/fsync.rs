//! fsync helpers for crash-safe writes.
//!
//! Syncing a file's contents is not enough to survive a power loss: the
//! directory entry created by a rename or file creation lives in the parent
//! directory and needs its own fsync.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Syncs a file's contents and metadata to disk.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory so freshly created or renamed entries are durable.
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}
