//! Storage file helpers.
//!
//! The engine keeps side files next to the main database file. Every helper
//! here treats the main file and its side files as one unit.

use crate::error::StorageResult;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Suffixes of the side files SQLite may create next to a database.
const SIDE_FILE_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

fn side_file(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Returns true if the main database file exists.
#[must_use]
pub fn storage_exists(path: &Path) -> bool {
    path.is_file()
}

/// Deletes a database file and its side files.
///
/// Returns whether the main file existed. Missing files are not an error.
pub fn delete_database_files(path: &Path) -> StorageResult<bool> {
    let existed = remove_if_present(path)?;
    for suffix in SIDE_FILE_SUFFIXES {
        remove_if_present(&side_file(path, suffix))?;
    }
    debug!(path = %path.display(), existed, "deleted database files");
    Ok(existed)
}

/// Copies `src` over `dst`, creating parent directories of `dst` if needed.
///
/// The copy goes through a staging file beside `dst` and is renamed into
/// place, so `dst` is never observed half-written.
pub fn copy_file(src: &Path, dst: &Path) -> StorageResult<()> {
    if let Some(parent) = dst.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let staging = side_file(dst, ".partial");
    fs::copy(src, &staging)?;
    fs::rename(&staging, dst)?;
    Ok(())
}
