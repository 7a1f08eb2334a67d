//! Startup scan of the cache root
//!
//! After a restart the only persisted state is the file tree itself:
//! paths carry the remote identities and mtimes carry the recency order.
//! The scan collects every regular file with its stat record; the facade
//! rebuilds the registry from the sorted result.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;
use walkdir::WalkDir;

use crate::errors::{CacheError, Result};

/// One regular file found under the root
#[derive(Debug)]
pub(crate) struct ScannedFile {
    pub path: PathBuf,
    pub mtime: SystemTime,
    pub size: u64,
}

/// Collect every regular file under `root`, sorted by mtime ascending.
///
/// An absent or empty root is a failure: there is nothing to rebuild
/// from, and reloading over a live registry would wipe it for nothing.
pub(crate) fn scan_root(root: &Path) -> Result<Vec<ScannedFile>> {
    if !root.is_dir() {
        return Err(CacheError::configuration(format!(
            "cache root '{}' is not a directory",
            root.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // an unreadable subtree costs us those entries, not the reload
                warn!(root = %root.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let (mtime, size) = match entry.metadata() {
            Ok(meta) => (
                meta.modified().unwrap_or_else(|_| SystemTime::now()),
                meta.len(),
            ),
            Err(_) => (SystemTime::now(), 0),
        };
        files.push(ScannedFile {
            path: entry.into_path(),
            mtime,
            size,
        });
    }

    if files.is_empty() {
        return Err(CacheError::configuration(format!(
            "cache root '{}' is empty",
            root.display()
        )));
    }

    // stable sort keeps walk order for equal mtimes
    files.sort_by_key(|f| f.mtime);
    Ok(files)
}
