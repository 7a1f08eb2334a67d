//! In-memory index of cached files
//!
//! Path-keyed map over the managed files. Lookups are lock-free;
//! every mutation happens under the eviction engine's admission lock so
//! membership stays consistent with the accounted weight.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::managed_file::{FileState, ManagedFile};

/// Map from local path to its managed file
#[derive(Default)]
pub struct FileIndex {
    files: DashMap<PathBuf, Arc<ManagedFile>>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock-free lookup with state re-validation: a file already marked
    /// for deletion reads as absent, forcing callers to reconstruct.
    pub fn get(&self, path: &Path) -> Option<Arc<ManagedFile>> {
        let file = self.files.get(path).map(|entry| Arc::clone(entry.value()))?;
        if file.state() == FileState::MarkedForDeletion {
            return None;
        }
        Some(file)
    }

    /// Insert `candidate` unless the path is already mapped; returns the
    /// winner either way, plus whether the candidate was installed.
    pub fn insert_or_get(&self, candidate: Arc<ManagedFile>) -> (Arc<ManagedFile>, bool) {
        match self.files.entry(candidate.local_path().to_path_buf()) {
            Entry::Occupied(occupied) => (Arc::clone(occupied.get()), false),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&candidate));
                (candidate, true)
            }
        }
    }

    /// Remove the mapping for `path`, whatever file holds it
    pub fn remove(&self, path: &Path) -> Option<Arc<ManagedFile>> {
        self.files.remove(path).map(|(_, file)| file)
    }

    /// Remove the mapping only while it still points at `file`; an evictor
    /// finishing late must not take out a freshly admitted replacement
    pub fn remove_exact(&self, file: &Arc<ManagedFile>) {
        self.files
            .remove_if(file.local_path(), |_, current| Arc::ptr_eq(current, file));
    }

    pub fn clear(&self) {
        self.files.clear();
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
