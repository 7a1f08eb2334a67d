//! The file system cache facade
//!
//! Ties the codec, index, eviction engine and fetch coordinator together
//! behind the surface the hosting subsystem consumes. A lookup that
//! misses constructs a managed file, admits it (possibly evicting idle
//! victims) and drives a fetch; lookups that land on an in-flight fetch
//! subscribe to the file and wait the same terminal state out.

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::errors::{CacheError, Result};
use crate::lru::{Admission, EvictionSink, LruEngine};
use crate::managed_file::{FileState, ManagedFile, Subscription};
use crate::paths::PathCodec;
use crate::reload;
use crate::stats::{CacheStats, CacheStatsSnapshot};
use crate::store::FileIndex;
use crate::sync::{PrepareService, SyncCoordinator};

/// How long one wait slice on an in-flight fetch lasts before the waiter
/// logs that it is still blocked
const FETCH_WAIT_SLICE: Duration = Duration::from_secs(5);

/// Local-disk cache of files fetched from remote distributed file systems
#[derive(Clone)]
pub struct FileSystemCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    config: CacheConfig,
    codec: PathCodec,
    index: FileIndex,
    lru: LruEngine,
    coordinator: SyncCoordinator,
    stats: CacheStats,
    /// Write-held across reload/reset so no lookup observes a half-built
    /// registry; read-held by every serving operation
    maintenance: RwLock<()>,
}

impl FileSystemCache {
    /// Create a cache over `config.root`, creating the directory if needed
    pub fn new(config: CacheConfig, service: Arc<dyn PrepareService>) -> Result<Self> {
        std::fs::create_dir_all(&config.root)
            .map_err(|e| CacheError::io(&config.root, "create cache root", e))?;

        let inner = Arc::new(CacheInner {
            codec: PathCodec::new(&config.root),
            index: FileIndex::new(),
            lru: LruEngine::new(config.capacity_bytes),
            coordinator: SyncCoordinator::new(service),
            stats: CacheStats::default(),
            maintenance: RwLock::new(()),
            config,
        });

        info!(
            root = %inner.config.root.display(),
            capacity_bytes = inner.config.capacity_bytes,
            autoload = inner.config.autoload,
            "file system cache ready"
        );
        Ok(Self { inner })
    }

    /// The codec mapping remote identities into this cache's root
    pub fn codec(&self) -> &PathCodec {
        &self.inner.codec
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Look up a file without constructing it on miss
    pub fn find(&self, path: impl AsRef<Path>) -> Option<Arc<ManagedFile>> {
        let path = path.as_ref();
        let _serving = self.inner.maintenance.read();
        match self.inner.index.get(path) {
            Some(file) => {
                self.inner.stats.record_hit();
                self.inner.touch(&file);
                Some(file)
            }
            None => {
                self.inner.stats.record_miss();
                None
            }
        }
    }

    /// Register a file that is already materialized under the root.
    ///
    /// Admission may evict idle victims. Adding a path that is already
    /// present is a no-op returning the existing file. The file is not
    /// fetched and keeps its amorphous state until something claims it.
    pub fn add(&self, path: impl AsRef<Path>) -> Result<Arc<ManagedFile>> {
        let path = path.as_ref();
        let _serving = self.inner.maintenance.read();
        loop {
            if let Some(existing) = self.inner.index.get(path) {
                return Ok(existing);
            }
            let candidate = self.inner.construct(path)?;
            candidate.set_estimated_size(candidate.size_on_disk());
            let (file, fresh) = self.inner.admit(candidate);
            if fresh || file.state() != FileState::MarkedForDeletion {
                return Ok(file);
            }
            // raced a concurrent eviction mid-disposal; try again
        }
    }

    /// Get the file for `path`, fetching it from the remote side on miss.
    ///
    /// Blocks until the file settles: either this caller runs the fetch
    /// itself, or it subscribes to whoever got there first and shares the
    /// result. On a miss with autoload disabled the lookup reports
    /// not-found instead.
    pub fn get_or_construct(&self, path: impl AsRef<Path>) -> Result<Arc<ManagedFile>> {
        let path = path.as_ref();
        loop {
            let _serving = self.inner.maintenance.read();
            let Some(file) = self.inner.index.get(path) else {
                self.inner.stats.record_miss();
                if !self.inner.config.autoload {
                    return Err(CacheError::not_found(path));
                }
                let candidate = self.inner.construct(path)?;
                candidate.set_estimated_size(candidate.size_on_disk());
                let (file, fresh) = self.inner.admit(candidate);
                if !fresh || !file.try_claim_for_sync() {
                    // lost the admission or claim race; re-evaluate the
                    // winner's state
                    continue;
                }
                return self.run_fetch(&file);
            };

            match file.state() {
                FileState::Idle | FileState::HasClients | FileState::UnderWrite => {
                    self.inner.stats.record_hit();
                    self.inner.touch(&file);
                    return Ok(file);
                }
                FileState::Amorphous | FileState::InUseBySync => {
                    // an added-but-never-fetched file belongs to whoever
                    // claims it first
                    if file.try_claim_for_sync() {
                        return self.run_fetch(&file);
                    }
                    let Some(subscription) = file.subscribe_for_updates() else {
                        continue; // marked under us; retry the lookup
                    };
                    match self.await_settled(&subscription, path) {
                        FileState::Idle | FileState::HasClients | FileState::UnderWrite => {
                            drop(subscription);
                            self.inner.stats.record_hit();
                            self.inner.touch(&file);
                            return Ok(file);
                        }
                        FileState::Forbidden => {
                            drop(subscription);
                            return Err(CacheError::forbidden(path, file.resync_backoff()));
                        }
                        _ => {
                            drop(subscription);
                            continue; // deleted while we waited; retry
                        }
                    }
                }
                FileState::Forbidden => {
                    if file.should_try_resync() && file.try_begin_resync() {
                        return self.run_fetch(&file);
                    }
                    return Err(CacheError::forbidden(path, file.resync_backoff()));
                }
                FileState::MarkedForDeletion => continue,
            }
        }
    }

    /// Drop a file from the cache and from disk, ignoring readers
    pub fn remove(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let _serving = self.inner.maintenance.read();
        let Some(file) = self.inner.index.remove(path) else {
            return false;
        };
        self.inner.lru.remove(path);
        file.force_delete();
        info!(path = %path.display(), "removed from cache");
        true
    }

    /// Rebuild the registry from the on-disk root.
    ///
    /// Single-writer: lookups block for the duration. Files are admitted
    /// oldest-first so the recency order matches the surviving mtimes;
    /// paths that do not decode are left alone and unregistered.
    pub fn reload(&self) -> Result<usize> {
        let _exclusive = self.inner.maintenance.write();
        let scanned = reload::scan_root(&self.inner.config.root)?;

        self.inner.index.clear();
        self.inner.lru.clear();
        self.inner.lru.set_start_time(scanned[0].mtime);

        let mut loaded = 0usize;
        for entry in scanned {
            let file = match self.inner.construct(&entry.path) {
                Ok(file) => file,
                Err(_) => {
                    debug!(path = %entry.path.display(), "skipping undecodable file");
                    continue;
                }
            };
            file.set_estimated_size(entry.size);
            let (file, fresh) = self.inner.admit(file);
            if fresh {
                file.set_state(FileState::Idle);
                loaded += 1;
            }
        }

        info!(
            root = %self.inner.config.root.display(),
            loaded,
            current_weight = self.inner.lru.current_weight(),
            "cache reloaded"
        );
        Ok(loaded)
    }

    /// Forget every registered file, leaving the disk contents alone.
    /// A subsequent [`reload`](Self::reload) recovers them.
    pub fn reset(&self) {
        let _exclusive = self.inner.maintenance.write();
        self.inner.index.clear();
        self.inner.lru.clear();
        info!("cache registry reset");
    }

    /// Flag an in-flight fetch for cancellation; see
    /// [`SyncCoordinator::cancel`](crate::sync::SyncCoordinator::cancel)
    pub fn cancel_fetch(&self, path: impl AsRef<Path>, wait: bool) -> bool {
        self.inner.coordinator.cancel(path.as_ref(), wait)
    }

    /// Whole-cache consistency validation; reserved surface
    pub fn validate(&self) -> Result<()> {
        Err(CacheError::NotImplemented {
            operation: "validate local cache",
        })
    }

    /// Registered files in eviction order, least recent first
    pub fn iter_lru(&self) -> Vec<Arc<ManagedFile>> {
        self.inner.lru.iter_lru()
    }

    /// Point-in-time operation counters and gauges
    pub fn statistics(&self) -> CacheStatsSnapshot {
        self.inner.stats.snapshot(
            self.inner.index.len() as u64,
            self.inner.lru.current_weight(),
            self.inner.lru.capacity_bytes(),
            self.inner.lru.start_time(),
        )
    }

    /// Run the fetch for a file this caller owns and map the outcome
    fn run_fetch(&self, file: &Arc<ManagedFile>) -> Result<Arc<ManagedFile>> {
        self.inner.stats.record_fetch();
        match self.inner.coordinator.run_prepare(file) {
            Ok(()) => {
                // an administrative removal can race the download; the
                // handle is dead even though the fetch went through
                if file.state() == FileState::MarkedForDeletion {
                    return Err(CacheError::not_found(file.local_path()));
                }
                Ok(Arc::clone(file))
            }
            Err(e) => {
                self.inner.stats.record_fetch_failure();
                Err(e)
            }
        }
    }

    /// Wait out an in-flight fetch, logging while it drags on
    fn await_settled(&self, subscription: &Subscription, path: &Path) -> FileState {
        loop {
            if let Some(state) = subscription.wait_for_terminal_state(FETCH_WAIT_SLICE) {
                return state;
            }
            debug!(path = %path.display(), "still waiting for in-flight fetch");
        }
    }
}

impl std::fmt::Debug for FileSystemCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemCache")
            .field("root", &self.inner.config.root)
            .field("capacity_bytes", &self.inner.config.capacity_bytes)
            .field("entry_count", &self.inner.index.len())
            .field("current_weight", &self.inner.lru.current_weight())
            .finish()
    }
}

impl CacheInner {
    /// Decode a local path and build its managed file
    fn construct(&self, path: &Path) -> Result<Arc<ManagedFile>> {
        let (identity, relative) = self.codec.from_local(path).ok_or_else(|| {
            CacheError::invalid_path(path, "not a recognized cache layout under the root")
        })?;
        Ok(Arc::new(ManagedFile::new(
            path.to_path_buf(),
            identity,
            relative,
            self.config.retry_interval,
        )))
    }

    /// Install the candidate into the index and the eviction engine.
    /// Returns the canonical file for the path and whether the candidate
    /// won the slot.
    fn admit(self: &Arc<Self>, candidate: Arc<ManagedFile>) -> (Arc<ManagedFile>, bool) {
        // wire the size notifications up before the file becomes visible;
        // the engine reconciles, so an early notification is harmless
        let weak: Weak<CacheInner> = Arc::downgrade(self);
        let path: PathBuf = candidate.local_path().to_path_buf();
        candidate.install_weight_callback(Box::new(move |_delta| {
            if let Some(inner) = weak.upgrade() {
                inner.lru.on_size_changed(&path, &*inner);
            }
        }));

        let (file, fresh) = self.index.insert_or_get(candidate);
        if !fresh {
            return (file, false);
        }

        match self.lru.admit(&file, &**self) {
            Admission::Admitted => {}
            Admission::AdmittedOverCapacity => self.stats.record_capacity_overflow(),
            Admission::AlreadyPresent => {
                // index and engine disagree; should not happen, keep serving
                warn!(path = %file.local_path().display(), "admission found a stale engine entry");
            }
        }

        (file, true)
    }

    /// Promote a file's recency, both on disk and in the engine
    fn touch(&self, file: &Arc<ManagedFile>) {
        let now = SystemTime::now();
        if let Err(e) = file.set_last_access(now) {
            debug!(
                path = %file.local_path().display(),
                error = %e,
                "recency stamp not written through"
            );
        }
        self.lru.touch(file.local_path(), now);
    }
}

impl EvictionSink for CacheInner {
    fn evict(&self, file: &Arc<ManagedFile>) -> bool {
        let clear_to_unlink = file.mark_for_deletion();
        if file.state() != FileState::MarkedForDeletion {
            return false;
        }
        self.index.remove_exact(file);
        if clear_to_unlink {
            file.drop_from_disk();
        }
        // otherwise the last subscriber unlinks on its way out
        self.stats.record_eviction();
        info!(
            path = %file.local_path().display(),
            weight = file.estimated_size(),
            "evicted from cache"
        );
        true
    }
}
