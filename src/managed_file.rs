//! Per-file state machine for cached files
//!
//! One `ManagedFile` exists per cached path. It owns the file's state,
//! the reader and subscriber counts, the size accounting that feeds the
//! eviction engine, and the condition readers block on while a download
//! is in flight. State lives in an atomic so readers can observe it
//! lock-free; the transitions that must be exclusive (mark-for-deletion,
//! the resync retry, open/close boundaries) go through compare-and-swap
//! under the per-file signal mutex, which is a leaf lock.

use parking_lot::{Condvar, Mutex, RwLock};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

use crate::errors::{CacheError, Result};
use crate::paths::{PathCodec, RemoteIdentity};

/// State of one cached file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileState {
    /// Registered but not yet claimed by anything
    Amorphous = 0,
    /// Being read from the network right now
    InUseBySync = 1,
    /// Held open by at least one reader; locked against eviction
    HasClients = 2,
    /// Materialized on disk with no readers; the only fully evictable state
    Idle = 3,
    /// The last fetch failed; unusable until the retry window elapses
    Forbidden = 4,
    /// Terminal; the file is leaving the cache and must not be relied on
    MarkedForDeletion = 5,
    /// Being written by an external scenario; locked against eviction
    UnderWrite = 6,
}

impl FileState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Amorphous,
            1 => Self::InUseBySync,
            2 => Self::HasClients,
            3 => Self::Idle,
            4 => Self::Forbidden,
            5 => Self::MarkedForDeletion,
            6 => Self::UnderWrite,
            _ => unreachable!("invalid file state tag: {value}"),
        }
    }

    /// States a waiter keeps sleeping through; everything else settles it
    fn is_pending(&self) -> bool {
        matches!(self, Self::Amorphous | Self::InUseBySync)
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Amorphous => "amorphous",
            Self::InUseBySync => "in-use-by-sync",
            Self::HasClients => "has-clients",
            Self::Idle => "idle",
            Self::Forbidden => "forbidden",
            Self::MarkedForDeletion => "marked-for-deletion",
            Self::UnderWrite => "under-write",
        };
        f.write_str(name)
    }
}

/// Callback fired with the signed size delta whenever the estimated size
/// changes; installed by the eviction engine at admission
pub type WeightCallback = Box<dyn Fn(i64) + Send + Sync>;

/// One cached file and its state machine
pub struct ManagedFile {
    local_path: PathBuf,
    remote: RemoteIdentity,
    relative: String,

    state: AtomicU8,
    users: AtomicU32,
    subscribers: AtomicU32,

    estimated_size: AtomicU64,
    sizes: Mutex<SizeTracker>,
    weight_changed: RwLock<Option<WeightCallback>>,

    retry_interval: Duration,
    last_sync_attempt: Mutex<Option<Instant>>,

    signal: Mutex<()>,
    state_changed: Condvar,
}

struct SizeTracker {
    previous: u64,
}

impl ManagedFile {
    /// Create a file in the `Amorphous` state
    pub fn new(
        local_path: PathBuf,
        remote: RemoteIdentity,
        relative: impl Into<String>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            local_path,
            remote,
            relative: relative.into(),
            state: AtomicU8::new(FileState::Amorphous as u8),
            users: AtomicU32::new(0),
            subscribers: AtomicU32::new(0),
            estimated_size: AtomicU64::new(0),
            sizes: Mutex::new(SizeTracker { previous: 0 }),
            weight_changed: RwLock::new(None),
            retry_interval,
            last_sync_attempt: Mutex::new(None),
            signal: Mutex::new(()),
            state_changed: Condvar::new(),
        }
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn remote(&self) -> &RemoteIdentity {
        &self.remote
    }

    /// Relative file name within its origin file system
    pub fn relative_name(&self) -> &str {
        &self.relative
    }

    /// Full remote URI, for diagnostics
    pub fn remote_uri(&self) -> String {
        PathCodec::remote_uri(&self.remote, &self.relative)
    }

    pub fn state(&self) -> FileState {
        FileState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The file is materialized and consumable by readers
    pub fn exists(&self) -> bool {
        matches!(self.state(), FileState::Idle | FileState::HasClients)
    }

    /// The file has not been retired or poisoned
    pub fn valid(&self) -> bool {
        !matches!(
            self.state(),
            FileState::Forbidden | FileState::MarkedForDeletion
        )
    }

    /// Number of held reader handles
    pub fn users(&self) -> u32 {
        self.users.load(Ordering::Acquire)
    }

    /// Number of threads awaiting a state change
    pub fn subscribers(&self) -> u32 {
        self.subscribers.load(Ordering::Acquire)
    }

    /// Whether the eviction engine may consider this file a victim
    pub fn is_evictable(&self) -> bool {
        matches!(
            self.state(),
            FileState::Idle | FileState::Forbidden | FileState::Amorphous
        ) && self.users.load(Ordering::Acquire) == 0
    }

    /// Assign a new state and wake every subscriber.
    ///
    /// `MarkedForDeletion` is sticky: once observed, no other state can
    /// overwrite it. Assigning `InUseBySync` also stamps the last sync
    /// attempt for retry gating.
    pub fn set_state(&self, state: FileState) {
        let _guard = self.signal.lock();
        if self.store_state(state) {
            self.state_changed.notify_all();
        }
    }

    /// CAS loop honoring the terminal state; caller handles notification.
    /// Returns whether the store took effect.
    fn store_state(&self, state: FileState) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current == FileState::MarkedForDeletion as u8 {
                return false;
            }
            if self
                .state
                .compare_exchange(current, state as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if state == FileState::InUseBySync {
                    *self.last_sync_attempt.lock() = Some(Instant::now());
                }
                debug!(
                    path = %self.local_path.display(),
                    from = %FileState::from_u8(current),
                    to = %state,
                    "file state changed"
                );
                return true;
            }
        }
    }

    /// Try to retire the file.
    ///
    /// The compare-and-set only succeeds from `Idle`, `Forbidden` or
    /// `Amorphous`; a file with readers or an in-flight fetch refuses.
    /// Returns `true` only when the file was marked *and* no subscribers
    /// remain; when subscribers are still draining the file is marked but
    /// physical removal must wait for the last of them.
    pub fn mark_for_deletion(&self) -> bool {
        let _guard = self.signal.lock();
        let mut marked = false;
        for expected in [FileState::Idle, FileState::Forbidden, FileState::Amorphous] {
            if self
                .state
                .compare_exchange(
                    expected as u8,
                    FileState::MarkedForDeletion as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                marked = true;
                break;
            }
        }
        self.state_changed.notify_all();
        debug!(
            path = %self.local_path.display(),
            state = %self.state(),
            subscribers = self.subscribers(),
            marked,
            "deletion requested"
        );
        marked && self.subscribers.load(Ordering::Acquire) == 0
    }

    /// CAS `Amorphous` to `InUseBySync`, claiming the file for a fetch.
    /// Exactly one of any number of concurrent claimers wins; the rest
    /// subscribe and wait.
    pub fn try_claim_for_sync(&self) -> bool {
        let _guard = self.signal.lock();
        let claimed = self
            .state
            .compare_exchange(
                FileState::Amorphous as u8,
                FileState::InUseBySync as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if claimed {
            *self.last_sync_attempt.lock() = Some(Instant::now());
            self.state_changed.notify_all();
        }
        claimed
    }

    /// CAS `Forbidden` back to `InUseBySync` for a retry; loses cleanly to
    /// any concurrent transition
    pub fn try_begin_resync(&self) -> bool {
        let _guard = self.signal.lock();
        let resumed = self
            .state
            .compare_exchange(
                FileState::Forbidden as u8,
                FileState::InUseBySync as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if resumed {
            *self.last_sync_attempt.lock() = Some(Instant::now());
            self.state_changed.notify_all();
        }
        resumed
    }

    /// Register interest in state changes.
    ///
    /// Fails when the file is already marked for deletion, in which case
    /// the caller should retry its lookup from scratch. The subscription
    /// unsubscribes on drop; the last subscriber of a marked file also
    /// performs the deferred unlink.
    pub fn subscribe_for_updates(self: &Arc<Self>) -> Option<Subscription> {
        let _guard = self.signal.lock();
        if self.state() == FileState::MarkedForDeletion {
            return None;
        }
        self.subscribers.fetch_add(1, Ordering::AcqRel);
        Some(Subscription {
            file: Arc::clone(self),
        })
    }

    fn unsubscribe(&self) {
        let _guard = self.signal.lock();
        let remaining = self.subscribers.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.state() == FileState::MarkedForDeletion {
            // Eviction already forgot this file; the unlink was ours to do.
            self.drop_from_disk();
        }
    }

    /// Take a reader handle.
    ///
    /// The first reader moves the file from `Idle` to `HasClients`; both
    /// states then accept further readers. Every other state refuses.
    pub fn open(&self) -> Result<()> {
        let _guard = self.signal.lock();
        match self.state() {
            FileState::Idle => {
                self.store_state(FileState::HasClients);
                self.users.fetch_add(1, Ordering::AcqRel);
                self.state_changed.notify_all();
                Ok(())
            }
            FileState::HasClients => {
                self.users.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            state => Err(CacheError::invalid_state(&self.local_path, state, "open")),
        }
    }

    /// Release a reader handle; the last one returns the file to `Idle`
    pub fn close(&self) {
        let _guard = self.signal.lock();
        if self.users.load(Ordering::Acquire) == 0 {
            warn!(
                path = %self.local_path.display(),
                "close without a matching open"
            );
            return;
        }
        let remaining = self.users.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.state() == FileState::HasClients {
            self.store_state(FileState::Idle);
            self.state_changed.notify_all();
        }
    }

    /// Claim the file for an externally-driven write
    pub fn begin_write(&self) -> Result<()> {
        let _guard = self.signal.lock();
        match self.state() {
            FileState::Idle => {
                self.store_state(FileState::UnderWrite);
                self.state_changed.notify_all();
                Ok(())
            }
            state => Err(CacheError::invalid_state(
                &self.local_path,
                state,
                "begin write on",
            )),
        }
    }

    /// Release the external write claim
    pub fn finish_write(&self) -> Result<()> {
        let _guard = self.signal.lock();
        match self.state() {
            FileState::UnderWrite => {
                self.store_state(FileState::Idle);
                self.state_changed.notify_all();
                Ok(())
            }
            state => Err(CacheError::invalid_state(
                &self.local_path,
                state,
                "finish write on",
            )),
        }
    }

    /// Estimated size in bytes, the weight the eviction engine accounts
    pub fn estimated_size(&self) -> u64 {
        self.estimated_size.load(Ordering::Acquire)
    }

    /// Update the estimated size, pushing the signed delta to whoever
    /// installed the weight callback
    pub fn set_estimated_size(&self, size: u64) {
        let mut tracker = self.sizes.lock();
        let delta = size as i64 - tracker.previous as i64;
        tracker.previous = size;
        self.estimated_size.store(size, Ordering::Release);
        if delta != 0 {
            if let Some(callback) = self.weight_changed.read().as_ref() {
                callback(delta);
            }
        }
    }

    /// Install the weight-change callback; the file never learns who is
    /// on the other end
    pub fn install_weight_callback(&self, callback: WeightCallback) {
        *self.weight_changed.write() = Some(callback);
    }

    /// Actual size on disk; errors read as zero to keep lookups moving
    pub fn size_on_disk(&self) -> u64 {
        fs::metadata(&self.local_path).map(|m| m.len()).unwrap_or(0)
    }

    /// Recency timestamp: the filesystem mtime, or now when unreadable
    pub fn last_access(&self) -> SystemTime {
        fs::metadata(&self.local_path)
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now())
    }

    /// Stamp the recency timestamp through to the filesystem.
    ///
    /// Forbidden files refuse the write: they have nothing worth keeping
    /// recent, and a failed fetch may have left no file at all.
    pub fn set_last_access(&self, time: SystemTime) -> Result<()> {
        let state = self.state();
        if state == FileState::Forbidden {
            return Err(CacheError::invalid_state(
                &self.local_path,
                state,
                "touch",
            ));
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&self.local_path)
            .map_err(|e| CacheError::io(&self.local_path, "open for touch", e))?;
        file.set_modified(time)
            .map_err(|e| CacheError::io(&self.local_path, "set mtime", e))
    }

    /// Whether the retry window since the last sync attempt has elapsed
    pub fn should_try_resync(&self) -> bool {
        match *self.last_sync_attempt.lock() {
            Some(attempt) => attempt.elapsed() > self.retry_interval,
            None => true,
        }
    }

    /// Remaining backoff before the next resync is permitted
    pub fn resync_backoff(&self) -> Duration {
        match *self.last_sync_attempt.lock() {
            Some(attempt) => self.retry_interval.saturating_sub(attempt.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Unconditionally retire the file and unlink it, ignoring readers.
    /// Administrative removal only; eviction goes through
    /// [`mark_for_deletion`](Self::mark_for_deletion).
    pub fn force_delete(&self) {
        {
            let _guard = self.signal.lock();
            self.state
                .store(FileState::MarkedForDeletion as u8, Ordering::Release);
            self.state_changed.notify_all();
        }
        self.drop_from_disk();
    }

    /// Unlink the file from disk; absence is not an error
    pub(crate) fn drop_from_disk(&self) {
        match fs::remove_file(&self.local_path) {
            Ok(()) => debug!(path = %self.local_path.display(), "dropped from disk"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.local_path.display(),
                error = %e,
                "failed to drop file from disk"
            ),
        }
    }
}

impl std::fmt::Debug for ManagedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedFile")
            .field("local_path", &self.local_path)
            .field("remote", &self.remote_uri())
            .field("state", &self.state())
            .field("users", &self.users())
            .field("subscribers", &self.subscribers())
            .field("estimated_size", &self.estimated_size())
            .finish()
    }
}

/// Live interest in one file's state changes; drops its registration
/// (and performs any deferred unlink) when released
pub struct Subscription {
    file: Arc<ManagedFile>,
}

impl Subscription {
    /// Block until the file leaves its pending states or the timeout
    /// elapses. Returns the settled state, or `None` on timeout.
    pub fn wait_for_terminal_state(&self, timeout: Duration) -> Option<FileState> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.file.signal.lock();
        loop {
            let state = self.file.state();
            if !state.is_pending() {
                return Some(state);
            }
            if self
                .file
                .state_changed
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                let state = self.file.state();
                return if state.is_pending() { None } else { Some(state) };
            }
        }
    }

    pub fn file(&self) -> &Arc<ManagedFile> {
        &self.file
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.file.unsubscribe();
    }
}
