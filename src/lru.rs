//! Admission, weight accounting and eviction
//!
//! The engine keeps the recency order and the accounted weight of every
//! admitted file under one admission lock. Recency keys are (mtime
//! millis, insertion sequence), so scans run oldest-first and files
//! sharing a timestamp fall back to insertion order.
//!
//! Weight bookkeeping reconciles rather than accumulates: each entry
//! remembers the weight it is accounted at, and every size-change
//! notification re-reads the file's current estimate and applies the
//! difference. A notification racing admission can therefore never
//! double-count or strand a delta.
//!
//! The engine selects victims but never disposes of them itself: the
//! owning cache passes an [`EvictionSink`] that marks a file, unlinks it
//! and forgets it from the index, all while the admission lock is held.
//! The sink must not call back into the engine.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::managed_file::ManagedFile;

/// Disposes one eviction victim. Returns `false` when the victim could
/// not be marked for deletion (it grew readers or a fetch in the
/// meantime), in which case the engine skips it.
pub trait EvictionSink: Send + Sync {
    fn evict(&self, file: &Arc<ManagedFile>) -> bool;
}

/// Outcome of admitting one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Inserted within capacity
    Admitted,
    /// Inserted, but no idle victim remained and the cache is over budget.
    /// Informational; the insertion still stands.
    AdmittedOverCapacity,
    /// The path is already tracked; the candidate was not inserted
    AlreadyPresent,
}

type RecencyKey = (u64, u64);

struct EntryMeta {
    key: RecencyKey,
    /// Weight this entry currently contributes to the total
    accounted: u64,
    file: Arc<ManagedFile>,
}

#[derive(Default)]
struct LruInner {
    entries: HashMap<PathBuf, EntryMeta>,
    recency: BTreeMap<RecencyKey, PathBuf>,
    next_seq: u64,
    weight: u64,
}

/// LRU engine over the managed files
pub struct LruEngine {
    capacity_bytes: u64,
    /// Mirror of the locked weight for lock-free statistics reads
    current_weight: AtomicU64,
    start_time: Mutex<Option<SystemTime>>,
    inner: Mutex<LruInner>,
}

fn timestamp_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl LruEngine {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            current_weight: AtomicU64::new(0),
            start_time: Mutex::new(None),
            inner: Mutex::new(LruInner::default()),
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Accounted weight of all admitted files
    pub fn current_weight(&self) -> u64 {
        self.current_weight.load(Ordering::Acquire)
    }

    /// Timestamp of the oldest file seen at the last reload
    pub fn start_time(&self) -> Option<SystemTime> {
        *self.start_time.lock()
    }

    pub fn set_start_time(&self, time: SystemTime) {
        *self.start_time.lock() = Some(time);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admit a file, evicting idle victims first when its weight does not
    /// fit. When only non-idle files remain the insertion proceeds over
    /// capacity; readers cannot be thrown out to make room.
    pub fn admit(&self, file: &Arc<ManagedFile>, sink: &dyn EvictionSink) -> Admission {
        let weight = file.estimated_size();
        let mut inner = self.inner.lock();

        if inner.entries.contains_key(file.local_path()) {
            return Admission::AlreadyPresent;
        }

        self.evict_until_fits(&mut inner, weight, sink);

        let path = file.local_path().to_path_buf();
        let key = (timestamp_millis(file.last_access()), inner.next_seq);
        inner.next_seq += 1;
        inner.recency.insert(key, path.clone());
        inner.entries.insert(
            path,
            EntryMeta {
                key,
                accounted: weight,
                file: Arc::clone(file),
            },
        );
        inner.weight = inner.weight.saturating_add(weight);
        self.current_weight.store(inner.weight, Ordering::Release);

        if inner.weight > self.capacity_bytes {
            warn!(
                path = %file.local_path().display(),
                weight,
                current_weight = inner.weight,
                capacity = self.capacity_bytes,
                "capacity exceeded with no evictable victim"
            );
            Admission::AdmittedOverCapacity
        } else {
            Admission::Admitted
        }
    }

    /// Promote a file to the recency tail
    pub fn touch(&self, path: &Path, now: SystemTime) {
        let mut inner = self.inner.lock();
        let next_seq = inner.next_seq;
        let Some(meta) = inner.entries.get_mut(path) else {
            return;
        };
        let old_key = meta.key;
        meta.key = (timestamp_millis(now), next_seq);
        let new_key = meta.key;
        inner.next_seq += 1;
        inner.recency.remove(&old_key);
        inner.recency.insert(new_key, path.to_path_buf());
    }

    /// Reconcile an entry's accounted weight with the file's current
    /// estimate. Growth past capacity reruns the eviction scan.
    pub fn on_size_changed(&self, path: &Path, sink: &dyn EvictionSink) {
        let mut inner = self.inner.lock();
        let Some(meta) = inner.entries.get_mut(path) else {
            // the file left the cache (or is not admitted yet); admission
            // reads the up-to-date size itself
            return;
        };
        let current = meta.file.estimated_size();
        let previous = meta.accounted;
        if current == previous {
            return;
        }
        meta.accounted = current;
        inner.weight = inner
            .weight
            .saturating_sub(previous)
            .saturating_add(current);
        self.current_weight.store(inner.weight, Ordering::Release);

        if current > previous && inner.weight > self.capacity_bytes {
            self.evict_until_fits(&mut inner, 0, sink);
        }
    }

    /// Forget a file without disposing of it; returns it when tracked
    pub fn remove(&self, path: &Path) -> Option<Arc<ManagedFile>> {
        let mut inner = self.inner.lock();
        let meta = inner.entries.remove(path)?;
        inner.recency.remove(&meta.key);
        inner.weight = inner.weight.saturating_sub(meta.accounted);
        self.current_weight.store(inner.weight, Ordering::Release);
        Some(meta.file)
    }

    /// Entries in eviction order, least recent first
    pub fn iter_lru(&self) -> Vec<Arc<ManagedFile>> {
        let inner = self.inner.lock();
        inner
            .recency
            .values()
            .filter_map(|path| inner.entries.get(path))
            .map(|meta| Arc::clone(&meta.file))
            .collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.weight = 0;
        self.current_weight.store(0, Ordering::Release);
    }

    /// Walk the recency order front-to-back evicting idle victims until
    /// `incoming` more bytes fit or no victim remains.
    fn evict_until_fits(&self, inner: &mut LruInner, incoming: u64, sink: &dyn EvictionSink) {
        if inner.weight.saturating_add(incoming) <= self.capacity_bytes {
            return;
        }

        let scan: Vec<PathBuf> = inner.recency.values().cloned().collect();
        for path in scan {
            if inner.weight.saturating_add(incoming) <= self.capacity_bytes {
                break;
            }
            let Some(meta) = inner.entries.get(&path) else {
                continue;
            };
            let file = Arc::clone(&meta.file);
            if !file.is_evictable() {
                continue;
            }
            if !sink.evict(&file) {
                // lost the race against a new reader or fetch
                continue;
            }
            let Some(meta) = inner.entries.remove(&path) else {
                continue;
            };
            inner.recency.remove(&meta.key);
            inner.weight = inner.weight.saturating_sub(meta.accounted);
            self.current_weight.store(inner.weight, Ordering::Release);
            debug!(
                path = %path.display(),
                freed = meta.accounted,
                current_weight = inner.weight,
                "evicted"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed_file::FileState;
    use crate::paths::{DfsScheme, RemoteIdentity};
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Sink that marks and counts, without an index to maintain
    #[derive(Default)]
    struct CountingSink {
        evicted: AtomicUsize,
    }

    impl EvictionSink for CountingSink {
        fn evict(&self, file: &Arc<ManagedFile>) -> bool {
            file.mark_for_deletion();
            if file.state() != FileState::MarkedForDeletion {
                return false;
            }
            self.evicted.fetch_add(1, Ordering::AcqRel);
            true
        }
    }

    fn file_with_mtime(dir: &TempDir, name: &str, size: u64, mtime_secs: u64) -> Arc<ManagedFile> {
        let local = dir.path().join("hdfs").join("nn_8020").join(name);
        fs::create_dir_all(local.parent().unwrap()).unwrap();
        fs::write(&local, vec![0u8; size as usize]).unwrap();
        let handle = fs::OpenOptions::new().write(true).open(&local).unwrap();
        handle
            .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime_secs))
            .unwrap();

        let file = Arc::new(ManagedFile::new(
            local,
            RemoteIdentity::new(DfsScheme::Hdfs, "nn", 8020),
            name.to_string(),
            Duration::from_secs(60),
        ));
        file.set_estimated_size(size);
        file.set_state(FileState::Idle);
        file
    }

    #[test]
    fn admits_within_capacity() {
        let dir = TempDir::new().unwrap();
        let engine = LruEngine::new(100);
        let sink = CountingSink::default();

        let file = file_with_mtime(&dir, "a", 30, 10);
        assert_eq!(engine.admit(&file, &sink), Admission::Admitted);
        assert_eq!(engine.current_weight(), 30);
        assert_eq!(sink.evicted.load(Ordering::Acquire), 0);
    }

    #[test]
    fn evicts_oldest_idle_first() {
        let dir = TempDir::new().unwrap();
        let engine = LruEngine::new(50);
        let sink = CountingSink::default();

        let a = file_with_mtime(&dir, "a", 30, 1);
        let b = file_with_mtime(&dir, "b", 20, 2);
        engine.admit(&a, &sink);
        engine.admit(&b, &sink);
        assert_eq!(engine.current_weight(), 50);

        let c = file_with_mtime(&dir, "c", 25, 3);
        assert_eq!(engine.admit(&c, &sink), Admission::Admitted);

        // A was oldest and idle
        assert_eq!(a.state(), FileState::MarkedForDeletion);
        assert_eq!(b.state(), FileState::Idle);
        assert_eq!(engine.current_weight(), 45);
        assert_eq!(sink.evicted.load(Ordering::Acquire), 1);
    }

    #[test]
    fn skips_files_with_clients() {
        let dir = TempDir::new().unwrap();
        let engine = LruEngine::new(50);
        let sink = CountingSink::default();

        let a = file_with_mtime(&dir, "a", 30, 1);
        a.open().unwrap(); // oldest, but in use
        let b = file_with_mtime(&dir, "b", 30, 2);
        engine.admit(&a, &sink);
        engine.admit(&b, &sink);

        let c = file_with_mtime(&dir, "c", 20, 3);
        assert_eq!(engine.admit(&c, &sink), Admission::Admitted);

        assert_eq!(a.state(), FileState::HasClients);
        assert_eq!(b.state(), FileState::MarkedForDeletion);
        assert_eq!(engine.current_weight(), 50);
    }

    #[test]
    fn overflow_when_nothing_evictable() {
        let dir = TempDir::new().unwrap();
        let engine = LruEngine::new(50);
        let sink = CountingSink::default();

        let a = file_with_mtime(&dir, "a", 30, 1);
        a.open().unwrap();
        let b = file_with_mtime(&dir, "b", 30, 2);
        b.set_state(FileState::InUseBySync);
        engine.admit(&a, &sink);
        engine.admit(&b, &sink);

        let c = file_with_mtime(&dir, "c", 10, 3);
        assert_eq!(engine.admit(&c, &sink), Admission::AdmittedOverCapacity);
        assert_eq!(engine.current_weight(), 70);
        assert_eq!(sink.evicted.load(Ordering::Acquire), 0);
    }

    #[test]
    fn equal_timestamps_evict_in_insertion_order() {
        let dir = TempDir::new().unwrap();
        let engine = LruEngine::new(60);
        let sink = CountingSink::default();

        let a = file_with_mtime(&dir, "a", 30, 5);
        let b = file_with_mtime(&dir, "b", 30, 5);
        engine.admit(&a, &sink);
        engine.admit(&b, &sink);

        let c = file_with_mtime(&dir, "c", 10, 6);
        engine.admit(&c, &sink);

        assert_eq!(a.state(), FileState::MarkedForDeletion);
        assert_eq!(b.state(), FileState::Idle);
    }

    #[test]
    fn touch_promotes_out_of_victim_position() {
        let dir = TempDir::new().unwrap();
        let engine = LruEngine::new(60);
        let sink = CountingSink::default();

        let a = file_with_mtime(&dir, "a", 30, 1);
        let b = file_with_mtime(&dir, "b", 30, 2);
        engine.admit(&a, &sink);
        engine.admit(&b, &sink);

        engine.touch(a.local_path(), SystemTime::now());

        let c = file_with_mtime(&dir, "c", 10, 3);
        engine.admit(&c, &sink);

        assert_eq!(a.state(), FileState::Idle);
        assert_eq!(b.state(), FileState::MarkedForDeletion);
    }

    #[test]
    fn growth_past_capacity_reruns_eviction() {
        let dir = TempDir::new().unwrap();
        let engine = LruEngine::new(50);
        let sink = CountingSink::default();

        let a = file_with_mtime(&dir, "a", 30, 1);
        let b = file_with_mtime(&dir, "b", 10, 2);
        engine.admit(&a, &sink);
        engine.admit(&b, &sink);
        assert_eq!(engine.current_weight(), 40);

        // b grows from 10 to 30: 60 > 50, a is the oldest idle victim
        b.set_estimated_size(30);
        engine.on_size_changed(b.local_path(), &sink);

        assert_eq!(a.state(), FileState::MarkedForDeletion);
        assert_eq!(engine.current_weight(), 30);
    }

    #[test]
    fn shrink_never_evicts() {
        let dir = TempDir::new().unwrap();
        let engine = LruEngine::new(50);
        let sink = CountingSink::default();

        let a = file_with_mtime(&dir, "a", 40, 1);
        engine.admit(&a, &sink);
        a.set_estimated_size(10);
        engine.on_size_changed(a.local_path(), &sink);

        assert_eq!(engine.current_weight(), 10);
        assert_eq!(sink.evicted.load(Ordering::Acquire), 0);
    }

    #[test]
    fn size_change_reconciliation_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let engine = LruEngine::new(100);
        let sink = CountingSink::default();

        let a = file_with_mtime(&dir, "a", 10, 1);
        engine.admit(&a, &sink);

        a.set_estimated_size(25);
        engine.on_size_changed(a.local_path(), &sink);
        // a stale second notification changes nothing
        engine.on_size_changed(a.local_path(), &sink);

        assert_eq!(engine.current_weight(), 25);
    }

    #[test]
    fn size_change_for_untracked_path_is_ignored() {
        let dir = TempDir::new().unwrap();
        let engine = LruEngine::new(100);
        let sink = CountingSink::default();

        let a = file_with_mtime(&dir, "a", 10, 1);
        engine.on_size_changed(a.local_path(), &sink);
        assert_eq!(engine.current_weight(), 0);
    }

    #[test]
    fn duplicate_admission_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = LruEngine::new(100);
        let sink = CountingSink::default();

        let a = file_with_mtime(&dir, "a", 30, 1);
        assert_eq!(engine.admit(&a, &sink), Admission::Admitted);
        assert_eq!(engine.admit(&a, &sink), Admission::AlreadyPresent);
        assert_eq!(engine.current_weight(), 30);
    }

    #[test]
    fn iter_lru_is_oldest_first() {
        let dir = TempDir::new().unwrap();
        let engine = LruEngine::new(1000);
        let sink = CountingSink::default();

        let b = file_with_mtime(&dir, "b", 1, 20);
        let a = file_with_mtime(&dir, "a", 1, 10);
        let c = file_with_mtime(&dir, "c", 1, 30);
        engine.admit(&b, &sink);
        engine.admit(&a, &sink);
        engine.admit(&c, &sink);

        let order: Vec<String> = engine
            .iter_lru()
            .iter()
            .map(|f| f.relative_name().to_string())
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
    }
}
