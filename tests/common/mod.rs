//! Shared fixtures for cache integration tests

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use dfs_cache::paths::PathCodec;
use dfs_cache::sync::{
    FileProgress, PrepareCallback, PrepareOutcome, PrepareRequest, PrepareService,
    SchedulingStatus, TaskStatus, TransferPerformance,
};

/// What the fake subsystem does with the next accepted request
#[derive(Debug, Clone, Copy)]
pub enum FakeBehavior {
    /// Materialize the file with `size` bytes after `delay`, then succeed
    Succeed { size: usize, delay: Duration },
    /// Report failure without materializing anything
    Fail,
    /// Refuse to schedule at all
    RefuseScheduling,
    /// Poll the cancel flag until it trips, then report cancellation
    BlockUntilCancelled,
}

/// Stand-in for the DFS download subsystem.
///
/// Each accepted request runs on its own thread, the way the real
/// subsystem runs downloads on its worker pool, and fires the completion
/// callback exactly once.
pub struct FakeDfs {
    codec: PathCodec,
    behavior: Mutex<FakeBehavior>,
    calls: AtomicUsize,
}

impl FakeDfs {
    pub fn new(cache_root: impl Into<PathBuf>, behavior: FakeBehavior) -> Arc<Self> {
        Arc::new(Self {
            codec: PathCodec::new(cache_root),
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
        })
    }

    /// Number of prepare requests that reached the subsystem
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    pub fn set_behavior(&self, behavior: FakeBehavior) {
        *self.behavior.lock() = behavior;
    }

    fn outcome(
        request: &PrepareRequest,
        transferred: u64,
        ok: bool,
        cancelled: bool,
        status: TaskStatus,
    ) -> PrepareOutcome {
        PrepareOutcome {
            session: request.session,
            progress: vec![FileProgress {
                relative_name: request.relative_names[0].clone(),
                transferred_bytes: transferred,
                total_bytes: Some(transferred),
                completed: ok,
            }],
            performance: TransferPerformance {
                elapsed: Duration::from_millis(1),
                transferred_bytes: transferred,
            },
            overall_ok: ok,
            cancelled,
            status,
        }
    }
}

impl PrepareService for FakeDfs {
    fn prepare(&self, request: PrepareRequest, completion: PrepareCallback) -> SchedulingStatus {
        let behavior = *self.behavior.lock();
        if matches!(behavior, FakeBehavior::RefuseScheduling) {
            return SchedulingStatus::NamenodeUnreachable;
        }
        self.calls.fetch_add(1, Ordering::AcqRel);

        let local = self
            .codec
            .to_local(&request.descriptor, &request.relative_names[0]);

        thread::spawn(move || match behavior {
            FakeBehavior::Succeed { size, delay } => {
                thread::sleep(delay);
                fs::create_dir_all(local.parent().unwrap()).unwrap();
                fs::write(&local, vec![0u8; size]).unwrap();
                let outcome =
                    FakeDfs::outcome(&request, size as u64, true, false, TaskStatus::CompletedOk);
                completion(outcome);
            }
            FakeBehavior::Fail => {
                let outcome = FakeDfs::outcome(&request, 0, false, false, TaskStatus::Failed);
                completion(outcome);
            }
            FakeBehavior::BlockUntilCancelled => {
                while !request.cancel.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                let outcome = FakeDfs::outcome(&request, 0, false, true, TaskStatus::Cancelled);
                completion(outcome);
            }
            FakeBehavior::RefuseScheduling => unreachable!(),
        });

        SchedulingStatus::AsyncScheduled
    }
}

/// Write `size` bytes at `path` and force its mtime
pub fn write_file_with_mtime(path: &Path, size: usize, mtime: SystemTime) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, vec![0u8; size]).unwrap();
    let handle = fs::OpenOptions::new().write(true).open(path).unwrap();
    handle.set_modified(mtime).unwrap();
}

pub fn epoch_secs(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}
