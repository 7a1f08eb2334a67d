//! Fetch coordination against the remote DFS subsystem
//!
//! The coordinator turns a cache miss into exactly one download. The
//! download itself runs outside this crate, behind [`PrepareService`]:
//! the coordinator submits a request, then blocks the calling thread on
//! a per-task condition until the subsystem fires its completion
//! callback. Concurrent misses for the same path never reach this module
//! twice; they observe the in-flight state through the index and
//! subscribe to the file instead.

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::errors::{CacheError, Result};
use crate::managed_file::{FileState, ManagedFile};
use crate::paths::RemoteIdentity;

/// How the prepare subsystem answered a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingStatus {
    /// Accepted; the completion callback will fire exactly once
    AsyncScheduled,
    /// No adaptor is configured for the requested namenode
    NamenodeNotConfigured,
    /// The namenode could not be reached
    NamenodeUnreachable,
    /// Rejected for any other reason
    Rejected,
}

/// Terminal status of one download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    CompletedOk,
    Failed,
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CompletedOk => "completed-ok",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Transfer progress of one file within a prepare request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProgress {
    pub relative_name: String,
    pub transferred_bytes: u64,
    pub total_bytes: Option<u64>,
    pub completed: bool,
}

/// Aggregate transfer metrics reported by the subsystem
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferPerformance {
    pub elapsed: Duration,
    pub transferred_bytes: u64,
}

/// Everything the completion callback reports about one request
#[derive(Debug, Clone)]
pub struct PrepareOutcome {
    pub session: Uuid,
    pub progress: Vec<FileProgress>,
    pub performance: TransferPerformance,
    pub overall_ok: bool,
    pub cancelled: bool,
    pub status: TaskStatus,
}

/// One download request handed to the prepare subsystem
pub struct PrepareRequest {
    /// Opaque request token; owned by the cache for the duration of the
    /// request and echoed back in the outcome
    pub session: Uuid,
    /// Which namenode to read from
    pub descriptor: RemoteIdentity,
    /// Files to materialize, relative to the namenode root
    pub relative_names: Vec<String>,
    /// Cooperative cancellation flag; the download loop should poll it
    /// between blocks and report `cancelled` on exit
    pub cancel: CancelToken,
}

/// Completion callback; must be invoked exactly once per accepted request
pub type PrepareCallback = Box<dyn FnOnce(PrepareOutcome) + Send>;

/// The download subsystem the cache delegates network reads to
pub trait PrepareService: Send + Sync {
    fn prepare(&self, request: PrepareRequest, completion: PrepareCallback) -> SchedulingStatus;
}

/// Shared state of one in-flight download
pub struct FetchTask {
    cancelled: AtomicBool,
    done: Mutex<Option<PrepareOutcome>>,
    completed: Condvar,
}

impl FetchTask {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            done: Mutex::new(None),
            completed: Condvar::new(),
        }
    }

    fn complete(&self, outcome: PrepareOutcome) {
        let mut slot = self.done.lock();
        if slot.is_some() {
            warn!(session = %outcome.session, "duplicate completion callback ignored");
            return;
        }
        *slot = Some(outcome);
        self.completed.notify_all();
    }

    /// Block until the completion callback has fired
    fn wait(&self) -> PrepareOutcome {
        let mut slot = self.done.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.completed.wait(&mut slot);
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Cancellation view of a fetch task, cloned into the prepare request
#[derive(Clone)]
pub struct CancelToken {
    task: Arc<FetchTask>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }
}

/// Runs downloads for cache misses, one at a time per path
pub struct SyncCoordinator {
    service: Arc<dyn PrepareService>,
    active: DashMap<PathBuf, Arc<FetchTask>>,
}

impl SyncCoordinator {
    pub fn new(service: Arc<dyn PrepareService>) -> Self {
        Self {
            service,
            active: DashMap::new(),
        }
    }

    /// Drive one download to a terminal state, blocking the caller.
    ///
    /// The file must already belong to the caller: either freshly
    /// admitted or won through the forbidden-retry CAS. On return the
    /// file is `Idle` (success) or `Forbidden` (anything else).
    pub fn run_prepare(&self, file: &Arc<ManagedFile>) -> Result<()> {
        let path = file.local_path().to_path_buf();
        let session = Uuid::new_v4();

        file.set_state(FileState::InUseBySync);

        let task = Arc::new(FetchTask::new());
        self.active.insert(path.clone(), Arc::clone(&task));

        let completion_task = Arc::clone(&task);
        let completion: PrepareCallback = Box::new(move |outcome| {
            completion_task.complete(outcome);
        });

        let request = PrepareRequest {
            session,
            descriptor: file.remote().clone(),
            relative_names: vec![file.relative_name().to_string()],
            cancel: CancelToken {
                task: Arc::clone(&task),
            },
        };

        debug!(
            session = %session,
            remote = %file.remote_uri(),
            "submitting prepare request"
        );

        let status = self.service.prepare(request, completion);
        if status != SchedulingStatus::AsyncScheduled {
            self.active.remove(&path);
            error!(
                session = %session,
                remote = %file.remote_uri(),
                ?status,
                "prepare request was not scheduled"
            );
            file.set_estimated_size(0);
            file.set_state(FileState::Forbidden);
            return Err(match status {
                SchedulingStatus::NamenodeNotConfigured => CacheError::NamenodeNotConfigured {
                    descriptor: file.remote().clone(),
                },
                SchedulingStatus::NamenodeUnreachable => CacheError::NamenodeUnreachable {
                    descriptor: file.remote().clone(),
                },
                _ => CacheError::request_failed(path, TaskStatus::Failed),
            });
        }

        let outcome = task.wait();
        self.active.remove(&path);

        if outcome.session != session {
            warn!(
                expected = %session,
                received = %outcome.session,
                "completion callback for a different session"
            );
        }
        if outcome.progress.len() != 1 {
            warn!(
                session = %session,
                reported = outcome.progress.len(),
                "unexpected progress count in completion"
            );
        }

        if outcome.overall_ok && !outcome.cancelled && outcome.status == TaskStatus::CompletedOk {
            file.set_estimated_size(file.size_on_disk());
            file.set_state(FileState::Idle);
            debug!(
                session = %session,
                remote = %file.remote_uri(),
                bytes = outcome.performance.transferred_bytes,
                "file materialized"
            );
            Ok(())
        } else {
            let status = if outcome.cancelled {
                TaskStatus::Cancelled
            } else {
                outcome.status
            };
            error!(
                session = %session,
                remote = %file.remote_uri(),
                %status,
                "prepare request failed"
            );
            file.set_estimated_size(0);
            file.set_state(FileState::Forbidden);
            Err(CacheError::request_failed(path, status))
        }
    }

    /// Flag an in-flight download for cancellation.
    ///
    /// With `wait` set this blocks until the download loop acknowledges
    /// by firing its completion; otherwise it returns immediately.
    /// Returns whether a download was in flight for the path.
    pub fn cancel(&self, path: &std::path::Path, wait: bool) -> bool {
        let Some(task) = self.active.get(path).map(|entry| Arc::clone(entry.value())) else {
            return false;
        };
        task.cancel();
        debug!(path = %path.display(), wait, "fetch cancellation requested");
        if wait {
            let _ = task.wait();
        }
        true
    }

    /// Number of downloads currently in flight
    pub fn in_flight(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::DfsScheme;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct ScriptedService {
        status: SchedulingStatus,
        outcome_ok: bool,
        write_bytes: usize,
        calls: AtomicUsize,
    }

    impl PrepareService for ScriptedService {
        fn prepare(&self, request: PrepareRequest, completion: PrepareCallback) -> SchedulingStatus {
            self.calls.fetch_add(1, Ordering::AcqRel);
            if self.status != SchedulingStatus::AsyncScheduled {
                return self.status;
            }
            let ok = self.outcome_ok;
            let session = request.session;
            let relative = request.relative_names[0].clone();
            completion(PrepareOutcome {
                session,
                progress: vec![FileProgress {
                    relative_name: relative,
                    transferred_bytes: self.write_bytes as u64,
                    total_bytes: Some(self.write_bytes as u64),
                    completed: ok,
                }],
                performance: TransferPerformance {
                    elapsed: Duration::from_millis(1),
                    transferred_bytes: self.write_bytes as u64,
                },
                overall_ok: ok,
                cancelled: false,
                status: if ok { TaskStatus::CompletedOk } else { TaskStatus::Failed },
            });
            SchedulingStatus::AsyncScheduled
        }
    }

    fn test_file(dir: &TempDir) -> Arc<ManagedFile> {
        Arc::new(ManagedFile::new(
            dir.path().join("hdfs/nn_8020/part-0"),
            RemoteIdentity::new(DfsScheme::Hdfs, "nn", 8020),
            "part-0",
            Duration::from_secs(60),
        ))
    }

    #[test]
    fn success_leaves_file_idle() {
        let dir = TempDir::new().unwrap();
        let file = test_file(&dir);
        fs::create_dir_all(file.local_path().parent().unwrap()).unwrap();
        fs::write(file.local_path(), vec![0u8; 64]).unwrap();

        let service = Arc::new(ScriptedService {
            status: SchedulingStatus::AsyncScheduled,
            outcome_ok: true,
            write_bytes: 64,
            calls: AtomicUsize::new(0),
        });
        let coordinator = SyncCoordinator::new(service.clone());

        coordinator.run_prepare(&file).unwrap();
        assert_eq!(file.state(), FileState::Idle);
        assert_eq!(file.estimated_size(), 64);
        assert_eq!(service.calls.load(Ordering::Acquire), 1);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[test]
    fn callback_failure_forbids_file() {
        let dir = TempDir::new().unwrap();
        let file = test_file(&dir);
        let service = Arc::new(ScriptedService {
            status: SchedulingStatus::AsyncScheduled,
            outcome_ok: false,
            write_bytes: 0,
            calls: AtomicUsize::new(0),
        });
        let coordinator = SyncCoordinator::new(service);

        let err = coordinator.run_prepare(&file).unwrap_err();
        assert!(matches!(err, CacheError::RequestFailed { .. }));
        assert_eq!(file.state(), FileState::Forbidden);
        assert_eq!(file.estimated_size(), 0);
    }

    #[test]
    fn scheduling_refusal_maps_to_error_kind() {
        let dir = TempDir::new().unwrap();
        let file = test_file(&dir);
        let service = Arc::new(ScriptedService {
            status: SchedulingStatus::NamenodeNotConfigured,
            outcome_ok: false,
            write_bytes: 0,
            calls: AtomicUsize::new(0),
        });
        let coordinator = SyncCoordinator::new(service);

        let err = coordinator.run_prepare(&file).unwrap_err();
        assert!(matches!(err, CacheError::NamenodeNotConfigured { .. }));
        assert_eq!(file.state(), FileState::Forbidden);
    }

    #[test]
    fn cancel_without_in_flight_download() {
        let service = Arc::new(ScriptedService {
            status: SchedulingStatus::AsyncScheduled,
            outcome_ok: true,
            write_bytes: 0,
            calls: AtomicUsize::new(0),
        });
        let coordinator = SyncCoordinator::new(service);
        assert!(!coordinator.cancel(std::path::Path::new("/nope"), false));
    }
}
