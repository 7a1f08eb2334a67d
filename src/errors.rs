//! Error handling for the cache layer
//!
//! Every fallible cache operation returns a discriminated error carrying
//! enough context to act on, plus a recovery hint for operational tooling.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::managed_file::FileState;
use crate::paths::RemoteIdentity;
use crate::sync::TaskStatus;

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error type for cache operations
#[derive(Debug)]
pub enum CacheError {
    /// I/O errors during cache operations
    Io {
        path: PathBuf,
        operation: &'static str,
        source: std::io::Error,
    },

    /// A local path does not decode to a remote identity
    InvalidPath { path: PathBuf, reason: String },

    /// The prepare subsystem has no adaptor for the requested namenode
    NamenodeNotConfigured { descriptor: RemoteIdentity },

    /// The prepare subsystem could not reach the requested namenode
    NamenodeUnreachable { descriptor: RemoteIdentity },

    /// The download completed with a non-success status
    RequestFailed { path: PathBuf, status: TaskStatus },

    /// Lookup miss while autoload is disabled
    NotFound { path: PathBuf },

    /// The file failed its last fetch and the retry window has not elapsed
    Forbidden {
        path: PathBuf,
        retry_after: Duration,
    },

    /// An operation was attempted in a state that does not permit it
    InvalidState {
        path: PathBuf,
        state: FileState,
        operation: &'static str,
    },

    /// Configuration errors
    Configuration { message: String },

    /// Surface reserved but not yet implemented
    NotImplemented { operation: &'static str },
}

/// Recovery hints for error handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryHint {
    /// Retry the operation after the given backoff
    Retry { after: Duration },
    /// Verify network connectivity to the namenode
    CheckNetwork { endpoint: String },
    /// Check filesystem permissions
    CheckPermissions { path: PathBuf },
    /// Raise the configured capacity
    IncreaseCapacity { suggested_bytes: u64 },
    /// No automated recovery possible
    Manual { instructions: String },
    /// Operation can be safely ignored
    Ignore,
}

impl CacheError {
    pub(crate) fn io(
        path: impl Into<PathBuf>,
        operation: &'static str,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            path: path.into(),
            operation,
            source,
        }
    }

    pub(crate) fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn request_failed(path: impl Into<PathBuf>, status: TaskStatus) -> Self {
        Self::RequestFailed {
            path: path.into(),
            status,
        }
    }

    pub(crate) fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub(crate) fn forbidden(path: impl Into<PathBuf>, retry_after: Duration) -> Self {
        Self::Forbidden {
            path: path.into(),
            retry_after,
        }
    }

    pub(crate) fn invalid_state(path: &Path, state: FileState, operation: &'static str) -> Self {
        Self::InvalidState {
            path: path.to_path_buf(),
            state,
            operation,
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Get the recovery hint for this error
    #[must_use]
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            Self::Io { path, source, .. } => {
                if source.kind() == std::io::ErrorKind::PermissionDenied {
                    RecoveryHint::CheckPermissions { path: path.clone() }
                } else {
                    RecoveryHint::Retry {
                        after: Duration::from_millis(100),
                    }
                }
            }
            Self::InvalidPath { .. } => RecoveryHint::Manual {
                instructions: "Request paths produced by the cache path codec only".to_string(),
            },
            Self::NamenodeNotConfigured { descriptor } => RecoveryHint::Manual {
                instructions: format!("Configure an adaptor for {}", descriptor.endpoint()),
            },
            Self::NamenodeUnreachable { descriptor } => RecoveryHint::CheckNetwork {
                endpoint: descriptor.endpoint(),
            },
            Self::RequestFailed { .. } => RecoveryHint::Retry {
                after: Duration::from_secs(60),
            },
            Self::NotFound { .. } => RecoveryHint::Ignore,
            Self::Forbidden { retry_after, .. } => RecoveryHint::Retry {
                after: *retry_after,
            },
            Self::InvalidState { .. } => RecoveryHint::Retry {
                after: Duration::from_millis(10),
            },
            Self::Configuration { .. } => RecoveryHint::Manual {
                instructions: "Check the cache configuration".to_string(),
            },
            Self::NotImplemented { .. } => RecoveryHint::Ignore,
        }
    }

    /// Check if this error is transient and can be retried
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.recovery_hint(),
            RecoveryHint::Retry { .. } | RecoveryHint::CheckNetwork { .. }
        )
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io {
                path,
                operation,
                source,
            } => write!(
                f,
                "I/O error during {} on '{}': {}",
                operation,
                path.display(),
                source
            ),
            Self::InvalidPath { path, reason } => {
                write!(f, "Invalid cache path '{}': {}", path.display(), reason)
            }
            Self::NamenodeNotConfigured { descriptor } => write!(
                f,
                "No namenode adaptor configured for {}",
                descriptor.endpoint()
            ),
            Self::NamenodeUnreachable { descriptor } => {
                write!(f, "Namenode {} is not reachable", descriptor.endpoint())
            }
            Self::RequestFailed { path, status } => write!(
                f,
                "Prepare request for '{}' completed with status {}",
                path.display(),
                status
            ),
            Self::NotFound { path } => write!(
                f,
                "File '{}' is not cached and autoload is disabled",
                path.display()
            ),
            Self::Forbidden { path, retry_after } => write!(
                f,
                "File '{}' is forbidden; next resync permitted in {:?}",
                path.display(),
                retry_after
            ),
            Self::InvalidState {
                path,
                state,
                operation,
            } => write!(
                f,
                "Cannot {} '{}' while it is {}",
                operation,
                path.display(),
                state
            ),
            Self::Configuration { message } => {
                write!(f, "Cache configuration error: {}", message)
            }
            Self::NotImplemented { operation } => {
                write!(f, "Operation '{}' is not implemented", operation)
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
