//! Cache configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the file system cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory holding the cached files
    pub root: PathBuf,
    /// Hard target for the summed weight of cache-resident files
    pub capacity_bytes: u64,
    /// Whether a lookup miss schedules a fetch; when false, misses report not-found
    #[serde(default = "default_autoload")]
    pub autoload: bool,
    /// Minimum interval between resync attempts on a file whose fetch failed
    #[serde(default = "default_retry_interval")]
    pub retry_interval: Duration,
}

fn default_autoload() -> bool {
    true
}

fn default_retry_interval() -> Duration {
    // One failed file gets another chance at the remote side once per slice.
    Duration::from_secs(6 * 60)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/cache/dfs"),
            capacity_bytes: 10 * 1024 * 1024 * 1024, // 10GB
            autoload: default_autoload(),
            retry_interval: default_retry_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.capacity_bytes, 10 * 1024 * 1024 * 1024);
        assert!(config.autoload);
        assert_eq!(config.retry_interval, Duration::from_secs(360));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"root": "/data/cache", "capacity_bytes": 1024}"#).unwrap();
        assert_eq!(config.root, PathBuf::from("/data/cache"));
        assert_eq!(config.capacity_bytes, 1024);
        assert!(config.autoload);
        assert_eq!(config.retry_interval, Duration::from_secs(360));
    }
}
