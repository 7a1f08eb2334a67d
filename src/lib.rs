//! Local-disk cache of files fetched from remote distributed file systems
//!
//! Sits between query-engine workers and one or more remote DFS
//! namenodes, materializing remote files into a bounded local directory
//! so subsequent reads hit local disk. Disk usage stays bounded through
//! least-recently-used eviction, concurrent misses for one path coalesce
//! into a single download, and a restart rebuilds the registry from the
//! cache root alone.
//!
//! The crate is embedded by a hosting subsystem that supplies the actual
//! download machinery behind [`sync::PrepareService`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use dfs_cache::{CacheConfig, FileSystemCache};
//! use dfs_cache::paths::{DfsScheme, RemoteIdentity};
//! # fn dfs_subsystem() -> Arc<dyn dfs_cache::sync::PrepareService> { unimplemented!() }
//!
//! # fn main() -> dfs_cache::errors::Result<()> {
//! let cache = FileSystemCache::new(
//!     CacheConfig {
//!         root: "/var/cache/dfs".into(),
//!         capacity_bytes: 64 * 1024 * 1024 * 1024,
//!         ..Default::default()
//!     },
//!     dfs_subsystem(),
//! )?;
//!
//! let namenode = RemoteIdentity::new(DfsScheme::Hdfs, "nn1.example.com", 8020);
//! let local = cache.codec().to_local(&namenode, "/warehouse/t1/part-00000");
//! let file = cache.get_or_construct(&local)?;
//! file.open()?;
//! // ... read the local file ...
//! file.close();
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod errors;
pub mod lru;
pub mod managed_file;
pub mod paths;
mod reload;
pub mod stats;
pub mod store;
pub mod sync;

pub use cache::FileSystemCache;
pub use config::CacheConfig;
pub use errors::{CacheError, RecoveryHint, Result};
pub use managed_file::{FileState, ManagedFile, Subscription};
pub use stats::CacheStatsSnapshot;
