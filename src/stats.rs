//! Cache operation counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Statistics for cache operations using atomic counters
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub fetches: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub evictions: AtomicU64,
    pub capacity_overflows: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capacity_overflow(&self) {
        self.capacity_overflows.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of the cache state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    pub evictions: u64,
    pub capacity_overflows: u64,
    pub entry_count: u64,
    pub current_weight_bytes: u64,
    pub capacity_bytes: u64,
    /// Timestamp of the oldest file seen at the last reload, if any
    pub start_time: Option<SystemTime>,
}

impl CacheStats {
    /// Get a snapshot of the counters; the caller fills in the gauges
    pub fn snapshot(
        &self,
        entry_count: u64,
        current_weight_bytes: u64,
        capacity_bytes: u64,
        start_time: Option<SystemTime>,
    ) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            capacity_overflows: self.capacity_overflows.load(Ordering::Relaxed),
            entry_count,
            current_weight_bytes,
            capacity_bytes,
            start_time,
        }
    }
}
