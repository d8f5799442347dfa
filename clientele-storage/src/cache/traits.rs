//! Lookup cache backend trait and usage statistics.

use async_trait::async_trait;
use clientele_core::{ClientRecord, ClienteleResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Bearer key → client record cache.
///
/// `get` returns `Ok(None)` on a miss. Backend failures are errors and must
/// never be reported as a miss.
#[async_trait]
pub trait LookupCache: Send + Sync {
    /// Cached record for `bearer_key`, if present and not expired.
    async fn get(&self, bearer_key: &str) -> ClienteleResult<Option<ClientRecord>>;

    /// Store `record` under its bearer key for `ttl`.
    async fn set(&self, record: &ClientRecord, ttl: Duration) -> ClienteleResult<()>;

    /// Usage counters for this process.
    fn stats(&self) -> CacheStats;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of successful writes.
    pub writes: u64,
    /// Number of backend errors.
    pub errors: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Lock-free counters shared by the backends.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
