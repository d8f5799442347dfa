//! Process-local lookup cache with per-entry expiry.

use super::traits::{CacheStats, LookupCache, StatsCounters};
use async_trait::async_trait;
use clientele_core::{CacheError, ClientRecord, ClienteleResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Minimum spacing between expiry sweeps triggered by writes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CacheEntry {
    record: ClientRecord,
    expires_at: Instant,
}

#[derive(Debug)]
struct Entries {
    map: HashMap<String, CacheEntry>,
    next_sweep: Instant,
}

impl Entries {
    fn purge(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| entry.expires_at > now);
        self.next_sweep = now + SWEEP_INTERVAL;
        before - self.map.len()
    }
}

/// In-memory [`LookupCache`]. Expired entries are dropped when read, and
/// writes sweep the whole map at most once per [`SWEEP_INTERVAL`].
#[derive(Debug, Clone)]
pub struct InMemoryLookupCache {
    entries: Arc<RwLock<Entries>>,
    stats: Arc<StatsCounters>,
}

impl Default for InMemoryLookupCache {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Entries {
                map: HashMap::new(),
                next_sweep: Instant::now() + SWEEP_INTERVAL,
            })),
            stats: Arc::new(StatsCounters::default()),
        }
    }
}

impl InMemoryLookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .map(|entries| entries.map.values().filter(|e| e.expires_at > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored entries, expired ones included.
    pub fn stored(&self) -> usize {
        self.entries.read().map(|entries| entries.map.len()).unwrap_or(0)
    }

    /// Drop every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> ClienteleResult<usize> {
        let mut entries = self.entries.write().map_err(|_| CacheError::LockPoisoned)?;
        Ok(entries.purge(Instant::now()))
    }
}

#[async_trait]
impl LookupCache for InMemoryLookupCache {
    async fn get(&self, bearer_key: &str) -> ClienteleResult<Option<ClientRecord>> {
        let now = Instant::now();
        let found = {
            let entries = self.entries.read().map_err(|_| CacheError::LockPoisoned)?;
            entries.map.get(bearer_key).cloned()
        };

        match found {
            Some(entry) if entry.expires_at > now => {
                self.stats.hit();
                Ok(Some(entry.record))
            }
            Some(_) => {
                let mut entries = self.entries.write().map_err(|_| CacheError::LockPoisoned)?;
                if entries
                    .map
                    .get(bearer_key)
                    .is_some_and(|entry| entry.expires_at <= now)
                {
                    entries.map.remove(bearer_key);
                }
                self.stats.miss();
                Ok(None)
            }
            None => {
                self.stats.miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, record: &ClientRecord, ttl: Duration) -> ClienteleResult<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| CacheError::LockPoisoned)?;
        if now >= entries.next_sweep {
            let purged = entries.purge(now);
            if purged > 0 {
                tracing::debug!(purged, "Swept expired cache entries");
            }
        }
        entries.map.insert(
            record.bearer_key.clone(),
            CacheEntry {
                record: record.clone(),
                expires_at: now + ttl,
            },
        );
        self.stats.write();
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }
}
