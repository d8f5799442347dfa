//! Redis-backed lookup cache.
//!
//! Each record is stored as JSON under `<prefix><bearer_key>` with `SET EX`,
//! so expiry is enforced by Redis itself. A nil reply is a miss; every other
//! failure surfaces as [`CacheError::Backend`].

use super::traits::{CacheStats, LookupCache, StatsCounters};
use async_trait::async_trait;
use clientele_core::{CacheError, ClientRecord, ClienteleResult};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

/// Redis [`LookupCache`] over a reconnecting [`ConnectionManager`].
#[derive(Clone)]
pub struct RedisLookupCache {
    manager: ConnectionManager,
    key_prefix: String,
    stats: Arc<StatsCounters>,
}

impl RedisLookupCache {
    /// Connect to `url` (`redis://[:password@]host:port`) and check the
    /// server answers before handing the cache out.
    pub async fn connect(url: &str) -> ClienteleResult<Self> {
        let client = redis::Client::open(url).map_err(backend_error)?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(backend_error)?;
        let cache = Self::new(manager);
        cache.ping().await?;
        Ok(cache)
    }

    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            key_prefix: String::new(),
            stats: Arc::new(StatsCounters::default()),
        }
    }

    /// Namespace every key, e.g. `"clientele:"`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, bearer_key: &str) -> String {
        format!("{}{}", self.key_prefix, bearer_key)
    }

    /// `PING` round-trip.
    pub async fn ping(&self) -> ClienteleResult<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(())
    }
}

fn backend_error(e: redis::RedisError) -> CacheError {
    CacheError::Backend {
        reason: e.to_string(),
    }
}

/// Redis rejects `EX 0`; round sub-second TTLs up to one second.
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl LookupCache for RedisLookupCache {
    async fn get(&self, bearer_key: &str) -> ClienteleResult<Option<ClientRecord>> {
        let key = self.key(bearer_key);
        let mut conn = self.manager.clone();

        let raw: Option<String> = match conn.get(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                self.stats.error();
                return Err(backend_error(e).into());
            }
        };

        match raw {
            Some(json) => {
                let record = serde_json::from_str(&json).map_err(|e| {
                    self.stats.error();
                    CacheError::Corrupt {
                        key: key.clone(),
                        reason: e.to_string(),
                    }
                })?;
                self.stats.hit();
                Ok(Some(record))
            }
            None => {
                self.stats.miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, record: &ClientRecord, ttl: Duration) -> ClienteleResult<()> {
        let key = self.key(&record.bearer_key);
        let json = serde_json::to_string(record).map_err(|e| CacheError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        let mut conn = self.manager.clone();
        let result: redis::RedisResult<()> = conn.set_ex(&key, json, ttl_seconds(ttl)).await;
        if let Err(e) = result {
            self.stats.error();
            return Err(backend_error(e).into());
        }

        self.stats.write();
        tracing::debug!(key = %key, ttl_secs = ttl_seconds(ttl), "Cached client record");
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_seconds_rounds_up_to_one() {
        assert_eq!(ttl_seconds(Duration::from_millis(10)), 1);
        assert_eq!(ttl_seconds(Duration::from_secs(86_400)), 86_400);
    }

    #[test]
    fn test_backend_error_carries_reason() {
        let err = backend_error(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        )));
        assert!(err.to_string().contains("connection refused"));
    }
}
