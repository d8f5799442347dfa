//! Cache-aside existence resolver.
//!
//! Answers "does a client with this bearer key exist" for authentication.
//! Reads go to the lookup cache first; on a miss the store is checked and,
//! when the key exists, the record is loaded and written back to the cache.
//! A cache backend failure is an error, never a miss.

use clientele_core::{
    ClientFilter, ClientRecord, ClienteleResult, ValidationError, LOOKUP_CACHE_TTL,
};
use clientele_storage::{IdentityStore, LookupCache};
use std::sync::Arc;
use std::time::Duration;

/// How a lookup was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Served from the cache; the store was not touched.
    CacheHit(ClientRecord),
    /// The store holds the key. The record is `None` when it was deleted
    /// between the existence check and the load, in which case nothing was
    /// cached.
    StoreHit(Option<ClientRecord>),
    /// Neither cache nor store knows the key.
    Absent,
}

impl Resolution {
    pub fn exists(&self) -> bool {
        !matches!(self, Self::Absent)
    }

    pub fn record(&self) -> Option<&ClientRecord> {
        match self {
            Self::CacheHit(record) => Some(record),
            Self::StoreHit(record) => record.as_ref(),
            Self::Absent => None,
        }
    }
}

/// Cache-aside reader over an identity store and a lookup cache.
#[derive(Clone)]
pub struct ExistenceResolver {
    store: Arc<dyn IdentityStore>,
    cache: Arc<dyn LookupCache>,
    ttl: Duration,
}

impl ExistenceResolver {
    pub fn new(store: Arc<dyn IdentityStore>, cache: Arc<dyn LookupCache>) -> Self {
        Self {
            store,
            cache,
            ttl: LOOKUP_CACHE_TTL,
        }
    }

    /// Override the entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Resolve `bearer_key`, reporting where the answer came from.
    pub async fn resolve(&self, bearer_key: &str) -> ClienteleResult<Resolution> {
        if bearer_key.is_empty() {
            return Err(ValidationError::EmptyKey.into());
        }

        if let Some(record) = self.cache.get(bearer_key).await? {
            return Ok(Resolution::CacheHit(record));
        }

        if !self.store.is_exists(bearer_key).await? {
            return Ok(Resolution::Absent);
        }

        let filter = ClientFilter::by_bearer_key(bearer_key);
        let record = self
            .store
            .find_by_filter(&filter, false)
            .await?
            .into_iter()
            .next();

        match &record {
            Some(record) => {
                self.cache.set(record, self.ttl).await?;
                tracing::debug!(client_id = record.id, "Lookup cache repopulated");
            }
            None => tracing::debug!("Client vanished between existence check and load"),
        }
        Ok(Resolution::StoreHit(record))
    }

    /// Whether `bearer_key` belongs to a client.
    pub async fn is_exists(&self, bearer_key: &str) -> ClienteleResult<bool> {
        Ok(self.resolve(bearer_key).await?.exists())
    }
}
