//! Clientele Test Utilities
//!
//! Shared test infrastructure for the workspace:
//! - Fault-injecting store and cache doubles
//! - Proptest generators for inputs and filters
//! - Fixtures for common scenarios
//! - Assertions on the error taxonomy

pub use clientele_storage::{InMemoryIdentityStore, InMemoryLookupCache};

pub use clientele_core::{
    CacheError, ClientFilter, ClientInput, ClientRecord, ClienteleError, ClienteleResult,
    StoreError, Timestamp, ValidationError,
};

use async_trait::async_trait;
use clientele_storage::{
    CacheStats, ClientRepository, IdentityStore, LookupCache, StoreTransaction,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// STORE DOUBLE
// ============================================================================

/// Per-operation call counters.
#[derive(Debug, Default)]
pub struct StoreCalls {
    pub upsert: AtomicU64,
    pub find: AtomicU64,
    pub delete: AtomicU64,
    pub is_exists: AtomicU64,
}

impl StoreCalls {
    pub fn upserts(&self) -> u64 {
        self.upsert.load(Ordering::SeqCst)
    }

    pub fn finds(&self) -> u64 {
        self.find.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> u64 {
        self.delete.load(Ordering::SeqCst)
    }

    pub fn exists_checks(&self) -> u64 {
        self.is_exists.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.upserts() + self.finds() + self.deletes() + self.exists_checks()
    }
}

/// [`InMemoryIdentityStore`] wrapper that counts calls and fails on demand.
///
/// Clones share counters, knobs and the underlying table.
#[derive(Debug, Clone, Default)]
pub struct FlakyStore {
    inner: InMemoryIdentityStore,
    calls: Arc<StoreCalls>,
    failing_upserts: Arc<AtomicU32>,
    failing_finds: Arc<AtomicU32>,
    reads_down: Arc<AtomicBool>,
    upsert_delay: Arc<Mutex<Option<Duration>>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` upserts fail with a connection error.
    pub fn fail_next_upserts(&self, n: u32) {
        self.failing_upserts.store(n, Ordering::SeqCst);
    }

    /// The next `n` finds fail with a connection error.
    pub fn fail_next_finds(&self, n: u32) {
        self.failing_finds.store(n, Ordering::SeqCst);
    }

    /// While set, `is_exists` and `find_by_filter` fail.
    pub fn set_reads_down(&self, down: bool) {
        self.reads_down.store(down, Ordering::SeqCst);
    }

    /// Sleep this long inside every upsert.
    pub fn set_upsert_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.upsert_delay.lock() {
            *slot = delay;
        }
    }

    pub fn calls(&self) -> &StoreCalls {
        &self.calls
    }

    pub fn inner(&self) -> &InMemoryIdentityStore {
        &self.inner
    }

    fn outage() -> ClienteleError {
        StoreError::Connection {
            reason: "injected outage".to_string(),
        }
        .into()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ClientRepository for FlakyStore {
    async fn upsert(&self, inputs: &[ClientInput]) -> ClienteleResult<()> {
        self.calls.upsert.fetch_add(1, Ordering::SeqCst);
        let delay = self.upsert_delay.lock().ok().and_then(|slot| *slot);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.failing_upserts) {
            return Err(Self::outage());
        }
        self.inner.upsert(inputs).await
    }

    async fn find_by_filter(
        &self,
        filter: &ClientFilter,
        lock: bool,
    ) -> ClienteleResult<Vec<ClientRecord>> {
        self.calls.find.fetch_add(1, Ordering::SeqCst);
        if self.reads_down.load(Ordering::SeqCst) || Self::take_failure(&self.failing_finds) {
            return Err(Self::outage());
        }
        self.inner.find_by_filter(filter, lock).await
    }

    async fn delete_by_filter(&self, filter: &ClientFilter) -> ClienteleResult<u64> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_by_filter(filter).await
    }

    async fn is_exists(&self, bearer_key: &str) -> ClienteleResult<bool> {
        self.calls.is_exists.fetch_add(1, Ordering::SeqCst);
        if self.reads_down.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.inner.is_exists(bearer_key).await
    }
}

#[async_trait]
impl IdentityStore for FlakyStore {
    async fn begin(&self) -> ClienteleResult<Box<dyn StoreTransaction>> {
        self.inner.begin().await
    }

    async fn health_check(&self) -> ClienteleResult<()> {
        if self.reads_down.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        Ok(())
    }
}

// ============================================================================
// CACHE DOUBLE
// ============================================================================

/// Cache whose backend is always down.
#[derive(Debug, Clone, Default)]
pub struct FailingCache;

#[async_trait]
impl LookupCache for FailingCache {
    async fn get(&self, _bearer_key: &str) -> ClienteleResult<Option<ClientRecord>> {
        Err(CacheError::Backend {
            reason: "injected cache outage".to_string(),
        }
        .into())
    }

    async fn set(&self, _record: &ClientRecord, _ttl: Duration) -> ClienteleResult<()> {
        Err(CacheError::Backend {
            reason: "injected cache outage".to_string(),
        }
        .into())
    }

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for client inputs and filters.

    use super::*;
    use proptest::prelude::*;

    /// Display names within the column limit.
    pub fn arb_client_name() -> impl Strategy<Value = String> {
        "[A-Za-z][A-Za-z0-9 ._-]{0,40}"
    }

    /// Keys shaped like generated ones.
    pub fn arb_bearer_key() -> impl Strategy<Value = String> {
        "[a-f0-9]{50}"
    }

    /// Input with or without a caller-chosen key.
    pub fn arb_client_input() -> impl Strategy<Value = ClientInput> {
        (arb_client_name(), proptest::option::of(arb_bearer_key())).prop_map(|(name, key)| {
            let input = ClientInput::named(name);
            match key {
                Some(key) => input.with_bearer_key(key),
                None => input,
            }
        })
    }

    /// Non-empty batch of inputs.
    pub fn arb_input_batch(max: usize) -> impl Strategy<Value = Vec<ClientInput>> {
        proptest::collection::vec(arb_client_input(), 1..=max.max(1))
    }

    /// Filter with at least one field set.
    pub fn arb_client_filter() -> impl Strategy<Value = ClientFilter> {
        (
            proptest::collection::vec(1i64..1000, 0..3),
            proptest::collection::vec(arb_client_name(), 0..3),
            proptest::collection::vec(arb_bearer_key(), 0..3),
        )
            .prop_map(|(ids, names, bearer_keys)| ClientFilter {
                ids,
                names,
                bearer_keys,
            })
            .prop_filter("filter must not be empty", |f| !f.is_empty())
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common scenarios.

    use super::*;
    use chrono::Utc;

    pub fn acme() -> ClientInput {
        ClientInput::named("Acme")
    }

    pub fn keyed(name: &str, bearer_key: &str) -> ClientInput {
        ClientInput::named(name).with_bearer_key(bearer_key)
    }

    pub fn record(id: i64, name: &str, bearer_key: &str) -> ClientRecord {
        let now = Utc::now();
        ClientRecord {
            id,
            name: name.to_string(),
            bearer_key: bearer_key.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Store pre-populated with the given rows. Rows without a bearer key
    /// get a generated one.
    pub async fn seeded_store(rows: &[ClientInput]) -> ClienteleResult<InMemoryIdentityStore> {
        let store = InMemoryIdentityStore::new();
        let now = Utc::now();
        let prepared: Vec<ClientInput> = rows
            .iter()
            .cloned()
            .map(|mut row| {
                row.prepare(now);
                row
            })
            .collect();
        if !prepared.is_empty() {
            store.upsert(&prepared).await?;
        }
        Ok(store)
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on the error taxonomy.

    use super::*;

    pub fn assert_invalid_filter<T: std::fmt::Debug>(result: &ClienteleResult<T>) {
        assert!(
            matches!(
                result,
                Err(ClienteleError::Validation(ValidationError::InvalidFilter))
            ),
            "Expected InvalidFilter, got: {:?}",
            result
        );
    }

    pub fn assert_empty_input<T: std::fmt::Debug>(result: &ClienteleResult<T>) {
        assert!(
            matches!(
                result,
                Err(ClienteleError::Validation(ValidationError::EmptyInput))
            ),
            "Expected EmptyInput, got: {:?}",
            result
        );
    }

    pub fn assert_store_error<T: std::fmt::Debug>(result: &ClienteleResult<T>) {
        assert!(
            matches!(result, Err(ClienteleError::Store(_))),
            "Expected store error, got: {:?}",
            result
        );
    }

    pub fn assert_cache_error<T: std::fmt::Debug>(result: &ClienteleResult<T>) {
        assert!(
            matches!(result, Err(ClienteleError::Cache(_))),
            "Expected cache error, got: {:?}",
            result
        );
    }

    /// 50 lowercase hex characters.
    pub fn assert_generated_key(key: &str) {
        assert_eq!(key.len(), 50, "Unexpected key length: {}", key);
        assert!(
            key.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')),
            "Key is not lowercase hex: {}",
            key
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flaky_store_fails_then_recovers() {
        let store = FlakyStore::new();
        store.fail_next_upserts(1);

        let first = store.upsert(&[fixtures::keyed("a", "k1")]).await;
        assertions::assert_store_error(&first);
        store.upsert(&[fixtures::keyed("a", "k1")]).await.unwrap();

        assert_eq!(store.calls().upserts(), 2);
        assert!(store.is_exists("k1").await.unwrap());
    }

    #[tokio::test]
    async fn test_reads_down_fails_existence_checks() {
        let store = FlakyStore::new();
        store.set_reads_down(true);
        assertions::assert_store_error(&store.is_exists("k1").await);
    }
}
