//! In-memory identity store.
//!
//! Serializable by construction: a transaction holds the table lock for its
//! whole lifetime and works on a staged copy that replaces the live table on
//! commit. Operations outside a transaction take the lock per call.

use crate::repository::{ClientRepository, IdentityStore, StoreTransaction};
use async_trait::async_trait;
use chrono::Utc;
use clientele_core::{
    ClientFilter, ClientId, ClientInput, ClientRecord, ClienteleResult, StoreError,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

// ============================================================================
// TABLE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientTable {
    rows: BTreeMap<ClientId, ClientRecord>,
    by_key: HashMap<String, ClientId>,
    next_id: ClientId,
}

impl ClientTable {
    fn upsert(&mut self, inputs: &[ClientInput]) -> ClienteleResult<()> {
        // One statement: a bad row rejects the whole batch.
        if inputs.iter().any(|input| input.bearer_key.is_empty()) {
            return Err(StoreError::ConstraintViolation {
                constraint: "clients_bearer_key_check".to_string(),
                reason: "bearer_key must not be empty".to_string(),
            }
            .into());
        }

        let now = Utc::now();
        for input in inputs {
            let updated_at = input.updated_at.unwrap_or(now);
            match self.by_key.get(&input.bearer_key) {
                Some(id) => {
                    if let Some(row) = self.rows.get_mut(id) {
                        row.name = input.name.clone();
                        row.updated_at = updated_at;
                    }
                }
                None => {
                    self.next_id += 1;
                    let id = self.next_id;
                    self.rows.insert(
                        id,
                        ClientRecord {
                            id,
                            name: input.name.clone(),
                            bearer_key: input.bearer_key.clone(),
                            created_at: input.created_at.unwrap_or(now),
                            updated_at,
                        },
                    );
                    self.by_key.insert(input.bearer_key.clone(), id);
                }
            }
        }
        Ok(())
    }

    fn select(&self, filter: &ClientFilter) -> ClienteleResult<Vec<ClientRecord>> {
        filter.validate()?;
        Ok(self
            .rows
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect())
    }

    fn delete(&mut self, filter: &ClientFilter) -> ClienteleResult<u64> {
        filter.validate()?;
        let doomed: Vec<ClientRecord> = self
            .rows
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        for row in &doomed {
            self.rows.remove(&row.id);
            self.by_key.remove(&row.bearer_key);
        }
        Ok(doomed.len() as u64)
    }

    fn contains_key(&self, bearer_key: &str) -> bool {
        self.by_key.contains_key(bearer_key)
    }
}

// ============================================================================
// STORE
// ============================================================================

/// In-memory [`IdentityStore`]. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdentityStore {
    table: Arc<Mutex<ClientTable>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub async fn len(&self) -> usize {
        self.table.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every stored row, ordered by id.
    pub async fn snapshot(&self) -> Vec<ClientRecord> {
        self.table.lock().await.rows.values().cloned().collect()
    }
}

#[async_trait]
impl ClientRepository for InMemoryIdentityStore {
    async fn upsert(&self, inputs: &[ClientInput]) -> ClienteleResult<()> {
        self.table.lock().await.upsert(inputs)
    }

    async fn find_by_filter(
        &self,
        filter: &ClientFilter,
        _lock: bool,
    ) -> ClienteleResult<Vec<ClientRecord>> {
        self.table.lock().await.select(filter)
    }

    async fn delete_by_filter(&self, filter: &ClientFilter) -> ClienteleResult<u64> {
        self.table.lock().await.delete(filter)
    }

    async fn is_exists(&self, bearer_key: &str) -> ClienteleResult<bool> {
        Ok(self.table.lock().await.contains_key(bearer_key))
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn begin(&self) -> ClienteleResult<Box<dyn StoreTransaction>> {
        let live = Arc::clone(&self.table).lock_owned().await;
        let staged = live.clone();
        Ok(Box::new(InMemoryTransaction {
            state: Mutex::new(TxState { live, staged }),
        }))
    }

    async fn health_check(&self) -> ClienteleResult<()> {
        Ok(())
    }
}

// ============================================================================
// TRANSACTION
// ============================================================================

struct TxState {
    live: OwnedMutexGuard<ClientTable>,
    staged: ClientTable,
}

/// Open transaction on an [`InMemoryIdentityStore`].
pub struct InMemoryTransaction {
    state: Mutex<TxState>,
}

#[async_trait]
impl ClientRepository for InMemoryTransaction {
    async fn upsert(&self, inputs: &[ClientInput]) -> ClienteleResult<()> {
        self.state.lock().await.staged.upsert(inputs)
    }

    async fn find_by_filter(
        &self,
        filter: &ClientFilter,
        _lock: bool,
    ) -> ClienteleResult<Vec<ClientRecord>> {
        self.state.lock().await.staged.select(filter)
    }

    async fn delete_by_filter(&self, filter: &ClientFilter) -> ClienteleResult<u64> {
        self.state.lock().await.staged.delete(filter)
    }

    async fn is_exists(&self, bearer_key: &str) -> ClienteleResult<bool> {
        Ok(self.state.lock().await.staged.contains_key(bearer_key))
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    fn repository(&self) -> &dyn ClientRepository {
        self
    }

    async fn commit(self: Box<Self>) -> ClienteleResult<()> {
        let TxState { mut live, staged } = self.state.into_inner();
        *live = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> ClienteleResult<()> {
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
