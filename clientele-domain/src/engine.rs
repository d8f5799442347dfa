//! Upsert engine.
//!
//! Validates a batch, fills in generated keys and timestamps, writes the
//! batch in one store call, then reads the rows back by name with a lock.
//! The write and the read-back are separate store calls: when the read
//! fails the write may already be committed, and the error is returned
//! as is. Callers retrying on failure get at-least-once semantics, which
//! the conflict-on-key upsert keeps idempotent for keyed inputs.

use chrono::Utc;
use clientele_core::{
    ClientFilter, ClientInput, ClientRecord, ClienteleResult, ValidationError,
};
use clientele_storage::IdentityStore;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Idempotent create-or-update of client records.
#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn IdentityStore>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    /// Upsert `inputs` and return the committed rows carrying their names.
    ///
    /// Rows that already had one of those names are returned too: names are
    /// not unique and the read-back selects by name.
    pub async fn upsert(&self, inputs: Vec<ClientInput>) -> ClienteleResult<Vec<ClientRecord>> {
        if inputs.is_empty() {
            return Err(ValidationError::EmptyInput.into());
        }

        let now = Utc::now();
        let mut prepared = inputs;
        for input in prepared.iter_mut() {
            input.validate()?;
            input.prepare(now);
        }

        self.store.upsert(&prepared).await?;

        let names: BTreeSet<&str> = prepared.iter().map(|i| i.name.as_str()).collect();
        let filter = ClientFilter::by_names(names);
        let records = self.store.find_by_filter(&filter, true).await?;

        tracing::debug!(
            inputs = prepared.len(),
            records = records.len(),
            "Upserted clients"
        );
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clientele_storage::ClientRepository;
    use clientele_test_utils::{assertions, fixtures, FlakyStore};

    fn engine(store: &FlakyStore) -> UpsertEngine {
        UpsertEngine::new(Arc::new(store.clone()))
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected_without_io() {
        let store = FlakyStore::new();
        let result = engine(&store).upsert(vec![]).await;
        assertions::assert_empty_input(&result);
        assert_eq!(store.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_generates_key_and_returns_record() {
        let store = FlakyStore::new();
        let records = engine(&store).upsert(vec![fixtures::acme()]).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Acme");
        assertions::assert_generated_key(&records[0].bearer_key);
        assert_eq!(store.calls().upserts(), 1);
        assert_eq!(store.calls().finds(), 1);
    }

    #[tokio::test]
    async fn test_two_keyless_inputs_create_two_records() {
        let store = FlakyStore::new();
        let engine = engine(&store);
        let first = engine.upsert(vec![fixtures::acme()]).await.unwrap();
        let second = engine.upsert(vec![fixtures::acme()]).await.unwrap();

        assert_eq!(second.len(), 2);
        assert_ne!(second[0].bearer_key, second[1].bearer_key);
        assert!(second.iter().any(|r| r.id == first[0].id));
        assert_eq!(store.inner().len().await, 2);
    }

    #[tokio::test]
    async fn test_same_key_updates_name() {
        let store = FlakyStore::new();
        let engine = engine(&store);
        let created = engine
            .upsert(vec![fixtures::keyed("Old", "k1")])
            .await
            .unwrap();
        let updated = engine
            .upsert(vec![fixtures::keyed("New", "k1")])
            .await
            .unwrap();

        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].id, created[0].id);
        assert_eq!(updated[0].name, "New");
        assert_eq!(store.inner().len().await, 1);
    }

    #[tokio::test]
    async fn test_store_failure_aborts_before_read_back() {
        let store = FlakyStore::new();
        store.fail_next_upserts(1);
        let result = engine(&store).upsert(vec![fixtures::acme()]).await;

        assertions::assert_store_error(&result);
        assert_eq!(store.calls().finds(), 0);
    }

    #[tokio::test]
    async fn test_read_back_failure_leaves_write_committed() {
        let store = FlakyStore::new();
        store.fail_next_finds(1);
        let result = engine(&store)
            .upsert(vec![fixtures::keyed("Acme", "k1")])
            .await;

        assertions::assert_store_error(&result);
        assert!(store.inner().is_exists("k1").await.unwrap());
    }

    #[tokio::test]
    async fn test_overlong_name_is_rejected_before_write() {
        let store = FlakyStore::new();
        let result = engine(&store)
            .upsert(vec![ClientInput::named("x".repeat(101))])
            .await;
        assert!(result.unwrap_err().is_invalid_input());
        assert_eq!(store.calls().upserts(), 0);
    }
}
