//! Identity store capability traits.
//!
//! [`ClientRepository`] is the set of operations on the `clients` table.
//! [`IdentityStore`] is a repository that can also open transactions; a
//! [`StoreTransaction`] is a repository scoped to one open transaction.

use async_trait::async_trait;
use clientele_core::{ClientFilter, ClientInput, ClientRecord, ClienteleResult};

/// Operations on the durable client table.
#[async_trait]
pub trait ClientRepository: Send + Sync {
    /// Insert every input in one statement. On a `bearer_key` conflict the
    /// existing row keeps its id and `created_at`; `name` and `updated_at`
    /// are overwritten.
    async fn upsert(&self, inputs: &[ClientInput]) -> ClienteleResult<()>;

    /// Rows matching `filter`, ordered by id. With `lock` set the rows are
    /// held for update until the surrounding transaction ends.
    ///
    /// Fails with `InvalidFilter` when the filter is empty.
    async fn find_by_filter(
        &self,
        filter: &ClientFilter,
        lock: bool,
    ) -> ClienteleResult<Vec<ClientRecord>>;

    /// Remove matching rows and return how many were removed.
    ///
    /// Fails with `InvalidFilter` when the filter is empty.
    async fn delete_by_filter(&self, filter: &ClientFilter) -> ClienteleResult<u64>;

    /// Whether a row with this bearer key exists.
    async fn is_exists(&self, bearer_key: &str) -> ClienteleResult<bool>;
}

/// A repository scoped to one open transaction.
///
/// Dropping a transaction without calling [`commit`](Self::commit) or
/// [`rollback`](Self::rollback) discards its changes. This also covers a
/// panic while the transaction is open.
#[async_trait]
pub trait StoreTransaction: ClientRepository {
    /// The transaction viewed as a plain repository.
    fn repository(&self) -> &dyn ClientRepository;

    async fn commit(self: Box<Self>) -> ClienteleResult<()>;

    async fn rollback(self: Box<Self>) -> ClienteleResult<()>;
}

/// The durable client table.
#[async_trait]
pub trait IdentityStore: ClientRepository {
    /// Open a transaction.
    async fn begin(&self) -> ClienteleResult<Box<dyn StoreTransaction>>;

    /// Round-trip to the backend.
    async fn health_check(&self) -> ClienteleResult<()>;
}
