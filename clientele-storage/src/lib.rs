//! Clientele Storage - Identity Store and Lookup Cache
//!
//! Capability traits for the durable client table and the bearer-key cache,
//! plus the in-memory implementations used in development and tests.
//! The Postgres store lives in clientele-api next to its pool configuration.

pub mod cache;
pub mod memory;
pub mod repository;
pub mod transaction;

pub use cache::{CacheStats, InMemoryLookupCache, LookupCache, RedisLookupCache};
pub use memory::{InMemoryIdentityStore, InMemoryTransaction};
pub use repository::{ClientRepository, IdentityStore, StoreTransaction};
pub use transaction::do_in_transaction;
