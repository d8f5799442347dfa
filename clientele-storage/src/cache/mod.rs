//! Bearer-key lookup cache.
//!
//! Maps a bearer key to the client record it authenticates. Entries are
//! written lazily by the existence resolver and expire after a fixed TTL;
//! nothing invalidates them on delete.
//!
//! # Components
//!
//! - [`LookupCache`]: backend trait
//! - [`InMemoryLookupCache`]: process-local backend with expiry
//! - [`RedisLookupCache`]: Redis backend storing JSON with `SET EX`

mod memory;
mod redis_backend;
mod traits;

pub use memory::InMemoryLookupCache;
pub use redis_backend::RedisLookupCache;
pub use traits::{CacheStats, LookupCache};
