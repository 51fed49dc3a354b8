//! Local cache tiers.
//!
//! - [`VolatileCache`]: bounded in-process key/value cache with TTL and LRU eviction
//! - [`SqliteStore`]: durable per-entity tables plus the mutation queue table
//!
//! Neither tier is the source of truth; the remote is.

pub mod storage;
mod traits;
mod volatile;

pub use storage::{PersistentStore, SqliteStore, StoreResult};
pub use traits::{CacheResult, CacheSource};
pub use volatile::{VolatileCache, DEFAULT_CAPACITY, DEFAULT_TTL};
