//! Offline-first sync engine for slow accounting APIs.
//!
//! Reads are served from an in-memory cache, then a SQLite store, then the
//! remote. Writes are applied locally at once and recorded in a durable queue
//! that a background worker drains to the remote.

pub mod cache;
pub mod config;
pub mod entity;
pub mod error;
pub mod logging;
pub mod queue;
pub mod remote;
pub mod sync;

pub use cache::{CacheResult, CacheSource, PersistentStore, SqliteStore, VolatileCache};
pub use entity::{Entity, EntityType, PersistedRecord, SyncState};
pub use error::{RemoteError, StoreError, SyncError};
pub use remote::{HttpRemote, RemoteClient};
pub use sync::{Filters, SyncOptions, SyncOrchestrator, SyncStatus};
