//! Types describing where a read was answered from.

use chrono::{DateTime, Utc};

/// Result from a read, including data and metadata about the tier that served it.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Which tier answered
  pub source: CacheSource,
  /// When the data was cached (if it came from the persistent store)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Data served from the volatile cache.
  pub fn from_memory(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Memory,
      cached_at: None,
    }
  }

  /// Data served from the persistent store.
  pub fn from_store(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Store,
      cached_at,
    }
  }

  /// Fresh data from the remote.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Remote unavailable, serving whatever the persistent store still has.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }
}

/// Indicates which tier produced a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Volatile in-process cache
  Memory,
  /// Persistent local store
  Store,
  /// Fresh data from the remote
  Network,
  /// Offline mode - remote failed, serving persisted data
  Offline,
}
