//! Error taxonomy for the sync engine.
//!
//! A cache miss is not an error: lookups return `Option`. Persistent-store
//! failures are `StoreError` and are degraded to misses by the orchestrator.
//! Only remote failures (and a handful of API misuse cases) reach callers.

use thiserror::Error;

use crate::entity::EntityType;

/// Failure reported by a [`RemoteClient`](crate::remote::RemoteClient).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
  /// The backend has no such entity.
  #[error("not found")]
  NotFound,
  /// Network failure, timeout or server error. Safe to retry.
  #[error("transient failure: {0}")]
  Transient(String),
  /// Validation or conflict rejection. Retrying will not help.
  #[error("rejected: {0}")]
  Rejected(String),
}

impl RemoteError {
  /// Only transient failures are worth another attempt.
  pub fn is_retryable(&self) -> bool {
    matches!(self, RemoteError::Transient(_))
  }
}

/// Failure of the persistent tier.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("store unavailable: {0}")]
  Unavailable(String),
  #[error("store data corrupt: {0}")]
  Corrupt(String),
  #[error("store lock poisoned")]
  Poisoned,
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    StoreError::Unavailable(e.to_string())
  }
}

impl From<serde_json::Error> for StoreError {
  fn from(e: serde_json::Error) -> Self {
    StoreError::Corrupt(e.to_string())
  }
}

/// Error returned by the orchestrator's public operations.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error("invalid filter: {0}")]
  InvalidFilter(String),

  #[error("{entity_type} {id} not found")]
  NotFound { entity_type: EntityType, id: String },

  #[error("remote request failed: {0}")]
  Remote(#[from] RemoteError),

  /// The durable record of intent could not be written, so the mutation was
  /// not accepted.
  #[error("mutation queue unavailable: {0}")]
  QueueUnavailable(StoreError),

  #[error("{0} is already being sent to the server")]
  RollbackInFlight(String),

  #[error("nothing to roll back for {0}")]
  NothingToRollback(String),

  #[error("queue item {0} does not exist or is not failed")]
  UnknownQueueItem(i64),
}
