//! Boundary to the authoritative backend.

mod http;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::entity::{Entity, EntityType};
use crate::error::RemoteError;
use crate::sync::Filters;

pub use http::HttpRemote;

/// The only component that talks to the backend.
///
/// Implementations report failures as [`RemoteError`] so the queue worker can
/// tell retryable failures from terminal ones.
#[async_trait]
pub trait RemoteClient: Send + Sync + 'static {
  async fn list(
    &self,
    entity_type: EntityType,
    owner_id: &str,
    filters: &Filters,
  ) -> Result<Vec<Entity>, RemoteError>;

  async fn get_by_id(&self, entity_type: EntityType, id: &str)
    -> Result<Option<Entity>, RemoteError>;

  /// Create an entity. `idempotency_key` is stable across retries of the same
  /// queued mutation so a retried create is not applied twice.
  async fn create(
    &self,
    entity_type: EntityType,
    data: &Map<String, Value>,
    idempotency_key: &str,
  ) -> Result<Entity, RemoteError>;

  async fn update(
    &self,
    entity_type: EntityType,
    id: &str,
    data: &Map<String, Value>,
  ) -> Result<Entity, RemoteError>;

  async fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), RemoteError>;
}
