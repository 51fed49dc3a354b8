//! Volatile cache key layout.
//!
//! `{entity}:list:{owner}:{filter digest}` for list pages and
//! `{entity}:id:{id}` for single records. Invalidating a type's lists is a
//! substring match on `{entity}:list:`.

use sha2::{Digest, Sha256};

use crate::entity::EntityType;

use super::filters::Filters;

pub fn list_key(entity_type: EntityType, owner_id: &str, filters: &Filters) -> String {
  format!(
    "{}{}:{}",
    list_prefix(entity_type),
    owner_id,
    filter_digest(filters)
  )
}

pub fn list_prefix(entity_type: EntityType) -> String {
  format!("{}:list:", entity_type.as_str())
}

pub fn record_key(entity_type: EntityType, id: &str) -> String {
  format!("{}:id:{}", entity_type.as_str(), id)
}

/// Whether a key names a cached list page of any type.
pub fn is_list_key(key: &str) -> bool {
  EntityType::ALL
    .iter()
    .any(|t| key.starts_with(&list_prefix(*t)))
}

/// SHA256 over the canonical filter text, truncated for readable keys.
fn filter_digest(filters: &Filters) -> String {
  let mut hasher = Sha256::new();
  hasher.update(filters.canonical().as_bytes());
  let digest = hex::encode(hasher.finalize());
  digest[..16].to_string()
}
