//! Entity types and the records the local tiers hold for them.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Prefix of ids minted locally for records the server has not seen yet.
pub const TEMP_ID_PREFIX: &str = "tmp-";

static TEMP_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Mint a temporary id for an optimistic create.
pub fn new_temp_id() -> String {
  let seq = TEMP_ID_SEQ.fetch_add(1, Ordering::Relaxed);
  format!(
    "{}{}-{}",
    TEMP_ID_PREFIX,
    Utc::now().timestamp_millis(),
    seq
  )
}

pub fn is_temp_id(id: &str) -> bool {
  id.starts_with(TEMP_ID_PREFIX)
}

/// Kinds of entity the engine syncs. Each one gets its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
  Invoice,
  Bill,
  Transaction,
  JournalEntry,
  Payment,
  Customer,
  Vendor,
}

impl EntityType {
  pub const ALL: [EntityType; 7] = [
    EntityType::Invoice,
    EntityType::Bill,
    EntityType::Transaction,
    EntityType::JournalEntry,
    EntityType::Payment,
    EntityType::Customer,
    EntityType::Vendor,
  ];

  /// Name used in cache keys and queue rows.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Invoice => "invoice",
      Self::Bill => "bill",
      Self::Transaction => "transaction",
      Self::JournalEntry => "journal_entry",
      Self::Payment => "payment",
      Self::Customer => "customer",
      Self::Vendor => "vendor",
    }
  }

  /// Table name in the persistent store and path segment on the remote.
  pub fn table(&self) -> &'static str {
    match self {
      Self::Invoice => "invoices",
      Self::Bill => "bills",
      Self::Transaction => "transactions",
      Self::JournalEntry => "journal_entries",
      Self::Payment => "payments",
      Self::Customer => "customers",
      Self::Vendor => "vendors",
    }
  }

  /// Field values an optimistic record starts from before the caller's data
  /// is laid over it.
  pub fn defaults(&self) -> Map<String, Value> {
    let value = match self {
      Self::Invoice | Self::Bill => json!({
        "status": "draft",
        "total": 0,
        "line_items": [],
      }),
      Self::Transaction => json!({
        "amount": 0,
        "description": "",
      }),
      Self::JournalEntry => json!({
        "memo": "",
        "lines": [],
      }),
      Self::Payment => json!({
        "amount": 0,
        "status": "pending",
      }),
      Self::Customer | Self::Vendor => json!({
        "name": "",
      }),
    };
    match value {
      Value::Object(map) => map,
      _ => Map::new(),
    }
  }
}

impl fmt::Display for EntityType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim().to_lowercase();
    EntityType::ALL
      .into_iter()
      .find(|t| t.as_str() == s || t.table() == s)
      .ok_or_else(|| format!("unknown entity type '{}'", s))
  }
}

/// Entity payload as exchanged with the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
  pub id: String,
  pub owner_id: String,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl Entity {
  /// Look up a field, including `id` and `owner_id`.
  pub fn field(&self, name: &str) -> Option<Value> {
    match name {
      "id" => Some(Value::String(self.id.clone())),
      "owner_id" => Some(Value::String(self.owner_id.clone())),
      _ => self.fields.get(name).cloned(),
    }
  }

  /// Lay `patch` over the current fields. `id` and `owner_id` keys in the
  /// patch are ignored.
  pub fn merge(&mut self, patch: &Map<String, Value>) {
    for (k, v) in patch {
      if k == "id" || k == "owner_id" {
        continue;
      }
      self.fields.insert(k.clone(), v.clone());
    }
  }
}

/// Whether the local copy of a record matches the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
  Synced,
  PendingSync,
  Failed,
}

impl SyncState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Synced => "synced",
      Self::PendingSync => "pending_sync",
      Self::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "synced" => Some(Self::Synced),
      "pending_sync" => Some(Self::PendingSync),
      "failed" => Some(Self::Failed),
      _ => None,
    }
  }
}

/// A record as held in the local tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
  pub entity: Entity,
  pub sync_state: SyncState,
  pub cached_at: DateTime<Utc>,
}

impl PersistedRecord {
  pub fn new(entity: Entity, sync_state: SyncState) -> Self {
    Self {
      entity,
      sync_state,
      cached_at: Utc::now(),
    }
  }

  pub fn synced(entity: Entity) -> Self {
    Self::new(entity, SyncState::Synced)
  }

  pub fn id(&self) -> &str {
    &self.entity.id
  }

  pub fn owner_id(&self) -> &str {
    &self.entity.owner_id
  }

  /// True while a local change has not been confirmed.
  pub fn is_local_only(&self) -> bool {
    self.sync_state != SyncState::Synced
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_temp_ids_are_unique_and_prefixed() {
    let a = new_temp_id();
    let b = new_temp_id();
    assert_ne!(a, b);
    assert!(is_temp_id(&a));
    assert!(!is_temp_id("inv_123"));
  }

  #[test]
  fn test_entity_type_from_str() {
    assert_eq!("invoice".parse::<EntityType>(), Ok(EntityType::Invoice));
    assert_eq!("journal_entries".parse::<EntityType>(), Ok(EntityType::JournalEntry));
    assert!("widget".parse::<EntityType>().is_err());
  }

  #[test]
  fn test_merge_keeps_identity() {
    let mut entity = Entity {
      id: "inv_1".to_string(),
      owner_id: "A".to_string(),
      fields: Map::new(),
    };
    let patch = json!({"id": "other", "owner_id": "B", "total": 10});
    entity.merge(patch.as_object().unwrap());

    assert_eq!(entity.id, "inv_1");
    assert_eq!(entity.owner_id, "A");
    assert_eq!(entity.field("total"), Some(json!(10)));
  }

  #[test]
  fn test_entity_serializes_flat() {
    let mut fields = Map::new();
    fields.insert("total".to_string(), json!(5));
    let entity = Entity {
      id: "inv_1".to_string(),
      owner_id: "A".to_string(),
      fields,
    };
    let value = serde_json::to_value(&entity).unwrap();
    assert_eq!(value, json!({"id": "inv_1", "owner_id": "A", "total": 5}));
  }
}
