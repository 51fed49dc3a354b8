//! Persistent store trait and SQLite implementation.
//!
//! The store is a second-tier cache: one table per entity type plus the
//! `sync_queue` table holding pending mutations. Every operation returns a
//! `StoreResult` so callers decide how to degrade.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::entity::{Entity, EntityType, PersistedRecord, SyncState};
use crate::error::StoreError;
use crate::queue::types::{
  NewQueueItem, Operation, QueueCounts, QueueItem, QueueItemPatch, QueueStatus, Withdrawal,
};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Trait for persistent storage backends.
pub trait PersistentStore: Send + Sync + 'static {
  /// Insert or replace a record, stamping `cached_at` with the current time.
  fn upsert(&self, entity_type: EntityType, record: &PersistedRecord) -> StoreResult<()>;

  /// Write a server copy unless a local change is waiting for the same id:
  /// the stored row is unconfirmed or a queue item targets it. Returns
  /// whether the row was written.
  fn upsert_synced(&self, entity_type: EntityType, record: &PersistedRecord) -> StoreResult<bool>;

  fn get_by_id(&self, entity_type: EntityType, id: &str) -> StoreResult<Option<PersistedRecord>>;

  fn get_by_owner(&self, entity_type: EntityType, owner_id: &str)
    -> StoreResult<Vec<PersistedRecord>>;

  fn delete_by_id(&self, entity_type: EntityType, id: &str) -> StoreResult<bool>;

  /// Delete a synced row last written before `before`. Rows written since,
  /// unconfirmed rows and rows with queued items are kept.
  fn delete_stale(&self, entity_type: EntityType, id: &str, before: DateTime<Utc>)
    -> StoreResult<bool>;

  /// Change only the sync state of a record.
  fn set_sync_state(&self, entity_type: EntityType, id: &str, state: SyncState)
    -> StoreResult<bool>;

  /// Drop every record of one entity type.
  fn clear(&self, entity_type: EntityType) -> StoreResult<()>;

  /// Remove synced records (and owner snapshots) older than `age` across all
  /// tables. Unconfirmed records are kept because the queue still needs them.
  fn evict_older_than(&self, age: Duration) -> StoreResult<usize>;

  /// Record that the full list for an owner was fetched from the remote.
  fn mark_owner_loaded(&self, entity_type: EntityType, owner_id: &str) -> StoreResult<()>;

  fn owner_loaded_at(&self, entity_type: EntityType, owner_id: &str)
    -> StoreResult<Option<DateTime<Utc>>>;

  /// Append a queue item and return its id.
  fn enqueue(&self, item: &NewQueueItem) -> StoreResult<i64>;

  /// Pending items in creation order.
  fn list_pending(&self) -> StoreResult<Vec<QueueItem>>;

  /// Every queue item in creation order.
  fn list_queue(&self) -> StoreResult<Vec<QueueItem>>;

  fn get_item(&self, id: i64) -> StoreResult<Option<QueueItem>>;

  /// Queue items targeting one entity, in creation order.
  fn items_for_entity(&self, entity_type: EntityType, entity_id: &str)
    -> StoreResult<Vec<QueueItem>>;

  fn update_item(&self, id: i64, patch: &QueueItemPatch) -> StoreResult<bool>;

  /// Atomically move an item from Pending to Processing. Returns false if
  /// the item is gone or not pending.
  fn claim_item(&self, id: i64) -> StoreResult<bool>;

  fn remove_item(&self, id: i64) -> StoreResult<bool>;

  /// In one transaction: if the entity has a queued create and none of its
  /// items is Processing, remove all of its items and its local record.
  fn withdraw_create(&self, entity_type: EntityType, entity_id: &str) -> StoreResult<Withdrawal>;

  /// Point queue items at a server-assigned id after a create confirms.
  fn remap_entity_id(&self, entity_type: EntityType, from: &str, to: &str) -> StoreResult<usize>;

  /// Revert items left in Processing by an interrupted worker.
  fn reset_processing(&self) -> StoreResult<usize>;

  fn queue_counts(&self) -> StoreResult<QueueCounts>;
}

/// Turn a store failure into a logged miss. The remote stays authoritative,
/// so a broken local tier only costs freshness.
pub fn degrade<T>(op: &'static str, result: StoreResult<T>) -> Option<T> {
  match result {
    Ok(v) => Some(v),
    Err(e) => {
      warn!(op, error = %e, "persistent store degraded");
      None
    }
  }
}

/// SQLite-based persistent store.
pub struct SqliteStore {
  conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    let store = Self::from_connection(conn)?;
    info!(path = %path.display(), "opened persistent store");
    Ok(store)
  }

  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// A private in-memory store, mostly for tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(&schema())
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(Some(conn)),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("ledger-sync").join("sync.db"))
  }

  /// Close the connection. Later operations fail with `Unavailable`.
  pub fn close(&self) -> StoreResult<()> {
    let mut guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
    if let Some(conn) = guard.take() {
      conn.close().map_err(|(_, e)| StoreError::from(e))?;
      debug!("closed persistent store");
    }
    Ok(())
  }

  fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
    let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
    let conn = guard
      .as_ref()
      .ok_or_else(|| StoreError::Unavailable("store is closed".to_string()))?;
    f(conn)
  }
}

/// Schema: one table per entity type plus owner snapshots and the queue.
fn schema() -> String {
  let mut sql = String::new();
  for entity_type in EntityType::ALL {
    let table = entity_type.table();
    sql.push_str(&format!(
      "CREATE TABLE IF NOT EXISTS {table} (
          id TEXT PRIMARY KEY,
          owner_id TEXT NOT NULL,
          sync_state TEXT NOT NULL,
          cached_at TEXT NOT NULL,
          data TEXT NOT NULL
      );
      CREATE INDEX IF NOT EXISTS idx_{table}_owner ON {table}(owner_id);
      "
    ));
  }
  sql.push_str(QUEUE_SCHEMA);
  sql
}

const QUEUE_SCHEMA: &str = r#"
-- Owners whose complete list has been fetched from the remote
CREATE TABLE IF NOT EXISTS owner_snapshots (
    entity_type TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    loaded_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, owner_id)
);

CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_attempt_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
CREATE INDEX IF NOT EXISTS idx_sync_queue_created ON sync_queue(created_at);
CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_type, entity_id);
"#;

const QUEUE_COLUMNS: &str = "id, entity_type, entity_id, operation, payload, created_at, status, \
   retry_count, last_error, next_attempt_at";

/// Format a timestamp so that string order matches time order.
fn format_ts(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}

type RecordRow = (String, String, String, String, String);

fn record_from_row(row: RecordRow) -> StoreResult<PersistedRecord> {
  let (id, owner_id, sync_state, cached_at, data) = row;
  let fields: Map<String, Value> = serde_json::from_str(&data)?;
  let sync_state = SyncState::parse(&sync_state)
    .ok_or_else(|| StoreError::Corrupt(format!("bad sync state '{}'", sync_state)))?;
  Ok(PersistedRecord {
    entity: Entity {
      id,
      owner_id,
      fields,
    },
    sync_state,
    cached_at: parse_ts(&cached_at)?,
  })
}

fn read_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

struct QueueRow {
  id: i64,
  entity_type: String,
  entity_id: String,
  operation: String,
  payload: String,
  created_at: String,
  status: String,
  retry_count: i64,
  last_error: Option<String>,
  next_attempt_at: Option<String>,
}

impl QueueRow {
  fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      entity_type: row.get(1)?,
      entity_id: row.get(2)?,
      operation: row.get(3)?,
      payload: row.get(4)?,
      created_at: row.get(5)?,
      status: row.get(6)?,
      retry_count: row.get(7)?,
      last_error: row.get(8)?,
      next_attempt_at: row.get(9)?,
    })
  }

  fn into_item(self) -> StoreResult<QueueItem> {
    let entity_type = self
      .entity_type
      .parse::<EntityType>()
      .map_err(StoreError::Corrupt)?;
    let operation = Operation::parse(&self.operation)
      .ok_or_else(|| StoreError::Corrupt(format!("bad operation '{}'", self.operation)))?;
    let status = QueueStatus::parse(&self.status)
      .ok_or_else(|| StoreError::Corrupt(format!("bad queue status '{}'", self.status)))?;
    let next_attempt_at = self.next_attempt_at.as_deref().map(parse_ts).transpose()?;

    Ok(QueueItem {
      id: self.id,
      entity_type,
      entity_id: self.entity_id,
      operation,
      payload: serde_json::from_str(&self.payload)?,
      created_at: parse_ts(&self.created_at)?,
      status,
      retry_count: u32::try_from(self.retry_count).unwrap_or(0),
      last_error: self.last_error,
      next_attempt_at,
    })
  }
}

fn query_items(
  conn: &Connection,
  where_clause: &str,
  args: impl rusqlite::Params,
) -> StoreResult<Vec<QueueItem>> {
  let sql = format!(
    "SELECT {QUEUE_COLUMNS} FROM sync_queue {where_clause} ORDER BY created_at, id"
  );
  let mut stmt = conn.prepare(&sql)?;
  let rows = stmt
    .query_map(args, QueueRow::read)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  rows.into_iter().map(QueueRow::into_item).collect()
}

impl PersistentStore for SqliteStore {
  fn upsert(&self, entity_type: EntityType, record: &PersistedRecord) -> StoreResult<()> {
    let data = serde_json::to_string(&record.entity.fields)?;
    let table = entity_type.table();
    self.with_conn(|conn| {
      conn.execute(
        &format!(
          "INSERT INTO {table} (id, owner_id, sync_state, cached_at, data)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(id) DO UPDATE SET
             owner_id = excluded.owner_id,
             sync_state = excluded.sync_state,
             cached_at = excluded.cached_at,
             data = excluded.data"
        ),
        params![
          record.entity.id,
          record.entity.owner_id,
          record.sync_state.as_str(),
          format_ts(Utc::now()),
          data
        ],
      )?;
      Ok(())
    })
  }

  fn upsert_synced(&self, entity_type: EntityType, record: &PersistedRecord) -> StoreResult<bool> {
    let data = serde_json::to_string(&record.entity.fields)?;
    let table = entity_type.table();
    self.with_conn(|conn| {
      let n = conn.execute(
        &format!(
          "INSERT INTO {table} (id, owner_id, sync_state, cached_at, data)
           SELECT ?1, ?2, ?3, ?4, ?5
           WHERE NOT EXISTS (
             SELECT 1 FROM sync_queue WHERE entity_type = ?6 AND entity_id = ?1
           )
           ON CONFLICT(id) DO UPDATE SET
             owner_id = excluded.owner_id,
             sync_state = excluded.sync_state,
             cached_at = excluded.cached_at,
             data = excluded.data
           WHERE {table}.sync_state = ?3"
        ),
        params![
          record.entity.id,
          record.entity.owner_id,
          SyncState::Synced.as_str(),
          format_ts(Utc::now()),
          data,
          entity_type.as_str()
        ],
      )?;
      Ok(n > 0)
    })
  }

  fn get_by_id(&self, entity_type: EntityType, id: &str) -> StoreResult<Option<PersistedRecord>> {
    let table = entity_type.table();
    let row = self.with_conn(|conn| {
      Ok(
        conn
          .query_row(
            &format!(
              "SELECT id, owner_id, sync_state, cached_at, data FROM {table} WHERE id = ?1"
            ),
            params![id],
            read_record_row,
          )
          .optional()?,
      )
    })?;
    row.map(record_from_row).transpose()
  }

  fn get_by_owner(
    &self,
    entity_type: EntityType,
    owner_id: &str,
  ) -> StoreResult<Vec<PersistedRecord>> {
    let table = entity_type.table();
    let rows = self.with_conn(|conn| {
      let mut stmt = conn.prepare(&format!(
        "SELECT id, owner_id, sync_state, cached_at, data FROM {table}
         WHERE owner_id = ?1 ORDER BY rowid"
      ))?;
      let rows = stmt
        .query_map(params![owner_id], read_record_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok(rows)
    })?;
    rows.into_iter().map(record_from_row).collect()
  }

  fn delete_by_id(&self, entity_type: EntityType, id: &str) -> StoreResult<bool> {
    let table = entity_type.table();
    self.with_conn(|conn| {
      let n = conn.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
      Ok(n > 0)
    })
  }

  fn delete_stale(
    &self,
    entity_type: EntityType,
    id: &str,
    before: DateTime<Utc>,
  ) -> StoreResult<bool> {
    let table = entity_type.table();
    self.with_conn(|conn| {
      let n = conn.execute(
        &format!(
          "DELETE FROM {table}
           WHERE id = ?1 AND sync_state = ?2 AND cached_at < ?3
             AND NOT EXISTS (
               SELECT 1 FROM sync_queue WHERE entity_type = ?4 AND entity_id = ?1
             )"
        ),
        params![
          id,
          SyncState::Synced.as_str(),
          format_ts(before),
          entity_type.as_str()
        ],
      )?;
      Ok(n > 0)
    })
  }

  fn set_sync_state(
    &self,
    entity_type: EntityType,
    id: &str,
    state: SyncState,
  ) -> StoreResult<bool> {
    let table = entity_type.table();
    self.with_conn(|conn| {
      let n = conn.execute(
        &format!("UPDATE {table} SET sync_state = ?1 WHERE id = ?2"),
        params![state.as_str(), id],
      )?;
      Ok(n > 0)
    })
  }

  fn clear(&self, entity_type: EntityType) -> StoreResult<()> {
    let table = entity_type.table();
    self.with_conn(|conn| {
      conn.execute(&format!("DELETE FROM {table}"), params![])?;
      conn.execute(
        "DELETE FROM owner_snapshots WHERE entity_type = ?1",
        params![entity_type.as_str()],
      )?;
      Ok(())
    })
  }

  fn evict_older_than(&self, age: Duration) -> StoreResult<usize> {
    // A cutoff before the representable range means nothing is that old
    let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
      return Ok(0);
    };
    let cutoff = format_ts(cutoff);
    self.with_conn(|conn| {
      let tx = conn.unchecked_transaction()?;
      let mut removed = 0;
      for entity_type in EntityType::ALL {
        removed += tx.execute(
          &format!(
            "DELETE FROM {} WHERE cached_at < ?1 AND sync_state = ?2",
            entity_type.table()
          ),
          params![cutoff, SyncState::Synced.as_str()],
        )?;
      }
      tx.execute(
        "DELETE FROM owner_snapshots WHERE loaded_at < ?1",
        params![cutoff],
      )?;
      tx.commit()?;
      Ok(removed)
    })
  }

  fn mark_owner_loaded(&self, entity_type: EntityType, owner_id: &str) -> StoreResult<()> {
    self.with_conn(|conn| {
      conn.execute(
        "INSERT OR REPLACE INTO owner_snapshots (entity_type, owner_id, loaded_at)
         VALUES (?1, ?2, ?3)",
        params![entity_type.as_str(), owner_id, format_ts(Utc::now())],
      )?;
      Ok(())
    })
  }

  fn owner_loaded_at(
    &self,
    entity_type: EntityType,
    owner_id: &str,
  ) -> StoreResult<Option<DateTime<Utc>>> {
    let loaded_at: Option<String> = self.with_conn(|conn| {
      Ok(
        conn
          .query_row(
            "SELECT loaded_at FROM owner_snapshots WHERE entity_type = ?1 AND owner_id = ?2",
            params![entity_type.as_str(), owner_id],
            |row| row.get(0),
          )
          .optional()?,
      )
    })?;
    loaded_at.as_deref().map(parse_ts).transpose()
  }

  fn enqueue(&self, item: &NewQueueItem) -> StoreResult<i64> {
    let payload = serde_json::to_string(&item.payload)?;
    self.with_conn(|conn| {
      conn.execute(
        "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, created_at, status, retry_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
        params![
          item.entity_type.as_str(),
          item.entity_id,
          item.operation.as_str(),
          payload,
          format_ts(Utc::now()),
          QueueStatus::Pending.as_str()
        ],
      )?;
      Ok(conn.last_insert_rowid())
    })
  }

  fn list_pending(&self) -> StoreResult<Vec<QueueItem>> {
    self.with_conn(|conn| {
      query_items(
        conn,
        "WHERE status = ?1",
        params![QueueStatus::Pending.as_str()],
      )
    })
  }

  fn list_queue(&self) -> StoreResult<Vec<QueueItem>> {
    self.with_conn(|conn| query_items(conn, "", params![]))
  }

  fn get_item(&self, id: i64) -> StoreResult<Option<QueueItem>> {
    let mut items = self.with_conn(|conn| query_items(conn, "WHERE id = ?1", params![id]))?;
    Ok(items.pop())
  }

  fn items_for_entity(
    &self,
    entity_type: EntityType,
    entity_id: &str,
  ) -> StoreResult<Vec<QueueItem>> {
    self.with_conn(|conn| {
      query_items(
        conn,
        "WHERE entity_type = ?1 AND entity_id = ?2",
        params![entity_type.as_str(), entity_id],
      )
    })
  }

  fn update_item(&self, id: i64, patch: &QueueItemPatch) -> StoreResult<bool> {
    self.with_conn(|conn| {
      let tx = conn.unchecked_transaction()?;
      let mut items = query_items(&tx, "WHERE id = ?1", params![id])?;
      let Some(mut item) = items.pop() else {
        return Ok(false);
      };
      patch.apply(&mut item);
      tx.execute(
        "UPDATE sync_queue SET status = ?1, retry_count = ?2, last_error = ?3, next_attempt_at = ?4
         WHERE id = ?5",
        params![
          item.status.as_str(),
          item.retry_count,
          item.last_error,
          item.next_attempt_at.map(format_ts),
          id
        ],
      )?;
      tx.commit()?;
      Ok(true)
    })
  }

  fn claim_item(&self, id: i64) -> StoreResult<bool> {
    self.with_conn(|conn| {
      let n = conn.execute(
        "UPDATE sync_queue SET status = ?1 WHERE id = ?2 AND status = ?3",
        params![
          QueueStatus::Processing.as_str(),
          id,
          QueueStatus::Pending.as_str()
        ],
      )?;
      Ok(n == 1)
    })
  }

  fn remove_item(&self, id: i64) -> StoreResult<bool> {
    self.with_conn(|conn| {
      let n = conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
      Ok(n > 0)
    })
  }

  fn withdraw_create(&self, entity_type: EntityType, entity_id: &str) -> StoreResult<Withdrawal> {
    let table = entity_type.table();
    self.with_conn(|conn| {
      let tx = conn.unchecked_transaction()?;
      let items = query_items(
        &tx,
        "WHERE entity_type = ?1 AND entity_id = ?2",
        params![entity_type.as_str(), entity_id],
      )?;
      if !items.iter().any(|i| i.operation == Operation::Create) {
        return Ok(Withdrawal::Nothing);
      }
      if items.iter().any(|i| i.status == QueueStatus::Processing) {
        return Ok(Withdrawal::InFlight);
      }
      tx.execute(
        "DELETE FROM sync_queue WHERE entity_type = ?1 AND entity_id = ?2",
        params![entity_type.as_str(), entity_id],
      )?;
      tx.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![entity_id])?;
      tx.commit()?;
      Ok(Withdrawal::Removed(items))
    })
  }

  fn remap_entity_id(&self, entity_type: EntityType, from: &str, to: &str) -> StoreResult<usize> {
    self.with_conn(|conn| {
      let n = conn.execute(
        "UPDATE sync_queue SET entity_id = ?1 WHERE entity_type = ?2 AND entity_id = ?3",
        params![to, entity_type.as_str(), from],
      )?;
      Ok(n)
    })
  }

  fn reset_processing(&self) -> StoreResult<usize> {
    self.with_conn(|conn| {
      let n = conn.execute(
        "UPDATE sync_queue SET status = ?1 WHERE status = ?2",
        params![
          QueueStatus::Pending.as_str(),
          QueueStatus::Processing.as_str()
        ],
      )?;
      Ok(n)
    })
  }

  fn queue_counts(&self) -> StoreResult<QueueCounts> {
    self.with_conn(|conn| {
      let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
      let rows = stmt
        .query_map(params![], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

      let mut counts = QueueCounts::default();
      for (status, n) in rows {
        let n = usize::try_from(n).unwrap_or(0);
        match QueueStatus::parse(&status) {
          Some(QueueStatus::Pending) => counts.pending = n,
          Some(QueueStatus::Processing) => counts.processing = n,
          Some(QueueStatus::Failed) => counts.failed = n,
          None => return Err(StoreError::Corrupt(format!("bad queue status '{}'", status))),
        }
      }
      Ok(counts)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn record(id: &str, owner: &str, state: SyncState) -> PersistedRecord {
    let mut fields = Map::new();
    fields.insert("total".to_string(), json!(100));
    PersistedRecord::new(
      Entity {
        id: id.to_string(),
        owner_id: owner.to_string(),
        fields,
      },
      state,
    )
  }

  fn new_item(entity_id: &str, operation: Operation) -> NewQueueItem {
    NewQueueItem {
      entity_type: EntityType::Invoice,
      entity_id: entity_id.to_string(),
      operation,
      payload: json!({"total": 1}),
    }
  }

  #[test]
  fn test_upsert_and_query_by_owner() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .upsert(EntityType::Invoice, &record("i1", "A", SyncState::Synced))
      .unwrap();
    store
      .upsert(EntityType::Invoice, &record("i2", "A", SyncState::PendingSync))
      .unwrap();
    store
      .upsert(EntityType::Invoice, &record("i3", "B", SyncState::Synced))
      .unwrap();
    store
      .upsert(EntityType::Bill, &record("b1", "A", SyncState::Synced))
      .unwrap();

    let owned = store.get_by_owner(EntityType::Invoice, "A").unwrap();
    let ids: Vec<&str> = owned.iter().map(|r| r.id()).collect();
    assert_eq!(ids, vec!["i1", "i2"]);
    assert_eq!(owned[1].sync_state, SyncState::PendingSync);

    let got = store.get_by_id(EntityType::Invoice, "i3").unwrap().unwrap();
    assert_eq!(got.owner_id(), "B");
    assert_eq!(got.entity.field("total"), Some(json!(100)));
    assert!(store.get_by_id(EntityType::Bill, "i3").unwrap().is_none());
  }

  #[test]
  fn test_upsert_restamps_cached_at() {
    let store = SqliteStore::open_in_memory().unwrap();
    let mut rec = record("i1", "A", SyncState::Synced);
    rec.cached_at = Utc::now() - Duration::days(30);
    store.upsert(EntityType::Invoice, &rec).unwrap();

    let got = store.get_by_id(EntityType::Invoice, "i1").unwrap().unwrap();
    assert!(Utc::now() - got.cached_at < Duration::minutes(1));
  }

  #[test]
  fn test_evict_older_than_keeps_unconfirmed() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .upsert(EntityType::Invoice, &record("old", "A", SyncState::Synced))
      .unwrap();
    store
      .upsert(EntityType::Payment, &record("pending", "A", SyncState::PendingSync))
      .unwrap();
    store.mark_owner_loaded(EntityType::Invoice, "A").unwrap();

    // Everything is younger than a day
    assert_eq!(store.evict_older_than(Duration::days(1)).unwrap(), 0);

    // Negative age puts the cutoff in the future, so everything is "old"
    let removed = store.evict_older_than(Duration::seconds(-60)).unwrap();
    assert_eq!(removed, 1);
    assert!(store.get_by_id(EntityType::Invoice, "old").unwrap().is_none());
    assert!(store.get_by_id(EntityType::Payment, "pending").unwrap().is_some());
    assert!(store.owner_loaded_at(EntityType::Invoice, "A").unwrap().is_none());
  }

  #[test]
  fn test_evict_with_unrepresentable_age_removes_nothing() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .upsert(EntityType::Invoice, &record("old", "A", SyncState::Synced))
      .unwrap();
    let age = Duration::try_hours(i64::MAX / 3_600_000).unwrap();
    assert_eq!(store.evict_older_than(age).unwrap(), 0);
    assert!(store.get_by_id(EntityType::Invoice, "old").unwrap().is_some());
  }

  #[test]
  fn test_server_rows_never_replace_waiting_local_changes() {
    let store = SqliteStore::open_in_memory().unwrap();
    let mut server = record("i1", "A", SyncState::Synced);

    // Fresh id and a synced row are both written
    assert!(store.upsert_synced(EntityType::Invoice, &server).unwrap());
    server.entity.fields.insert("total".to_string(), json!(5));
    assert!(store.upsert_synced(EntityType::Invoice, &server).unwrap());

    // An unconfirmed local row wins
    let mut mine = record("i1", "A", SyncState::PendingSync);
    mine.entity.fields.insert("total".to_string(), json!(99));
    store.upsert(EntityType::Invoice, &mine).unwrap();
    assert!(!store.upsert_synced(EntityType::Invoice, &server).unwrap());
    let got = store.get_by_id(EntityType::Invoice, "i1").unwrap().unwrap();
    assert_eq!(got.entity.field("total"), Some(json!(99)));
    assert_eq!(got.sync_state, SyncState::PendingSync);

    // So does a queued item even when no local row exists (pending delete)
    store.enqueue(&new_item("i2", Operation::Delete)).unwrap();
    let gone = record("i2", "A", SyncState::Synced);
    assert!(!store.upsert_synced(EntityType::Invoice, &gone).unwrap());
    assert!(store.get_by_id(EntityType::Invoice, "i2").unwrap().is_none());
  }

  #[test]
  fn test_delete_stale_spares_recent_and_unconfirmed_rows() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .upsert(EntityType::Invoice, &record("old", "A", SyncState::Synced))
      .unwrap();
    store
      .upsert(EntityType::Invoice, &record("mine", "A", SyncState::PendingSync))
      .unwrap();
    store
      .upsert(EntityType::Invoice, &record("queued", "A", SyncState::Synced))
      .unwrap();
    store.enqueue(&new_item("queued", Operation::Update)).unwrap();

    let before = Utc::now() - Duration::minutes(1);
    assert!(!store.delete_stale(EntityType::Invoice, "old", before).unwrap());

    let later = Utc::now() + Duration::minutes(1);
    assert!(store.delete_stale(EntityType::Invoice, "old", later).unwrap());
    assert!(!store.delete_stale(EntityType::Invoice, "mine", later).unwrap());
    assert!(!store.delete_stale(EntityType::Invoice, "queued", later).unwrap());
    assert_eq!(store.get_by_owner(EntityType::Invoice, "A").unwrap().len(), 2);
  }

  #[test]
  fn test_withdraw_create_is_all_or_nothing() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .upsert(EntityType::Invoice, &record("tmp-1", "A", SyncState::PendingSync))
      .unwrap();
    let create = store.enqueue(&new_item("tmp-1", Operation::Create)).unwrap();
    let update = store.enqueue(&new_item("tmp-1", Operation::Update)).unwrap();

    // Nothing to withdraw without a queued create
    store.enqueue(&new_item("inv_1", Operation::Update)).unwrap();
    assert_eq!(
      store.withdraw_create(EntityType::Invoice, "inv_1").unwrap(),
      Withdrawal::Nothing
    );

    // A claimed item blocks the whole withdrawal
    assert!(store.claim_item(create).unwrap());
    assert_eq!(
      store.withdraw_create(EntityType::Invoice, "tmp-1").unwrap(),
      Withdrawal::InFlight
    );
    assert_eq!(store.items_for_entity(EntityType::Invoice, "tmp-1").unwrap().len(), 2);
    assert!(store.get_by_id(EntityType::Invoice, "tmp-1").unwrap().is_some());

    store.reset_processing().unwrap();
    let Withdrawal::Removed(items) = store.withdraw_create(EntityType::Invoice, "tmp-1").unwrap()
    else {
      panic!("expected the create to be withdrawn");
    };
    assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![create, update]);
    assert!(store.items_for_entity(EntityType::Invoice, "tmp-1").unwrap().is_empty());
    assert!(store.get_by_id(EntityType::Invoice, "tmp-1").unwrap().is_none());
    // The claim on a withdrawn item now fails
    assert!(!store.claim_item(create).unwrap());
  }

  #[test]
  fn test_queue_lifecycle() {
    let store = SqliteStore::open_in_memory().unwrap();
    let a = store.enqueue(&new_item("tmp-1", Operation::Create)).unwrap();
    let b = store.enqueue(&new_item("tmp-1", Operation::Update)).unwrap();
    assert!(b > a);

    let pending = store.list_pending().unwrap();
    assert_eq!(pending.iter().map(|i| i.id).collect::<Vec<_>>(), vec![a, b]);
    assert_eq!(pending[0].operation, Operation::Create);
    assert_eq!(pending[0].payload, json!({"total": 1}));

    assert!(store.claim_item(a).unwrap());
    // Second claim loses
    assert!(!store.claim_item(a).unwrap());
    assert_eq!(
      store.queue_counts().unwrap(),
      QueueCounts {
        pending: 1,
        processing: 1,
        failed: 0
      }
    );

    let patch = QueueItemPatch {
      status: Some(QueueStatus::Failed),
      retry_count: Some(2),
      last_error: Some(Some("boom".to_string())),
      next_attempt_at: None,
    };
    assert!(store.update_item(a, &patch).unwrap());
    let item = store.get_item(a).unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Failed);
    assert_eq!(item.retry_count, 2);
    assert_eq!(item.last_error.as_deref(), Some("boom"));

    assert!(store.remove_item(a).unwrap());
    assert!(store.get_item(a).unwrap().is_none());
    assert!(!store.update_item(a, &patch).unwrap());
  }

  #[test]
  fn test_remap_and_reset_processing() {
    let store = SqliteStore::open_in_memory().unwrap();
    let a = store.enqueue(&new_item("tmp-9", Operation::Update)).unwrap();
    store.enqueue(&new_item("tmp-9", Operation::Delete)).unwrap();
    store.claim_item(a).unwrap();

    assert_eq!(
      store
        .remap_entity_id(EntityType::Invoice, "tmp-9", "inv_9")
        .unwrap(),
      2
    );
    assert!(store
      .items_for_entity(EntityType::Invoice, "tmp-9")
      .unwrap()
      .is_empty());
    assert_eq!(
      store
        .items_for_entity(EntityType::Invoice, "inv_9")
        .unwrap()
        .len(),
      2
    );

    assert_eq!(store.reset_processing().unwrap(), 1);
    assert_eq!(store.queue_counts().unwrap().pending, 2);
  }

  #[test]
  fn test_closed_store_is_unavailable() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.close().unwrap();
    let err = store.get_by_id(EntityType::Invoice, "x").unwrap_err();
    assert!(matches!(err, StoreError::Unavailable(_)));
  }

  #[test]
  fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("sync.db");
    {
      let store = SqliteStore::open(&path).unwrap();
      store
        .upsert(EntityType::JournalEntry, &record("je1", "A", SyncState::Synced))
        .unwrap();
      store.enqueue(&new_item("inv_1", Operation::Delete)).unwrap();
      store.close().unwrap();
    }
    let store = SqliteStore::open(&path).unwrap();
    assert!(store
      .get_by_id(EntityType::JournalEntry, "je1")
      .unwrap()
      .is_some());
    assert_eq!(store.list_pending().unwrap().len(), 1);
  }
}
