//! Single read/write API over the volatile cache, the persistent store and
//! the remote.
//!
//! Reads go memory -> store -> remote. Writes land in both local tiers at
//! once, record a queue item, and drop the cached list pages of their own
//! entity type. The background [`QueueWorker`] reconciles later.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::filters::Filters;
use super::keys::{list_key, list_prefix, record_key};
use super::status::{StatusTracker, SyncStatus};
use crate::cache::storage::degrade;
use crate::cache::{CacheResult, PersistentStore, VolatileCache, DEFAULT_CAPACITY, DEFAULT_TTL};
use crate::entity::{is_temp_id, new_temp_id, Entity, EntityType, PersistedRecord, SyncState};
use crate::error::{RemoteError, SyncError};
use crate::queue::types::{NewQueueItem, QueueItemPatch};
use crate::queue::{
  DrainReport, MutationQueue, Operation, QueueEvent, QueueItem, QueueStatus, QueueWorker,
  Withdrawal, WorkerHandle, WorkerOptions,
};
use crate::remote::RemoteClient;

#[derive(Debug, Clone)]
pub struct SyncOptions {
  pub cache_capacity: usize,
  pub cache_ttl: Duration,
  /// Also bounds remote reads made on the caller's behalf
  pub worker: WorkerOptions,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      cache_capacity: DEFAULT_CAPACITY,
      cache_ttl: DEFAULT_TTL,
      worker: WorkerOptions::default(),
    }
  }
}

pub struct SyncOrchestrator<S: PersistentStore, R: RemoteClient> {
  volatile: Arc<VolatileCache>,
  store: Arc<S>,
  remote: Arc<R>,
  queue: MutationQueue<S>,
  status: Arc<StatusTracker>,
  worker: Arc<QueueWorker<S, R>>,
  request_timeout: Duration,
}

impl<S: PersistentStore, R: RemoteClient> SyncOrchestrator<S, R> {
  pub fn new(store: Arc<S>, remote: Arc<R>, options: SyncOptions) -> Self {
    let volatile = Arc::new(VolatileCache::new(options.cache_capacity, options.cache_ttl));
    let status = Arc::new(StatusTracker::default());
    let queue = MutationQueue::new(Arc::clone(&store), Arc::clone(&status));
    queue.refresh_status();

    let request_timeout = options.worker.request_timeout;
    let worker = Arc::new(QueueWorker::new(
      Arc::clone(&store),
      Arc::clone(&remote),
      Arc::clone(&volatile),
      queue.clone(),
      Arc::clone(&status),
      options.worker,
    ));
    // Before any pass, so a crashed run's claims do not block this one
    worker.recover();

    Self {
      volatile,
      store,
      remote,
      queue,
      status,
      worker,
      request_timeout,
    }
  }

  /// Watch `{online, pending_count, failed_count}`.
  pub fn status(&self) -> watch::Receiver<SyncStatus> {
    self.status.subscribe()
  }

  pub fn current_status(&self) -> SyncStatus {
    self.status.current()
  }

  pub fn queue_events(&self) -> broadcast::Receiver<QueueEvent> {
    self.queue.subscribe()
  }

  /// Report a connectivity change. Going online wakes the worker.
  pub fn set_online(&self, online: bool) {
    if self.status.set_online(online) {
      info!(online, "connectivity changed");
      self.queue.refresh_status();
      if online {
        self.queue.wake_worker();
      }
    }
  }

  /// Start the background queue worker.
  pub fn spawn_worker(&self) -> WorkerHandle {
    self.worker.spawn()
  }

  /// Run one queue pass now, regardless of the worker's schedule.
  pub async fn drain_now(&self) -> Result<DrainReport, SyncError> {
    self
      .worker
      .drain_once()
      .await
      .map_err(SyncError::QueueUnavailable)
  }

  /// Records of one type for an owner, narrowed by `filters`.
  ///
  /// 1. Volatile cache hit on the `(type, owner, filters)` key
  /// 2. Persistent store, if the owner's full list was fetched before
  /// 3. Remote, merged with local unconfirmed rows and written to both tiers
  ///
  /// If the remote fails and the store still has rows for the owner, those
  /// are served as [`CacheSource::Offline`](crate::cache::CacheSource).
  pub async fn get_list(
    &self,
    entity_type: EntityType,
    owner_id: &str,
    filters: &Filters,
  ) -> Result<CacheResult<Vec<PersistedRecord>>, SyncError> {
    filters.validate()?;
    let key = list_key(entity_type, owner_id, filters);

    if let Some(records) = self.volatile.get_as::<Vec<PersistedRecord>>(&key) {
      debug!(key = %key, "list served from memory");
      return Ok(CacheResult::from_memory(records));
    }

    // Local writes landing after this point must not be shadowed by what
    // this read caches
    let generation = self.volatile.generation();
    let local = degrade("get_by_owner", self.store.get_by_owner(entity_type, owner_id))
      .unwrap_or_default();
    let loaded_at = degrade(
      "owner_loaded_at",
      self.store.owner_loaded_at(entity_type, owner_id),
    )
    .flatten();

    if let Some(loaded_at) = loaded_at {
      if !local.is_empty() {
        let records = filters.apply(local);
        self.volatile.set_if_current(&key, &records, None, generation);
        debug!(key = %key, count = records.len(), "list served from store");
        return Ok(CacheResult::from_store(records, Some(loaded_at)));
      }
    }

    let fetched_at = Utc::now();
    let fetched = self
      .remote_call(self.remote.list(entity_type, owner_id, filters))
      .await;
    let entities = match fetched {
      Ok(entities) => entities,
      Err(RemoteError::NotFound) => Vec::new(),
      Err(e) if !local.is_empty() => {
        warn!(
          entity_type = %entity_type,
          owner_id,
          error = %e,
          "remote unavailable, serving persisted rows"
        );
        let cached_at = local.iter().map(|r| r.cached_at).min();
        return Ok(CacheResult::offline(filters.apply(local), cached_at));
      }
      Err(e) => return Err(e.into()),
    };

    let records = self.absorb_list(entity_type, owner_id, filters, entities, fetched_at);
    self.volatile.set_if_current(&key, &records, None, generation);
    Ok(CacheResult::from_network(records))
  }

  /// Write a remote list into the store and build the answer.
  ///
  /// Runs after the fetch, so every decision reads the store as it is now:
  /// server rows never overwrite rows with a local change waiting, rows with
  /// a queued delete are dropped, and local rows the server has not seen yet
  /// are appended when they match `filters`.
  fn absorb_list(
    &self,
    entity_type: EntityType,
    owner_id: &str,
    filters: &Filters,
    entities: Vec<Entity>,
    fetched_at: DateTime<Utc>,
  ) -> Vec<PersistedRecord> {
    let deleting = self.pending_deletes(entity_type);
    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for entity in entities {
      if deleting.contains(&entity.id) {
        continue;
      }
      seen.insert(entity.id.clone());
      let record = PersistedRecord::synced(entity);
      match degrade("upsert_synced", self.store.upsert_synced(entity_type, &record)) {
        Some(false) => {
          let mine = degrade("get_by_id", self.store.get_by_id(entity_type, record.id())).flatten();
          if let Some(mine) = mine.filter(|r| filters.matches(&r.entity)) {
            records.push(mine);
          }
        }
        _ => records.push(record),
      }
    }

    let current = degrade("get_by_owner", self.store.get_by_owner(entity_type, owner_id))
      .unwrap_or_default();

    if filters.is_empty() {
      // A full list: synced rows the server no longer returns are gone,
      // unless they were written while the fetch was out
      for record in current.iter().filter(|r| !seen.contains(r.id())) {
        let removed = degrade(
          "delete_stale",
          self.store.delete_stale(entity_type, record.id(), fetched_at),
        );
        if removed == Some(true) {
          self.volatile.delete(&record_key(entity_type, record.id()));
        }
      }
      degrade(
        "mark_owner_loaded",
        self.store.mark_owner_loaded(entity_type, owner_id),
      );
    }

    let mut extra: Vec<PersistedRecord> = current
      .into_iter()
      .filter(|r| r.is_local_only() && !seen.contains(r.id()) && filters.matches(&r.entity))
      .collect();
    extra.sort_by(|a, b| a.cached_at.cmp(&b.cached_at));
    records.extend(extra);
    records
  }

  /// One record by id, read through the same three tiers.
  ///
  /// Temporary ids are never asked of the remote, and neither are ids with a
  /// delete still queued.
  pub async fn get_by_id(
    &self,
    entity_type: EntityType,
    id: &str,
  ) -> Result<Option<CacheResult<PersistedRecord>>, SyncError> {
    let key = record_key(entity_type, id);
    if let Some(record) = self.volatile.get_as::<PersistedRecord>(&key) {
      return Ok(Some(CacheResult::from_memory(record)));
    }

    let generation = self.volatile.generation();
    if let Some(record) = degrade("get_by_id", self.store.get_by_id(entity_type, id)).flatten() {
      self.volatile.set_if_current(&key, &record, None, generation);
      let cached_at = record.cached_at;
      return Ok(Some(CacheResult::from_store(record, Some(cached_at))));
    }

    if is_temp_id(id) || self.pending_deletes(entity_type).contains(id) {
      return Ok(None);
    }

    match self
      .remote_call(self.remote.get_by_id(entity_type, id))
      .await
    {
      Ok(Some(entity)) => {
        let record = PersistedRecord::synced(entity);
        if degrade("upsert_synced", self.store.upsert_synced(entity_type, &record)) == Some(false) {
          // A local write or delete landed while the request was out
          let mine = degrade("get_by_id", self.store.get_by_id(entity_type, id)).flatten();
          return Ok(mine.map(|r| {
            let cached_at = r.cached_at;
            CacheResult::from_store(r, Some(cached_at))
          }));
        }
        self.volatile.set_if_current(&key, &record, None, generation);
        Ok(Some(CacheResult::from_network(record)))
      }
      Ok(None) | Err(RemoteError::NotFound) => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  /// Optimistic create. The returned record carries a temporary id until the
  /// worker confirms it.
  pub async fn create(
    &self,
    entity_type: EntityType,
    owner_id: &str,
    data: Map<String, Value>,
  ) -> Result<PersistedRecord, SyncError> {
    let mut fields = entity_type.defaults();
    for (k, v) in &data {
      if k != "id" && k != "owner_id" {
        fields.insert(k.clone(), v.clone());
      }
    }
    let entity = Entity {
      id: new_temp_id(),
      owner_id: owner_id.to_string(),
      fields,
    };
    let record = PersistedRecord::new(entity, SyncState::PendingSync);

    let mut payload = data;
    payload.remove("id");
    payload.insert("owner_id".to_string(), Value::String(owner_id.to_string()));

    self.write_local(entity_type, &record);
    let queued = self.queue.enqueue(NewQueueItem {
      entity_type,
      entity_id: record.id().to_string(),
      operation: Operation::Create,
      payload: Value::Object(payload),
    });
    if let Err(e) = queued {
      self.drop_local(entity_type, record.id());
      return Err(SyncError::QueueUnavailable(e));
    }

    self.invalidate_lists(entity_type);
    info!(entity_type = %entity_type, id = %record.id(), "created locally");
    Ok(record)
  }

  /// Merge `data` over the current record and queue the change.
  pub async fn update(
    &self,
    entity_type: EntityType,
    id: &str,
    data: Map<String, Value>,
  ) -> Result<PersistedRecord, SyncError> {
    let Some(current) = self.get_by_id(entity_type, id).await? else {
      return Err(SyncError::NotFound {
        entity_type,
        id: id.to_string(),
      });
    };
    let previous = current.data;

    let mut entity = previous.entity.clone();
    entity.merge(&data);
    let record = PersistedRecord::new(entity, SyncState::PendingSync);

    let mut payload = data;
    payload.remove("id");
    payload.remove("owner_id");

    self.write_local(entity_type, &record);
    let queued = self.queue.enqueue(NewQueueItem {
      entity_type,
      entity_id: id.to_string(),
      operation: Operation::Update,
      payload: Value::Object(payload),
    });
    if let Err(e) = queued {
      self.write_local(entity_type, &previous);
      return Err(SyncError::QueueUnavailable(e));
    }

    self.invalidate_lists(entity_type);
    debug!(entity_type = %entity_type, id, "updated locally");
    Ok(record)
  }

  /// Queue the delete and remove the record locally. A terminal remote
  /// failure leaves a Failed queue item; the record is not restored.
  pub async fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), SyncError> {
    // Queued first: from then on no read can write the server copy back
    self
      .queue
      .enqueue(NewQueueItem {
        entity_type,
        entity_id: id.to_string(),
        operation: Operation::Delete,
        payload: Value::Object(Map::new()),
      })
      .map_err(SyncError::QueueUnavailable)?;

    self.drop_local(entity_type, id);
    self.invalidate_lists(entity_type);
    debug!(entity_type = %entity_type, id, "deleted locally");
    Ok(())
  }

  /// Undo an unconfirmed create: the record leaves both tiers and every queue
  /// item for it is removed outright. Refused once any of those items is
  /// being sent.
  pub fn rollback(&self, entity_type: EntityType, temp_id: &str) -> Result<(), SyncError> {
    if !is_temp_id(temp_id) {
      return Err(SyncError::NothingToRollback(temp_id.to_string()));
    }
    let removed = match self
      .queue
      .withdraw_create(entity_type, temp_id)
      .map_err(SyncError::QueueUnavailable)?
    {
      Withdrawal::Removed(items) => items.len(),
      Withdrawal::InFlight => return Err(SyncError::RollbackInFlight(temp_id.to_string())),
      Withdrawal::Nothing => return Err(SyncError::NothingToRollback(temp_id.to_string())),
    };

    self.volatile.delete(&record_key(entity_type, temp_id));
    self.invalidate_lists(entity_type);
    info!(entity_type = %entity_type, id = temp_id, removed, "rolled back local create");
    Ok(())
  }

  /// Give a Failed item another full set of attempts.
  pub fn retry_failed(&self, item_id: i64) -> Result<(), SyncError> {
    let item = self.failed_item(item_id)?;
    self
      .queue
      .update(
        item.id,
        &QueueItemPatch {
          status: Some(QueueStatus::Pending),
          retry_count: Some(0),
          last_error: Some(None),
          next_attempt_at: Some(None),
        },
      )
      .map_err(SyncError::QueueUnavailable)?;

    if item.operation != Operation::Delete {
      self.set_local_state(item.entity_type, &item.entity_id, SyncState::PendingSync);
    }
    self.queue.wake_worker();
    info!(id = item_id, "failed mutation requeued");
    Ok(())
  }

  /// Drop a Failed item along with the local copy of its record, so the next
  /// read fetches the server's state. Discarding a create also drops the
  /// edits queued behind it.
  pub fn discard_failed(&self, item_id: i64) -> Result<(), SyncError> {
    let item = self.failed_item(item_id)?;
    let doomed = if item.operation == Operation::Create {
      self
        .queue
        .items_for_entity(item.entity_type, &item.entity_id)
        .map_err(SyncError::QueueUnavailable)?
    } else {
      vec![item.clone()]
    };
    for queued in &doomed {
      self
        .queue
        .remove(queued.id)
        .map_err(SyncError::QueueUnavailable)?;
    }

    self.drop_local(item.entity_type, &item.entity_id);
    self.invalidate_lists(item.entity_type);
    info!(id = item_id, removed = doomed.len(), "failed mutation discarded");
    Ok(())
  }

  /// Every queue item, oldest first.
  pub fn list_queue(&self) -> Result<Vec<QueueItem>, SyncError> {
    self.queue.list_all().map_err(SyncError::QueueUnavailable)
  }

  /// Storage maintenance; returns the number of rows removed.
  pub fn evict_older_than(&self, age: chrono::Duration) -> usize {
    let removed = degrade("evict_older_than", self.store.evict_older_than(age)).unwrap_or(0);
    if removed > 0 {
      info!(removed, "evicted old persisted records");
    }
    removed
  }

  fn failed_item(&self, item_id: i64) -> Result<QueueItem, SyncError> {
    match self.queue.get(item_id).map_err(SyncError::QueueUnavailable)? {
      Some(item) if item.status == QueueStatus::Failed => Ok(item),
      _ => Err(SyncError::UnknownQueueItem(item_id)),
    }
  }

  async fn remote_call<T>(
    &self,
    call: impl Future<Output = Result<T, RemoteError>>,
  ) -> Result<T, RemoteError> {
    match tokio::time::timeout(self.request_timeout, call).await {
      Ok(result) => result,
      Err(_) => Err(RemoteError::Transient(format!(
        "request timed out after {:?}",
        self.request_timeout
      ))),
    }
  }

  /// Ids of this type whose delete has not been confirmed.
  fn pending_deletes(&self, entity_type: EntityType) -> HashSet<String> {
    degrade("list_queue", self.queue.list_all())
      .unwrap_or_default()
      .into_iter()
      .filter(|i| i.entity_type == entity_type && i.operation == Operation::Delete)
      .map(|i| i.entity_id)
      .collect()
  }

  fn write_local(&self, entity_type: EntityType, record: &PersistedRecord) {
    degrade("upsert", self.store.upsert(entity_type, record));
    self
      .volatile
      .set_as(&record_key(entity_type, record.id()), record, None);
  }

  fn drop_local(&self, entity_type: EntityType, id: &str) {
    degrade("delete_by_id", self.store.delete_by_id(entity_type, id));
    self.volatile.delete(&record_key(entity_type, id));
  }

  fn set_local_state(&self, entity_type: EntityType, id: &str, state: SyncState) {
    degrade(
      "set_sync_state",
      self.store.set_sync_state(entity_type, id, state),
    );
    let key = record_key(entity_type, id);
    if let Some(mut record) = self.volatile.get_as::<PersistedRecord>(&key) {
      record.sync_state = state;
      self.volatile.set_as(&key, &record, None);
    }
    self.invalidate_lists(entity_type);
  }

  fn invalidate_lists(&self, entity_type: EntityType) -> usize {
    self.volatile.invalidate_pattern(&list_prefix(entity_type))
  }
}
