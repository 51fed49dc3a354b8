//! Durable pending-mutation queue with change notifications.

use std::sync::Arc;

use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

use super::types::{NewQueueItem, QueueItem, QueueItemPatch, QueueStatus, Withdrawal};
use crate::cache::storage::{PersistentStore, StoreResult};
use crate::entity::EntityType;
use crate::sync::status::StatusTracker;

/// Change notification for queue observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
  Enqueued { id: i64, entity_type: EntityType },
  Updated { id: i64, status: QueueStatus },
  Removed { id: i64 },
}

/// Wraps the store's queue table. Every change is broadcast and the
/// published [`SyncStatus`](crate::sync::SyncStatus) counts are recomputed.
pub struct MutationQueue<S: PersistentStore> {
  store: Arc<S>,
  events: broadcast::Sender<QueueEvent>,
  status: Arc<StatusTracker>,
  wake: Arc<Notify>,
}

impl<S: PersistentStore> MutationQueue<S> {
  pub fn new(store: Arc<S>, status: Arc<StatusTracker>) -> Self {
    let (events, _) = broadcast::channel(256);
    Self {
      store,
      events,
      status,
      wake: Arc::new(Notify::new()),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
    self.events.subscribe()
  }

  /// Handle the worker waits on for enqueue notifications.
  pub fn waker(&self) -> Arc<Notify> {
    Arc::clone(&self.wake)
  }

  pub fn wake_worker(&self) {
    self.wake.notify_one();
  }

  fn emit(&self, event: QueueEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }

  /// Recompute the published counts from the store.
  pub fn refresh_status(&self) {
    match self.store.queue_counts() {
      Ok(counts) => self.status.set_counts(counts),
      Err(e) => warn!(error = %e, "could not count queue items"),
    }
  }

  pub fn enqueue(&self, item: NewQueueItem) -> StoreResult<i64> {
    let id = self.store.enqueue(&item)?;
    debug!(
      id,
      entity_type = %item.entity_type,
      entity_id = %item.entity_id,
      operation = item.operation.as_str(),
      "enqueued mutation"
    );
    self.emit(QueueEvent::Enqueued {
      id,
      entity_type: item.entity_type,
    });
    self.refresh_status();
    self.wake_worker();
    Ok(id)
  }

  pub fn list_pending(&self) -> StoreResult<Vec<QueueItem>> {
    self.store.list_pending()
  }

  pub fn list_all(&self) -> StoreResult<Vec<QueueItem>> {
    self.store.list_queue()
  }

  pub fn get(&self, id: i64) -> StoreResult<Option<QueueItem>> {
    self.store.get_item(id)
  }

  pub fn items_for_entity(
    &self,
    entity_type: EntityType,
    entity_id: &str,
  ) -> StoreResult<Vec<QueueItem>> {
    self.store.items_for_entity(entity_type, entity_id)
  }

  /// Take an item for processing. False means someone else has it or it is
  /// no longer pending.
  pub fn claim(&self, id: i64) -> StoreResult<bool> {
    let claimed = self.store.claim_item(id)?;
    if claimed {
      self.emit(QueueEvent::Updated {
        id,
        status: QueueStatus::Processing,
      });
      self.refresh_status();
    }
    Ok(claimed)
  }

  pub fn update(&self, id: i64, patch: &QueueItemPatch) -> StoreResult<bool> {
    let updated = self.store.update_item(id, patch)?;
    if updated {
      if let Some(status) = patch.status {
        self.emit(QueueEvent::Updated { id, status });
      }
      self.refresh_status();
    }
    Ok(updated)
  }

  pub fn remove(&self, id: i64) -> StoreResult<bool> {
    let removed = self.store.remove_item(id)?;
    if removed {
      self.emit(QueueEvent::Removed { id });
      self.refresh_status();
    }
    Ok(removed)
  }

  /// Remove an unconfirmed create, everything queued behind it and its local
  /// row, unless part of it is already being sent.
  pub fn withdraw_create(
    &self,
    entity_type: EntityType,
    entity_id: &str,
  ) -> StoreResult<Withdrawal> {
    let withdrawal = self.store.withdraw_create(entity_type, entity_id)?;
    if let Withdrawal::Removed(items) = &withdrawal {
      for item in items {
        self.emit(QueueEvent::Removed { id: item.id });
      }
      self.refresh_status();
    }
    Ok(withdrawal)
  }

  pub fn remap(&self, entity_type: EntityType, from: &str, to: &str) -> StoreResult<usize> {
    self.store.remap_entity_id(entity_type, from, to)
  }

  /// Put items an interrupted worker left in Processing back to Pending.
  pub fn recover_stale(&self) -> StoreResult<usize> {
    let n = self.store.reset_processing()?;
    if n > 0 {
      warn!(count = n, "reverted interrupted queue items to pending");
      self.refresh_status();
    }
    Ok(n)
  }
}

impl<S: PersistentStore> Clone for MutationQueue<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      events: self.events.clone(),
      status: Arc::clone(&self.status),
      wake: Arc::clone(&self.wake),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStore;
  use crate::queue::types::Operation;
  use serde_json::json;

  fn queue() -> (MutationQueue<SqliteStore>, Arc<StatusTracker>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let status = Arc::new(StatusTracker::new(true));
    (MutationQueue::new(store, Arc::clone(&status)), status)
  }

  fn item(id: &str) -> NewQueueItem {
    NewQueueItem {
      entity_type: EntityType::Payment,
      entity_id: id.to_string(),
      operation: Operation::Create,
      payload: json!({"amount": 5}),
    }
  }

  #[tokio::test]
  async fn test_every_change_is_broadcast() {
    let (queue, _) = queue();
    let mut events = queue.subscribe();

    let id = queue.enqueue(item("tmp-1")).unwrap();
    assert!(queue.claim(id).unwrap());
    queue
      .update(id, &QueueItemPatch::status(QueueStatus::Failed))
      .unwrap();
    queue.remove(id).unwrap();

    assert_eq!(
      events.recv().await.unwrap(),
      QueueEvent::Enqueued {
        id,
        entity_type: EntityType::Payment
      }
    );
    assert_eq!(
      events.recv().await.unwrap(),
      QueueEvent::Updated {
        id,
        status: QueueStatus::Processing
      }
    );
    assert_eq!(
      events.recv().await.unwrap(),
      QueueEvent::Updated {
        id,
        status: QueueStatus::Failed
      }
    );
    assert_eq!(events.recv().await.unwrap(), QueueEvent::Removed { id });
  }

  #[tokio::test]
  async fn test_status_tracks_counts() {
    let (queue, status) = queue();
    let mut rx = status.subscribe();

    let a = queue.enqueue(item("tmp-1")).unwrap();
    queue.enqueue(item("tmp-2")).unwrap();
    assert_eq!(rx.borrow_and_update().pending_count, 2);

    queue
      .update(a, &QueueItemPatch::status(QueueStatus::Failed))
      .unwrap();
    let snapshot = *rx.borrow_and_update();
    assert_eq!(snapshot.pending_count, 1);
    assert_eq!(snapshot.failed_count, 1);
  }

  #[tokio::test]
  async fn test_enqueue_wakes_worker() {
    let (queue, _) = queue();
    let wake = queue.waker();
    queue.enqueue(item("tmp-1")).unwrap();
    // The permit is stored, so this resolves immediately
    tokio::time::timeout(std::time::Duration::from_secs(1), wake.notified())
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_recover_stale_processing() {
    let (queue, status) = queue();
    let id = queue.enqueue(item("tmp-1")).unwrap();
    queue.claim(id).unwrap();

    assert_eq!(queue.recover_stale().unwrap(), 1);
    let item = queue.get(id).unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(status.current().pending_count, 1);
  }

  #[tokio::test]
  async fn test_withdraw_create_broadcasts_each_removal() {
    let (queue, status) = queue();
    let create = queue.enqueue(item("tmp-1")).unwrap();
    let update = queue
      .enqueue(NewQueueItem {
        operation: Operation::Update,
        ..item("tmp-1")
      })
      .unwrap();
    let mut events = queue.subscribe();

    let withdrawal = queue.withdraw_create(EntityType::Payment, "tmp-1").unwrap();
    assert!(matches!(withdrawal, Withdrawal::Removed(ref items) if items.len() == 2));
    assert_eq!(events.recv().await.unwrap(), QueueEvent::Removed { id: create });
    assert_eq!(events.recv().await.unwrap(), QueueEvent::Removed { id: update });
    assert_eq!(status.current().pending_count, 0);

    assert_eq!(
      queue.withdraw_create(EntityType::Payment, "tmp-1").unwrap(),
      Withdrawal::Nothing
    );
  }
}
